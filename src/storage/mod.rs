/*!
The on-disk half of the engine: blobs, snapshot manifests and shards, the
per-table changelog, and saved application state.

Layout under the store root:

```text
cleanslate/
  snapshots/
    {id}_manifest.json
    {id}_shard_{N}.arrow      new format
    {id}_part_{N}.arrow       legacy, readable; migrated to a manifest
    {id}.arrow                legacy single-file, readable
  changelog/
    {tableId}.jsonl
  state/
    app-state.json
```
*/
pub mod blobs;
pub mod changelog;
pub mod snapshots;
pub mod state;
