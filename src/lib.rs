#![deny(missing_docs)]
/*!
# cleanslate-core

cleanslate-core is the storage and history engine behind a client-side
data-cleaning application. It keeps every user table as a set of fixed-size
columnar shards plus a JSON manifest in an [object_store], journals
fine-grained edits to a per-table changelog, and rebuilds any past state of a
table from a snapshot plus a replayable command history.

The crate is organised bottom-up:

* [storage] — blobs, snapshot manifests and shards, the changelog, app state.
* [engine] — the contract of the embedded analytical engine that actually
  holds live tables, plus an in-memory implementation of it.
* [persist] — hydration on startup, the debounced snapshot scheduler, and
  changelog compaction.
* [timeline] — the per-table command history with fast-path and
  snapshot-replay undo/redo.
* [combine] — shard-by-shard UNION and equi-join over tables whose data may
  live only on disk.

[Workspace] wires the pieces together over one store and one engine.
*/
pub mod combine;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod persist;
pub mod storage;
pub mod timeline;

mod workspace;

pub use workspace::Workspace;

pub use object_store;
