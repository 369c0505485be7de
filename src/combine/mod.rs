/*!
The combine engine: UNION (stack) and equi-join over two source tables,
either of which may be frozen — registered with metadata only, rows living
in shards on disk. Neither source is ever materialized in full; work
proceeds shard by shard, and peak engine memory stays near one shard per
source plus the output shard being assembled.
*/
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineOptions;
use crate::engine::{SqlEngine, SqlGate};
use crate::model::manifest::{ShardInfo, SnapshotManifest};
use crate::model::{
    is_reserved_column, new_origin_id, normalize_name, CellValue, Row, CS_ID_COLUMN,
    CS_ORIGIN_ID_COLUMN,
};
use crate::persist::registry::{TableInfo, TableRegistry, TableResidency};
use crate::storage::snapshots::SnapshotStore;

mod join;
mod stack;

pub use join::JoinRequest;
pub use stack::StackRequest;

/// What a combine produced.
#[derive(Clone, Debug)]
pub struct CombineOutcome {
    /// Storage name of the result table, live in the engine.
    pub table: String,
    /// Rows in the result.
    pub rows: u64,
    /// Shards the result snapshot holds.
    pub shards: usize,
    /// The result's columns, reserved columns included.
    pub columns: Vec<String>,
}

/// Executes stacks and joins shard by shard.
pub struct CombineEngine {
    engine: Arc<dyn SqlEngine>,
    snapshots: Arc<SnapshotStore>,
    registry: Arc<TableRegistry>,
    options: Arc<EngineOptions>,
    gate: Arc<SqlGate>,
}

/// One resolved combine input.
pub(crate) struct CombineSource {
    pub(crate) info: TableInfo,
    pub(crate) snapshot_id: String,
    pub(crate) manifest: SnapshotManifest,
    /// True when the snapshot was exported just for this combine and must
    /// be deleted on completion.
    pub(crate) temporary_snapshot: bool,
}

impl CombineEngine {
    /// A combine engine over the given stores.
    pub fn new(
        engine: Arc<dyn SqlEngine>,
        snapshots: Arc<SnapshotStore>,
        registry: Arc<TableRegistry>,
        options: Arc<EngineOptions>,
        gate: Arc<SqlGate>,
    ) -> Self {
        CombineEngine {
            engine,
            snapshots,
            registry,
            options,
            gate,
        }
    }

    /// Resolve a source: frozen tables use their snapshot directly; live
    /// tables reuse their current snapshot, or get a temporary one
    /// exported when none exists.
    pub(crate) async fn resolve_source(&self, table_id: &str) -> Result<CombineSource> {
        let info = self
            .registry
            .get(table_id)
            .with_context(|| format!("combine source {} is not registered", table_id))?;
        let storage_name = info.storage_name();
        let (snapshot_id, temporary_snapshot) = match info.residency {
            TableResidency::Frozen => (storage_name.clone(), false),
            TableResidency::Thawed => {
                if self.snapshots.snapshot_exists(&storage_name).await? {
                    (storage_name.clone(), false)
                } else {
                    let temp_id = format!("_combine_temp_{}_{}", storage_name, Uuid::new_v4());
                    self.snapshots
                        .export_table_to_snapshot(&storage_name, &temp_id, None)
                        .await?;
                    (temp_id.to_lowercase(), true)
                }
            }
        };
        let manifest = self
            .snapshots
            .read_manifest(&snapshot_id)
            .await?
            .ok_or(crate::error::IntegrityError::MissingSnapshot {
                snapshot_id: snapshot_id.clone(),
            })?;
        Ok(CombineSource {
            info,
            snapshot_id,
            manifest,
            temporary_snapshot,
        })
    }

    /// User-visible columns of a source. Live sources are introspected in
    /// the engine; frozen sources use their manifest, falling back to a
    /// shard-0 probe for legacy manifests that recorded no columns.
    pub(crate) async fn user_columns_of(&self, source: &CombineSource) -> Result<Vec<String>> {
        let all = match source.info.residency {
            TableResidency::Thawed => self.engine.columns(&source.info.storage_name()).await?,
            TableResidency::Frozen => {
                if !source.manifest.columns.is_empty() {
                    source.manifest.columns.clone()
                } else if let Some(shard) = source.manifest.shards.first() {
                    let probe = format!("_combine_temp_cols_{}", Uuid::new_v4());
                    self.snapshots
                        .load_single_shard(&source.snapshot_id, shard, &probe)
                        .await?;
                    let columns = self.engine.columns(&probe).await?;
                    self.engine.drop_table(&probe).await?;
                    columns
                } else {
                    Vec::new()
                }
            }
        };
        Ok(all
            .into_iter()
            .filter(|name| !is_reserved_column(name))
            .collect())
    }

    /// Read one shard of a source into a scratch table, hand its rows
    /// back, and evict the scratch table.
    pub(crate) async fn read_shard_rows(
        &self,
        source: &CombineSource,
        shard: &ShardInfo,
    ) -> Result<Vec<Row>> {
        let temp = format!("_combine_temp_shard_{}", Uuid::new_v4());
        self.snapshots
            .load_single_shard(&source.snapshot_id, shard, &temp)
            .await?;
        let rows = self.engine.read_rows(&temp).await?;
        self.engine.drop_table(&temp).await?;
        Ok(rows)
    }

    /// Drop the active table from the engine for the duration of a combine
    /// when it is not itself a source, freeing its working-set memory.
    /// Never releases a source: dropping one mid-operation would corrupt
    /// the result.
    pub(crate) async fn release_active_table(
        &self,
        source_table_ids: &[&str],
    ) -> Result<Option<TableInfo>> {
        let active = match self.registry.active() {
            Some(active) => active,
            None => return Ok(None),
        };
        if source_table_ids.contains(&active.table_id.as_str()) {
            return Ok(None);
        }
        let storage_name = active.storage_name();
        if !self.snapshots.snapshot_exists(&storage_name).await? {
            // No snapshot to restore from; keep it resident.
            return Ok(None);
        }
        self.engine.drop_table(&storage_name).await?;
        self.registry
            .set_residency(&active.table_id, TableResidency::Frozen);
        debug!(table_id = %active.table_id, "released active table for combine");
        Ok(Some(active))
    }

    /// Undo [release_active_table](Self::release_active_table).
    pub(crate) async fn restore_active_table(&self, released: Option<TableInfo>) -> Result<()> {
        let info = match released {
            Some(info) => info,
            None => return Ok(()),
        };
        let storage_name = info.storage_name();
        self.snapshots
            .import_table_from_snapshot(&storage_name, &storage_name)
            .await?;
        self.registry
            .set_residency(&info.table_id, TableResidency::Thawed);
        self.registry.set_active(Some(&info.table_id));
        debug!(table_id = %info.table_id, "restored active table after combine");
        Ok(())
    }

    /// Delete the temporary snapshots of resolved sources.
    pub(crate) async fn cleanup_sources(&self, sources: &[&CombineSource]) {
        for source in sources {
            if source.temporary_snapshot {
                if let Err(err) = self.snapshots.delete_snapshot(&source.snapshot_id).await {
                    tracing::warn!(
                        snapshot_id = %source.snapshot_id,
                        error = %err,
                        "failed to delete temporary combine snapshot"
                    );
                }
            }
        }
    }

    /// Import the finished result snapshot into the engine and report.
    pub(crate) async fn finish_result(
        &self,
        manifest: &SnapshotManifest,
        columns: Vec<String>,
    ) -> Result<CombineOutcome> {
        let table = manifest.snapshot_id.clone();
        let rows = self
            .snapshots
            .import_table_from_snapshot(&table, &table)
            .await?;
        self.engine.checkpoint().await?;
        info!(
            %table,
            rows,
            shards = manifest.shards.len(),
            "combine result materialized"
        );
        Ok(CombineOutcome {
            table,
            rows,
            shards: manifest.shards.len(),
            columns,
        })
    }
}

/// Accumulates output rows, stamps fresh row identities, and spills one
/// full shard at a time; rows from different sources never share identity.
pub(crate) struct OutputWriter<'a> {
    combine: &'a CombineEngine,
    manifest: SnapshotManifest,
    columns: Vec<String>,
    buffer: Vec<Row>,
    next_cs_id: i64,
}

impl<'a> OutputWriter<'a> {
    /// A writer for a result snapshot with the given user columns.
    pub(crate) fn new(
        combine: &'a CombineEngine,
        result_name: &str,
        user_columns: &[String],
    ) -> Self {
        let mut columns = vec![CS_ID_COLUMN.to_string(), CS_ORIGIN_ID_COLUMN.to_string()];
        columns.extend(user_columns.iter().cloned());
        let result_id = normalize_name(result_name);
        let manifest = SnapshotManifest::new(
            &result_id,
            combine.options.shard_size as u32,
            columns.clone(),
        );
        OutputWriter {
            combine,
            manifest,
            columns,
            buffer: Vec::new(),
            next_cs_id: combine.options.cs_id_step,
        }
    }

    /// Stamp a fresh `_cs_id` and `_cs_origin_id` onto a user row and
    /// queue it.
    pub(crate) fn push(&mut self, mut row: Row) {
        row.insert(CS_ID_COLUMN.to_string(), CellValue::from(self.next_cs_id));
        row.insert(
            CS_ORIGIN_ID_COLUMN.to_string(),
            CellValue::from(new_origin_id()),
        );
        self.next_cs_id += self.combine.options.cs_id_step;
        self.buffer.push(row);
    }

    /// Spill every full shard in the buffer.
    pub(crate) async fn flush_full_shards(&mut self) -> Result<()> {
        let shard_size = self.combine.options.shard_size;
        while self.buffer.len() >= shard_size {
            let rest = self.buffer.split_off(shard_size);
            let full = std::mem::replace(&mut self.buffer, rest);
            self.write_shard(full).await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Spill the remainder and commit the manifest.
    pub(crate) async fn finish(mut self) -> Result<SnapshotManifest> {
        self.flush_full_shards().await?;
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.write_shard(rest).await?;
        }
        self.manifest.validate()?;
        self.combine.snapshots.write_manifest(&self.manifest).await?;
        Ok(self.manifest)
    }

    async fn write_shard(&mut self, rows: Vec<Row>) -> Result<()> {
        let temp = format!("_combine_temp_out_{}", Uuid::new_v4());
        self.combine.engine.create_table(&temp, &self.columns).await?;
        self.combine.engine.append_rows(&temp, rows).await?;
        let index = self.manifest.shards.len() as u32;
        let shard = self
            .combine
            .snapshots
            .export_single_shard(&temp, &self.manifest.snapshot_id, index)
            .await?;
        self.combine.engine.drop_table(&temp).await?;
        self.manifest.push_shard(shard);
        Ok(())
    }
}

/// Clean up after a failed or cancelled combine: any partial result files
/// and temporary source snapshots.
pub(crate) async fn abort_cleanup(
    combine: &CombineEngine,
    result_name: &str,
    sources: &[&CombineSource],
) {
    let result_id = normalize_name(result_name);
    if let Err(err) = combine.snapshots.delete_snapshot(&result_id).await {
        tracing::warn!(%result_id, error = %err, "failed to remove partial combine result");
    }
    combine.cleanup_sources(sources).await;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use object_store::memory::InMemory;

    use crate::engine::memory::test_support::seed_table;
    use crate::engine::memory::MemoryEngine;
    use crate::storage::blobs::BlobStore;

    use super::*;

    /// A combine engine over a fresh in-memory stack.
    pub(crate) struct CombineFixture {
        pub(crate) combine: CombineEngine,
        pub(crate) engine: Arc<MemoryEngine>,
        pub(crate) snapshots: Arc<SnapshotStore>,
        pub(crate) registry: Arc<TableRegistry>,
    }

    /// Build a fixture with the given shard size.
    pub(crate) async fn combine_fixture(shard_size: usize) -> CombineFixture {
        let engine = Arc::new(MemoryEngine::new());
        let blobs = Arc::new(BlobStore::new(Arc::new(InMemory::new())));
        let options = Arc::new(EngineOptions {
            shard_size,
            ..EngineOptions::default()
        });
        let snapshots = Arc::new(SnapshotStore::new(blobs, engine.clone(), options.clone()));
        let registry = Arc::new(TableRegistry::new());
        let combine = CombineEngine::new(
            engine.clone(),
            snapshots.clone(),
            registry.clone(),
            options,
            Arc::new(SqlGate::new()),
        );
        CombineFixture {
            combine,
            engine,
            snapshots,
            registry,
        }
    }

    /// Seed a table, snapshot it, and leave it frozen (dropped from the
    /// engine) so the combine must work from shards.
    pub(crate) async fn freeze_seeded(
        fixture: &CombineFixture,
        table_id: &str,
        name: &str,
        columns: &[&str],
        values: &[Vec<CellValue>],
    ) {
        let storage = normalize_name(name);
        seed_table(&fixture.engine, &storage, columns, values)
            .await
            .expect("seed table");
        fixture
            .snapshots
            .export_table_to_snapshot(&storage, &storage, None)
            .await
            .expect("export snapshot");
        fixture
            .engine
            .drop_table(&storage)
            .await
            .expect("drop live table");
        fixture.registry.register(TableInfo {
            table_id: table_id.to_string(),
            name: name.to_string(),
            residency: TableResidency::Frozen,
            row_count: Some(values.len() as u64),
            columns: Vec::new(),
        });
    }
}
