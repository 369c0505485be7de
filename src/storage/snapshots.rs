/*!
The manifest & shard store: every snapshot is N fixed-size shards plus one
JSON manifest, written shards-first so the manifest's presence commits the
snapshot, and deleted manifest-last so a partial deletion still reads.

Also owns the legacy-migration path: snapshots written before the manifest
format (`{id}_part_{N}.arrow` and single-file `{id}.arrow`) get a manifest
synthesized at startup with the unknown-count sentinel, and stay readable
through their original file names.
*/
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::config::EngineOptions;
use crate::engine::SqlEngine;
use crate::error::IntegrityError;
use crate::model::manifest::{
    legacy_single_file_name, manifest_file_name, shard_file_name, ShardInfo, SnapshotManifest,
};
use crate::model::is_reserved_snapshot_id;

use super::blobs::{BlobStore, FileEntry, SNAPSHOTS_DIR, TMP_SUFFIX};

lazy_static! {
    static ref SHARD_FILE: Regex = Regex::new(r"^(.+)_shard_(\d+)\.arrow$").unwrap();
    static ref LEGACY_PART_FILE: Regex = Regex::new(r"^(.+)_part_(\d+)\.arrow$").unwrap();
    static ref MANIFEST_FILE: Regex = Regex::new(r"^(.+)_manifest\.json$").unwrap();
    static ref SINGLE_FILE: Regex = Regex::new(r"^(.+)\.arrow$").unwrap();
}

/// Per-shard progress callback for long exports.
pub type ShardProgress<'a> = &'a (dyn Fn(u32) + Send + Sync);

/// What the startup cleanup removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Orphaned temp files removed.
    pub temp_files: usize,
    /// Zero-byte files removed.
    pub corrupt_files: usize,
    /// Snapshots removed because they duplicated another id by case only.
    pub case_duplicates: usize,
}

/// Reads and writes snapshots as manifest + shards.
#[derive(Clone)]
pub struct SnapshotStore {
    blobs: Arc<BlobStore>,
    engine: Arc<dyn SqlEngine>,
    options: Arc<EngineOptions>,
}

impl SnapshotStore {
    /// A store over the given blobs and engine.
    pub fn new(
        blobs: Arc<BlobStore>,
        engine: Arc<dyn SqlEngine>,
        options: Arc<EngineOptions>,
    ) -> Self {
        SnapshotStore {
            blobs,
            engine,
            options,
        }
    }

    /// Stream a live table into a snapshot. Shards are written first, each
    /// atomically; the manifest goes last as the commit marker. Re-exports
    /// over an existing id leave no stale files behind.
    pub async fn export_table_to_snapshot(
        &self,
        table: &str,
        snapshot_id: &str,
        on_shard: Option<ShardProgress<'_>>,
    ) -> Result<SnapshotManifest> {
        let snapshot_id = snapshot_id.to_lowercase();
        let columns = self.engine.columns(table).await?;
        let mut manifest =
            SnapshotManifest::new(&snapshot_id, self.options.shard_size as u32, columns);
        let mut shards = self
            .engine
            .export_shards(table, self.options.shard_size)
            .await?;
        let mut index = 0u32;
        while let Some(shard) = shards.try_next().await? {
            let file_name = shard_file_name(&snapshot_id, index);
            self.blobs
                .write_file(SNAPSHOTS_DIR, &file_name, shard.bytes.clone())
                .await?;
            manifest.push_shard(ShardInfo {
                index,
                file_name,
                row_count: shard.row_count,
                byte_size: shard.bytes.len() as u64,
                min_cs_id: shard.min_cs_id,
                max_cs_id: shard.max_cs_id,
            });
            if let Some(progress) = on_shard {
                progress(index);
            }
            index += 1;
            tokio::task::yield_now().await;
        }
        manifest.validate()?;
        self.write_manifest(&manifest).await?;
        if let Err(err) = self.remove_stale_files(&manifest).await {
            warn!(%snapshot_id, error = %err, "failed to remove stale snapshot files");
        }
        info!(
            table,
            %snapshot_id,
            rows = manifest.total_rows,
            shards = manifest.shards.len(),
            "exported snapshot"
        );
        Ok(manifest)
    }

    /// Load a snapshot's shards, in order, into a named engine table.
    /// Enforces `_cs_id` monotonicity across shard boundaries. Returns the
    /// rows loaded.
    pub async fn import_table_from_snapshot(
        &self,
        snapshot_id: &str,
        target: &str,
    ) -> Result<u64> {
        let snapshot_id = snapshot_id.to_lowercase();
        let manifest = self
            .read_manifest(&snapshot_id)
            .await?
            .ok_or(IntegrityError::MissingSnapshot {
                snapshot_id: snapshot_id.clone(),
            })?;
        manifest.validate()?;
        self.engine.drop_table(target).await?;
        if manifest.shards.is_empty() {
            self.engine.create_table(target, &manifest.columns).await?;
            return Ok(0);
        }
        let mut previous_max: Option<i64> = None;
        let mut total = 0u64;
        for shard in &manifest.shards {
            let bytes = self
                .blobs
                .read_file(SNAPSHOTS_DIR, &shard.file_name)
                .await?
                .ok_or_else(|| IntegrityError::CorruptSnapshot {
                    snapshot_id: snapshot_id.clone(),
                    reason: format!("shard file {} is missing", shard.file_name),
                })?;
            let imported = self.engine.import_shard(target, bytes).await?;
            if shard.row_count != 0 && imported.row_count != shard.row_count {
                return Err(IntegrityError::CorruptSnapshot {
                    snapshot_id: snapshot_id.clone(),
                    reason: format!(
                        "shard {} holds {} rows, manifest says {}",
                        shard.index, imported.row_count, shard.row_count
                    ),
                }
                .into());
            }
            if let (Some(previous), Some(min)) = (previous_max, imported.min_cs_id) {
                if min <= previous {
                    return Err(IntegrityError::CorruptSnapshot {
                        snapshot_id: snapshot_id.clone(),
                        reason: format!("_cs_id order breaks at shard {}", shard.index),
                    }
                    .into());
                }
            }
            previous_max = imported.max_cs_id.or(previous_max);
            total += imported.row_count;
            tokio::task::yield_now().await;
        }
        if !manifest.has_unknown_counts() && total != manifest.total_rows {
            return Err(IntegrityError::CorruptSnapshot {
                snapshot_id: snapshot_id.clone(),
                reason: format!(
                    "loaded {} rows, manifest says {}",
                    total, manifest.total_rows
                ),
            }
            .into());
        }
        Ok(total)
    }

    /// Load one shard of a snapshot into a named engine table, replacing
    /// it. Returns the rows loaded.
    pub async fn load_single_shard(
        &self,
        snapshot_id: &str,
        shard: &ShardInfo,
        target: &str,
    ) -> Result<u64> {
        let snapshot_id = snapshot_id.to_lowercase();
        let bytes = self
            .blobs
            .read_file(SNAPSHOTS_DIR, &shard.file_name)
            .await?
            .ok_or_else(|| IntegrityError::CorruptSnapshot {
                snapshot_id: snapshot_id.clone(),
                reason: format!("shard file {} is missing", shard.file_name),
            })?;
        self.engine.drop_table(target).await?;
        let imported = self.engine.import_shard(target, bytes).await?;
        Ok(imported.row_count)
    }

    /// Export an entire (shard-sized) table as shard `index` of a snapshot
    /// being assembled piecewise. The caller writes the manifest once all
    /// shards are in place.
    pub async fn export_single_shard(
        &self,
        table: &str,
        snapshot_id: &str,
        index: u32,
    ) -> Result<ShardInfo> {
        let snapshot_id = snapshot_id.to_lowercase();
        let mut shards = self.engine.export_shards(table, usize::MAX).await?;
        let shard = shards
            .try_next()
            .await?
            .with_context(|| format!("exporting empty table {} as a shard", table))?;
        let file_name = shard_file_name(&snapshot_id, index);
        self.blobs
            .write_file(SNAPSHOTS_DIR, &file_name, shard.bytes.clone())
            .await?;
        Ok(ShardInfo {
            index,
            file_name,
            row_count: shard.row_count,
            byte_size: shard.bytes.len() as u64,
            min_cs_id: shard.min_cs_id,
            max_cs_id: shard.max_cs_id,
        })
    }

    /// Read a snapshot's manifest; None when the snapshot does not exist.
    pub async fn read_manifest(&self, snapshot_id: &str) -> Result<Option<SnapshotManifest>> {
        let snapshot_id = snapshot_id.to_lowercase();
        let name = manifest_file_name(&snapshot_id);
        let bytes = match self.blobs.read_file(SNAPSHOTS_DIR, &name).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let manifest =
            serde_json::from_slice(&bytes).map_err(|err| IntegrityError::CorruptSnapshot {
                snapshot_id: snapshot_id.clone(),
                reason: format!("manifest does not parse: {}", err),
            })?;
        Ok(Some(manifest))
    }

    /// Write a manifest, atomically. The id inside the manifest is already
    /// lowercase by construction.
    pub async fn write_manifest(&self, manifest: &SnapshotManifest) -> Result<()> {
        let name = manifest_file_name(&manifest.snapshot_id);
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.blobs
            .write_file(SNAPSHOTS_DIR, &name, bytes.into())
            .await
    }

    /// Whether a snapshot exists, in either the manifest or a legacy form.
    pub async fn snapshot_exists(&self, snapshot_id: &str) -> Result<bool> {
        let snapshot_id = snapshot_id.to_lowercase();
        if self
            .blobs
            .read_file(SNAPSHOTS_DIR, &manifest_file_name(&snapshot_id))
            .await?
            .is_some()
        {
            return Ok(true);
        }
        let legacy = self.legacy_files_of(&snapshot_id).await?;
        Ok(!legacy.is_empty())
    }

    /// Delete a snapshot: shards first, manifest last, so a crash mid-way
    /// leaves a snapshot that still reads.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.delete_snapshot_files(&snapshot_id.to_lowercase()).await
    }

    /// Snapshot ids that belong to user tables: every manifest on disk
    /// whose id does not carry a reserved prefix.
    pub async fn list_user_snapshot_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.blobs.list_files(SNAPSHOTS_DIR, None).await? {
            if let Some(captures) = MANIFEST_FILE.captures(&entry.name) {
                let id = captures[1].to_string();
                if !is_reserved_snapshot_id(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Remove debris a crash can leave behind: orphaned temp files,
    /// zero-byte shards and manifests, and snapshots duplicating another id
    /// by letter case only.
    pub async fn startup_cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let entries = self.blobs.list_files(SNAPSHOTS_DIR, None).await?;
        for entry in &entries {
            if entry.name.ends_with(TMP_SUFFIX) {
                self.blobs.delete_file(SNAPSHOTS_DIR, &entry.name).await?;
                report.temp_files += 1;
            } else if entry.size == 0 {
                warn!(file = %entry.name, "removing zero-byte snapshot file");
                self.blobs.delete_file(SNAPSHOTS_DIR, &entry.name).await?;
                report.corrupt_files += 1;
            }
        }
        // Recovery from an earlier bug that wrote ids without case folding:
        // when two manifests differ only by case, keep the lowercase one.
        let mut by_folded: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &entries {
            if let Some(captures) = MANIFEST_FILE.captures(&entry.name) {
                let id = captures[1].to_string();
                by_folded.entry(id.to_lowercase()).or_default().push(id);
            }
        }
        for (folded, mut ids) in by_folded {
            if ids.len() < 2 {
                continue;
            }
            ids.sort();
            let keep = if ids.contains(&folded) {
                folded.clone()
            } else {
                ids[0].clone()
            };
            for id in ids {
                if id != keep {
                    self.delete_snapshot_files(&id).await?;
                    report.case_duplicates += 1;
                }
            }
        }
        if report != CleanupReport::default() {
            info!(
                temp_files = report.temp_files,
                corrupt_files = report.corrupt_files,
                case_duplicates = report.case_duplicates,
                "snapshot cleanup"
            );
        }
        Ok(report)
    }

    /// Synthesize manifests for snapshots that predate the manifest format.
    /// Metadata only — no re-export; the shards keep their legacy file
    /// names and the unknown-count sentinel until the next real export.
    pub async fn migrate_legacy_snapshots(&self) -> Result<Vec<String>> {
        let entries = self.blobs.list_files(SNAPSHOTS_DIR, None).await?;
        let mut manifests = std::collections::HashSet::new();
        for entry in &entries {
            if let Some(captures) = MANIFEST_FILE.captures(&entry.name) {
                manifests.insert(captures[1].to_string());
            }
        }
        // Parts grouped by id, then bare single-file snapshots.
        let mut parts: BTreeMap<String, Vec<(u32, FileEntry)>> = BTreeMap::new();
        let mut singles: Vec<FileEntry> = Vec::new();
        for entry in &entries {
            if entry.name.ends_with(TMP_SUFFIX) || SHARD_FILE.is_match(&entry.name) {
                continue;
            }
            if let Some(captures) = LEGACY_PART_FILE.captures(&entry.name) {
                let id = captures[1].to_string();
                let index: u32 = captures[2].parse().unwrap_or(0);
                parts.entry(id).or_default().push((index, entry.clone()));
            } else if SINGLE_FILE.is_match(&entry.name) {
                singles.push(entry.clone());
            }
        }
        let mut migrated = Vec::new();
        for (id, mut files) in parts {
            if manifests.contains(&id) {
                continue;
            }
            files.sort_by_key(|(index, _)| *index);
            let mut manifest =
                SnapshotManifest::new(&id, self.options.shard_size as u32, Vec::new());
            for (position, (_, file)) in files.into_iter().enumerate() {
                manifest.shards.push(ShardInfo {
                    index: position as u32,
                    file_name: file.name,
                    row_count: 0,
                    byte_size: file.size,
                    min_cs_id: 0,
                    max_cs_id: 0,
                });
                manifest.total_bytes += file.size;
            }
            self.write_manifest(&manifest).await?;
            migrated.push(id);
        }
        for file in singles {
            let id = match SINGLE_FILE.captures(&file.name) {
                Some(captures) => captures[1].to_string(),
                None => continue,
            };
            if manifests.contains(&id) || migrated.contains(&id) {
                continue;
            }
            let mut manifest =
                SnapshotManifest::new(&id, self.options.shard_size as u32, Vec::new());
            manifest.shards.push(ShardInfo {
                index: 0,
                file_name: legacy_single_file_name(&id),
                row_count: 0,
                byte_size: file.size,
                min_cs_id: 0,
                max_cs_id: 0,
            });
            manifest.total_bytes = file.size;
            self.write_manifest(&manifest).await?;
            migrated.push(id);
        }
        if !migrated.is_empty() {
            info!(count = migrated.len(), "migrated legacy snapshots to manifests");
        }
        Ok(migrated)
    }

    async fn delete_snapshot_files(&self, snapshot_id: &str) -> Result<()> {
        let manifest_name = manifest_file_name(snapshot_id);
        for entry in self
            .blobs
            .list_files(SNAPSHOTS_DIR, Some(&format!("{}_", snapshot_id)))
            .await?
        {
            if entry.name == manifest_name {
                continue;
            }
            if Self::file_belongs_to(&entry.name, snapshot_id) {
                self.blobs.delete_file(SNAPSHOTS_DIR, &entry.name).await?;
            }
        }
        self.blobs
            .delete_file(SNAPSHOTS_DIR, &legacy_single_file_name(snapshot_id))
            .await?;
        self.blobs.delete_file(SNAPSHOTS_DIR, &manifest_name).await
    }

    async fn remove_stale_files(&self, manifest: &SnapshotManifest) -> Result<()> {
        let id = &manifest.snapshot_id;
        let current = manifest.shards.len() as u32;
        for entry in self
            .blobs
            .list_files(SNAPSHOTS_DIR, Some(&format!("{}_", id)))
            .await?
        {
            if let Some(captures) = SHARD_FILE.captures(&entry.name) {
                if &captures[1] == id {
                    let index: u32 = captures[2].parse().unwrap_or(0);
                    if index >= current {
                        self.blobs.delete_file(SNAPSHOTS_DIR, &entry.name).await?;
                    }
                }
                continue;
            }
            if let Some(captures) = LEGACY_PART_FILE.captures(&entry.name) {
                if &captures[1] == id {
                    self.blobs.delete_file(SNAPSHOTS_DIR, &entry.name).await?;
                }
            }
        }
        self.blobs
            .delete_file(SNAPSHOTS_DIR, &legacy_single_file_name(id))
            .await
    }

    async fn legacy_files_of(&self, snapshot_id: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in self
            .blobs
            .list_files(SNAPSHOTS_DIR, Some(snapshot_id))
            .await?
        {
            if let Some(captures) = LEGACY_PART_FILE.captures(&entry.name) {
                if &captures[1] == snapshot_id {
                    found.push(entry.name);
                }
            } else if entry.name == legacy_single_file_name(snapshot_id) {
                found.push(entry.name);
            }
        }
        Ok(found)
    }

    fn file_belongs_to(file_name: &str, snapshot_id: &str) -> bool {
        for pattern in [&*SHARD_FILE, &*LEGACY_PART_FILE] {
            if let Some(captures) = pattern.captures(file_name) {
                return &captures[1] == snapshot_id;
            }
        }
        false
    }
}
