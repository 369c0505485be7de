/*!
Compaction: periodically folds each table's changelog into a fresh snapshot
and clears the log, so replay-on-startup stays short.

The advisory lock is cooperative and best-effort — in the browser original
it was a cross-tab `navigator.locks` claim; here it is a trait so hosts can
plug in whatever scope they need, with an in-process default.
*/
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineOptions;
use crate::engine::SqlEngine;
use crate::model::STAGING_TABLE_PREFIX;
use crate::storage::changelog::ChangelogStore;
use crate::storage::snapshots::SnapshotStore;

use super::registry::{TableRegistry, TableResidency};
use super::saver::SaveScheduler;
use super::PersistEvent;

/// Advisory, best-effort mutual exclusion around a compaction sweep.
#[async_trait]
pub trait CompactionLock: Send + Sync {
    /// Try to take the lock; None means another holder has it and this
    /// sweep should be skipped. Dropping the returned guard releases it.
    async fn try_acquire(&self) -> Option<Box<dyn Send>>;
}

/// In-process [CompactionLock]; the default when no cross-process scope is
/// needed.
#[derive(Default)]
pub struct LocalLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl LocalLock {
    /// A fresh lock.
    pub fn new() -> Self {
        LocalLock::default()
    }
}

#[async_trait]
impl CompactionLock for LocalLock {
    async fn try_acquire(&self) -> Option<Box<dyn Send>> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| Box::new(guard) as Box<dyn Send>)
    }
}

/// Tracks when the user last did anything, for the idle trigger.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<std::sync::Mutex<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        ActivityTracker {
            last: Arc::new(std::sync::Mutex::new(Instant::now())),
        }
    }
}

impl ActivityTracker {
    /// A tracker starting now.
    pub fn new() -> Self {
        ActivityTracker::default()
    }

    /// Note user activity.
    pub fn touch(&self) {
        *self.last.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// Time since the last noted activity.
    pub fn idle_for(&self) -> std::time::Duration {
        Instant::now().duration_since(*self.last.lock().expect("activity lock poisoned"))
    }
}

/// Folds changelogs into snapshots.
pub struct Compactor {
    engine: Arc<dyn SqlEngine>,
    snapshots: Arc<SnapshotStore>,
    changelog: Arc<ChangelogStore>,
    registry: Arc<TableRegistry>,
    saver: Arc<SaveScheduler>,
    options: Arc<EngineOptions>,
    lock: Arc<dyn CompactionLock>,
    activity: ActivityTracker,
    events: broadcast::Sender<PersistEvent>,
}

impl Compactor {
    /// A compactor over the given stores.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn SqlEngine>,
        snapshots: Arc<SnapshotStore>,
        changelog: Arc<ChangelogStore>,
        registry: Arc<TableRegistry>,
        saver: Arc<SaveScheduler>,
        options: Arc<EngineOptions>,
        lock: Arc<dyn CompactionLock>,
        activity: ActivityTracker,
        events: broadcast::Sender<PersistEvent>,
    ) -> Self {
        Compactor {
            engine,
            snapshots,
            changelog,
            registry,
            saver,
            options,
            lock,
            activity,
            events,
        }
    }

    /// One sweep: for every thawed table with journaled entries and no
    /// in-flight save or staging state, export a fresh snapshot, clear the
    /// log, and arm the recently-saved window. Returns tables compacted.
    pub async fn run_once(&self) -> Result<usize> {
        let _guard = match self.lock.try_acquire().await {
            Some(guard) => guard,
            None => {
                debug!("compaction lock busy; skipping sweep");
                return Ok(0);
            }
        };
        let mut compacted = 0;
        for table_id in self.changelog.table_ids_with_entries().await? {
            let info = match self.registry.get(&table_id) {
                Some(info) => info,
                // A log with no table is handled by the deletion watcher.
                None => continue,
            };
            if info.residency != TableResidency::Thawed {
                continue;
            }
            if self.saver.save_in_progress(&table_id) {
                continue;
            }
            let storage_name = info.storage_name();
            let staging = format!("{}{}", STAGING_TABLE_PREFIX, storage_name);
            if self.engine.table_exists(&staging).await? {
                debug!(%table_id, "skipping compaction; transform staging in flight");
                continue;
            }
            match self
                .snapshots
                .export_table_to_snapshot(&storage_name, &storage_name, None)
                .await
            {
                Ok(manifest) => {
                    self.changelog.clear(&table_id).await?;
                    self.registry
                        .set_row_count(&table_id, Some(manifest.total_rows));
                    self.saver.note_saved(&table_id);
                    compacted += 1;
                }
                Err(err) => {
                    warn!(%table_id, error = %err, "compaction export failed");
                }
            }
        }
        if compacted > 0 {
            info!(tables = compacted, "compacted changelogs into snapshots");
            let _ = self.events.send(PersistEvent::CompactionCompleted {
                tables: compacted,
            });
        }
        Ok(compacted)
    }

    /// Whether the changelog volume alone warrants an immediate sweep.
    pub async fn over_entry_threshold(&self) -> bool {
        match self.changelog.total_count().await {
            Ok(total) => total >= self.options.compaction_entry_threshold,
            Err(_) => false,
        }
    }

    /// Run sweeps forever: on the fixed interval, and early once the user
    /// has been idle past the idle window.
    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tick = this
                .options
                .compaction_interval
                .min(this.options.compaction_idle);
            let mut last_sweep = Instant::now();
            loop {
                tokio::time::sleep(tick).await;
                let interval_due =
                    Instant::now().duration_since(last_sweep) >= this.options.compaction_interval;
                let idle_due = this.activity.idle_for() >= this.options.compaction_idle;
                if !interval_due && !idle_due {
                    continue;
                }
                let has_entries = this
                    .changelog
                    .total_count()
                    .await
                    .map(|total| total > 0)
                    .unwrap_or(false);
                if !has_entries {
                    continue;
                }
                if let Err(err) = this.run_once().await {
                    warn!(error = %err, "compaction sweep failed");
                }
                last_sweep = Instant::now();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    use crate::engine::memory::test_support::seed_table;
    use crate::engine::memory::MemoryEngine;
    use crate::model::changelog::ChangeEntry;
    use crate::model::CellValue;
    use crate::persist::registry::TableInfo;
    use crate::storage::blobs::BlobStore;

    use super::*;

    struct Fixture {
        compactor: Arc<Compactor>,
        changelog: Arc<ChangelogStore>,
        snapshots: Arc<SnapshotStore>,
        engine: Arc<MemoryEngine>,
        registry: Arc<TableRegistry>,
        saver: Arc<SaveScheduler>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MemoryEngine::new());
        let blobs = Arc::new(BlobStore::new(Arc::new(InMemory::new())));
        let options = Arc::new(EngineOptions::default());
        let snapshots = Arc::new(SnapshotStore::new(
            blobs.clone(),
            engine.clone(),
            options.clone(),
        ));
        let changelog = Arc::new(ChangelogStore::new(blobs));
        let registry = Arc::new(TableRegistry::new());
        let (sender, _) = broadcast::channel(64);
        let saver = Arc::new(SaveScheduler::new(
            snapshots.clone(),
            changelog.clone(),
            registry.clone(),
            options.clone(),
            sender.clone(),
            Arc::new(AtomicBool::new(false)),
        ));
        let compactor = Arc::new(Compactor::new(
            engine.clone(),
            snapshots.clone(),
            changelog.clone(),
            registry.clone(),
            saver.clone(),
            options,
            Arc::new(LocalLock::new()),
            ActivityTracker::new(),
            sender,
        ));
        Fixture {
            compactor,
            changelog,
            snapshots,
            engine,
            registry,
            saver,
        }
    }

    async fn register_seeded(fixture: &Fixture, table_id: &str, name: &str) {
        let values: Vec<Vec<CellValue>> = vec![vec![json!("a")], vec![json!("b")]];
        seed_table(
            &fixture.engine,
            &crate::model::normalize_name(name),
            &["v"],
            &values,
        )
        .await
        .expect("seed table");
        fixture.registry.register(TableInfo {
            table_id: table_id.to_string(),
            name: name.to_string(),
            residency: TableResidency::Thawed,
            row_count: Some(2),
            columns: Vec::new(),
        });
    }

    #[tokio::test]
    async fn test_compaction_exports_and_clears_log() -> Result<()> {
        let fixture = fixture().await;
        register_seeded(&fixture, "t1", "Sales").await;
        fixture
            .engine
            .update_cell("sales", 100, "v", &json!("edited"))
            .await?;
        fixture
            .changelog
            .append(&ChangeEntry::cell_edit("t1", 100, "v", json!("a"), json!("edited")))
            .await?;
        let compacted = fixture.compactor.run_once().await?;
        assert_eq!(compacted, 1);
        assert_eq!(fixture.changelog.count("t1").await?, 0);
        // The snapshot holds the edited value.
        let rows = fixture
            .snapshots
            .import_table_from_snapshot("sales", "check")
            .await?;
        assert_eq!(rows, 2);
        let cell = fixture.engine.read_cell("check", 100, "v").await?;
        assert_eq!(cell, Some(json!("edited")));
        // The recently-saved window is armed.
        assert!(!fixture.saver.is_dirty("t1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_frozen_and_staging_tables_are_skipped() -> Result<()> {
        let fixture = fixture().await;
        register_seeded(&fixture, "t1", "Frozen One").await;
        fixture
            .registry
            .set_residency("t1", TableResidency::Frozen);
        fixture
            .changelog
            .append(&ChangeEntry::cell_edit("t1", 100, "v", json!("a"), json!("b")))
            .await?;
        register_seeded(&fixture, "t2", "Staged").await;
        fixture
            .changelog
            .append(&ChangeEntry::cell_edit("t2", 100, "v", json!("a"), json!("b")))
            .await?;
        fixture
            .engine
            .create_table("_staging_staged", &["_cs_id".to_string()])
            .await?;
        let compacted = fixture.compactor.run_once().await?;
        assert_eq!(compacted, 0);
        assert_eq!(fixture.changelog.count("t1").await?, 1);
        assert_eq!(fixture.changelog.count("t2").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_contention_skips_sweep() -> Result<()> {
        let fixture = fixture().await;
        register_seeded(&fixture, "t1", "Sales").await;
        fixture
            .changelog
            .append(&ChangeEntry::cell_edit("t1", 100, "v", json!("a"), json!("b")))
            .await?;
        let held = fixture
            .compactor
            .lock
            .try_acquire()
            .await
            .expect("first acquire");
        assert_eq!(fixture.compactor.run_once().await?, 0);
        drop(held);
        assert_eq!(fixture.compactor.run_once().await?, 1);
        Ok(())
    }
}
