/*!
Step snapshots, in their two physical forms: a cold manifest+shard set on
disk, and at most one hot duplicate of the live table inside the engine —
a one-slot LRU that makes undoing the most recent expensive command an
in-engine table copy instead of a disk load.
*/
use anyhow::Result;
use tracing::debug;

use crate::model::timeline::{StepSnapshot, Timeline};
use crate::model::{parquet_ref, strip_parquet_ref, HOT_TABLE_PREFIX};

use super::TimelineEngine;

impl TimelineEngine {
    /// Snapshot the live table at the timeline's current position, before
    /// an expensive command runs. The cold form is exported to disk
    /// (position −1 reuses the original snapshot); the hot form replaces
    /// any other hot snapshot the timeline holds.
    pub(super) async fn create_step_snapshot(
        &self,
        timeline: &mut Timeline,
        live: &str,
    ) -> Result<()> {
        let position = timeline.current_position;
        let cold_id = if position < 0 {
            timeline.original_snapshot_name.clone()
        } else {
            let cold_id = format!("snapshot_{}_{}", timeline.id, position);
            if !self.snapshots.snapshot_exists(&cold_id).await? {
                self.snapshots
                    .export_table_to_snapshot(live, &cold_id, None)
                    .await?;
            }
            cold_id
        };
        let stale_hot: Vec<String> = timeline
            .snapshots
            .values_mut()
            .filter_map(|snapshot| snapshot.hot_table_name.take())
            .collect();
        for hot in stale_hot {
            self.engine.drop_table(&hot).await?;
        }
        let hot_name = format!("{}{}_{}", HOT_TABLE_PREFIX, timeline.id, position);
        self.engine.drop_table(&hot_name).await?;
        self.engine.duplicate_table(live, &hot_name).await?;
        timeline.snapshots.insert(
            position,
            StepSnapshot {
                parquet_id: parquet_ref(&cold_id),
                hot_table_name: Some(hot_name),
            },
        );
        debug!(timeline_id = %timeline.id, position, "step snapshot created");
        Ok(())
    }

    /// Destroy a step snapshot discarded by a redo-branch truncation. The
    /// original snapshot is never deleted here; it still backs position −1.
    pub(super) async fn discard_step_snapshot(&self, snapshot: &StepSnapshot) {
        if let Some(hot) = &snapshot.hot_table_name {
            if let Err(err) = self.engine.drop_table(hot).await {
                tracing::warn!(hot = hot.as_str(), error = %err, "failed to drop hot snapshot");
            }
        }
        let cold_id = strip_parquet_ref(&snapshot.parquet_id);
        if cold_id.starts_with("original_") {
            return;
        }
        if let Err(err) = self.snapshots.delete_snapshot(cold_id).await {
            tracing::warn!(cold_id, error = %err, "failed to delete step snapshot");
        }
    }

    /// Restore a step snapshot into the live table, preferring the hot
    /// form. Returns true when the hot copy was used.
    pub(super) async fn restore_step_snapshot(
        &self,
        snapshot: &StepSnapshot,
        live: &str,
    ) -> Result<bool> {
        if let Some(hot) = &snapshot.hot_table_name {
            if self.engine.table_exists(hot).await? {
                self.engine.drop_table(live).await?;
                self.engine.duplicate_table(hot, live).await?;
                return Ok(true);
            }
        }
        self.snapshots
            .import_table_from_snapshot(strip_parquet_ref(&snapshot.parquet_id), live)
            .await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::engine::SqlEngine;
    use crate::timeline::test_support::{fixture_with_rows, merge_params};

    #[tokio::test]
    async fn test_one_hot_snapshot_per_timeline() -> Result<()> {
        let fixture = fixture_with_rows(6).await;
        for row in [600, 500, 400] {
            fixture
                .timeline
                .record_command("t1", "Merge rows", merge_params(&[row]), Default::default())
                .await?;
            fixture.engine.delete_rows("sales", &[row]).await?;
        }
        let timeline = fixture.timeline.timeline("t1").await.expect("timeline");
        // Three step snapshots (positions -1, 0, 1), one hot slot.
        assert_eq!(timeline.snapshots.len(), 3);
        let hot: Vec<_> = timeline
            .snapshots
            .iter()
            .filter_map(|(position, snapshot)| {
                snapshot.hot_table_name.as_ref().map(|name| (*position, name.clone()))
            })
            .collect();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].0, 1);
        assert!(fixture.engine.table_exists(&hot[0].1).await?);
        // Cold forms exist for the non-original steps.
        for (position, snapshot) in &timeline.snapshots {
            if *position >= 0 {
                let cold = crate::model::strip_parquet_ref(&snapshot.parquet_id);
                assert!(fixture.snapshots.snapshot_exists(cold).await?);
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cold_form_survives_hot_eviction() -> Result<()> {
        let fixture = fixture_with_rows(4).await;
        fixture
            .timeline
            .record_command("t1", "Merge rows", merge_params(&[400]), Default::default())
            .await?;
        fixture.engine.delete_rows("sales", &[400]).await?;
        let first_hot = {
            let timeline = fixture.timeline.timeline("t1").await.expect("timeline");
            timeline
                .snapshots
                .values()
                .find_map(|snapshot| snapshot.hot_table_name.clone())
                .expect("hot exists")
        };
        fixture
            .timeline
            .record_command("t1", "Merge rows", merge_params(&[300]), Default::default())
            .await?;
        fixture.engine.delete_rows("sales", &[300]).await?;
        // The first hot slot was evicted; its cold form still restores.
        assert!(!fixture.engine.table_exists(&first_hot).await?);
        let timeline = fixture.timeline.timeline("t1").await.expect("timeline");
        let evicted = timeline.snapshots.get(&-1).expect("original step");
        assert!(evicted.hot_table_name.is_none());
        assert!(fixture
            .snapshots
            .snapshot_exists("original_sales")
            .await?);
        Ok(())
    }
}
