/*!
The heavy path: restore the nearest snapshot at or before the target
position, then re-apply commands forward. While a replay is running the
shared replay flag is up, so the persistence engine ignores the transient
intermediate states it would otherwise try to save.
*/
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::error::ReplayError;
use crate::model::command::{Command, TimelineParams};
use crate::model::timeline::Timeline;
use crate::model::{new_origin_id, CellValue, Row, CS_ID_COLUMN, CS_ORIGIN_ID_COLUMN};

use super::TimelineEngine;

struct ReplayGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReplayGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ReplayGuard { flag }
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl TimelineEngine {
    /// Restore the nearest snapshot at or before `target`, replay the
    /// commands beyond it, and move the position. A command that fails to
    /// apply aborts with a [ReplayError] naming it; the live table is left
    /// at the restored snapshot with the earlier commands applied.
    pub(super) async fn replay_to_position(
        &self,
        timeline: &mut Timeline,
        live: &str,
        target: i64,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        let _replaying = ReplayGuard::raise(self.replaying.as_ref());
        let snapshot_position = timeline.nearest_snapshot_at_or_before(target);
        match timeline.snapshots.get(&snapshot_position).cloned() {
            Some(step) => {
                let hot = self.restore_step_snapshot(&step, live).await?;
                debug!(
                    timeline_id = %timeline.id,
                    snapshot_position,
                    hot,
                    "restored step snapshot"
                );
            }
            None => {
                // Nothing recorded at or before the target: position −1,
                // the original.
                self.snapshots
                    .import_table_from_snapshot(&timeline.original_snapshot_name, live)
                    .await?;
            }
        }
        for position in (snapshot_position + 1)..=target {
            let command = timeline
                .command_at(position)
                .cloned()
                .with_context(|| format!("timeline has no command at {}", position))?;
            if let Err(err) = self.apply_command(live, &command).await {
                return Err(ReplayError {
                    position,
                    label: command.label.clone(),
                    reason: format!("{:#}", err),
                }
                .into());
            }
        }
        timeline.current_position = target;
        debug!(timeline_id = %timeline.id, target, "replay complete");
        Ok(())
    }

    async fn apply_command(&self, live: &str, command: &Command) -> Result<()> {
        match &command.params {
            TimelineParams::Transform {
                transform_type,
                column,
                options,
            } => {
                let runner = self
                    .runner()
                    .context("no transform runner registered for replay")?;
                runner
                    .run_transform(live, transform_type, column.as_deref(), options)
                    .await
            }
            TimelineParams::ManualEdit {
                row_id,
                column,
                new_value,
                ..
            } => {
                self.engine
                    .update_cell(live, *row_id, column, new_value)
                    .await?;
                Ok(())
            }
            TimelineParams::BatchEdit { edits } => {
                for edit in edits {
                    self.engine
                        .update_cell(live, edit.row_id, &edit.column, &edit.new_value)
                        .await?;
                }
                Ok(())
            }
            TimelineParams::Standardize { column, mapping } => {
                let pairs: Vec<(CellValue, CellValue)> = mapping
                    .iter()
                    .map(|entry| (entry.from.clone(), entry.to.clone()))
                    .collect();
                self.engine.apply_value_map(live, column, &pairs).await?;
                Ok(())
            }
            TimelineParams::Merge { removed_cs_ids } => {
                self.engine.delete_rows(live, removed_cs_ids).await?;
                Ok(())
            }
            TimelineParams::InsertRow {
                new_cs_id,
                insert_after_cs_id: _,
                ..
            } => {
                self.engine
                    .shift_cs_ids(live, *new_cs_id, self.options.cs_id_step)
                    .await?;
                let mut row = Row::new();
                row.insert(CS_ID_COLUMN.to_string(), CellValue::from(*new_cs_id));
                // Row identity is reborn on replay.
                row.insert(
                    CS_ORIGIN_ID_COLUMN.to_string(),
                    CellValue::from(new_origin_id()),
                );
                self.engine.append_rows(live, vec![row]).await
            }
            TimelineParams::DeleteRow { cs_ids, .. } => {
                self.engine.delete_rows(live, cs_ids).await?;
                Ok(())
            }
            TimelineParams::Stack { .. } | TimelineParams::Join { .. } => Err(anyhow!(
                "command creates a new table and cannot be replayed in place"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::engine::memory::MemoryEngine;
    use crate::engine::{SqlEngine, TransformRunner};
    use crate::model::command::ValueMapping;
    use crate::timeline::test_support::{fixture_with_rows, merge_params};
    use crate::timeline::UndoPath;

    use super::*;

    struct UppercaseRunner {
        engine: Arc<MemoryEngine>,
        calls: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl TransformRunner for UppercaseRunner {
        async fn run_transform(
            &self,
            table: &str,
            transform_type: &str,
            column: Option<&str>,
            _options: &BTreeMap<String, CellValue>,
        ) -> Result<()> {
            assert_eq!(transform_type, "uppercase");
            let column = column.context("uppercase needs a column")?;
            *self.calls.lock().expect("call counter") += 1;
            let rows = self.engine.read_rows(table).await?;
            for row in rows {
                if let (Some(cs_id), Some(CellValue::String(text))) =
                    (crate::model::row_cs_id(&row), row.get(column))
                {
                    self.engine
                        .update_cell(table, cs_id, column, &json!(text.to_uppercase()))
                        .await?;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_undo_expensive_command_restores_snapshot() -> Result<()> {
        // Scenario: three expensive merges, then two undos; the second
        // lands exactly on the position-0 step snapshot.
        let fixture = fixture_with_rows(6).await;
        for row in [600, 500, 400] {
            fixture
                .timeline
                .record_command("t1", "Merge rows", merge_params(&[row]), Default::default())
                .await?;
            fixture.engine.delete_rows("sales", &[row]).await?;
        }
        assert_eq!(fixture.engine.row_count("sales").await?, 3);
        assert_eq!(fixture.timeline.undo("t1").await?, UndoPath::Heavy);
        assert_eq!(fixture.engine.row_count("sales").await?, 4);
        assert_eq!(fixture.timeline.undo("t1").await?, UndoPath::Heavy);
        assert_eq!(fixture.engine.row_count("sales").await?, 5);
        let timeline = fixture.timeline.timeline("t1").await.expect("timeline");
        assert_eq!(timeline.current_position, 0);
        // Row 600 is still gone (merge 0 applied), 500 and 400 are back.
        let cell = fixture.engine.read_cell("sales", 500, "a").await?;
        assert!(cell.is_some());
        assert!(fixture.engine.read_cell("sales", 600, "a").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_transform_replayed_through_registered_runner() -> Result<()> {
        let fixture = fixture_with_rows(2).await;
        let runner = Arc::new(UppercaseRunner {
            engine: fixture.engine.clone(),
            calls: std::sync::Mutex::new(0),
        });
        fixture.timeline.set_transform_runner(runner.clone());
        // Run the transform the way the UI would, then record it.
        runner
            .run_transform("sales", "uppercase", Some("a"), &BTreeMap::new())
            .await?;
        fixture
            .timeline
            .record_command(
                "t1",
                "Uppercase a",
                TimelineParams::Transform {
                    transform_type: "uppercase".to_string(),
                    column: Some("a".to_string()),
                    options: BTreeMap::new(),
                },
                Default::default(),
            )
            .await?;
        assert_eq!(
            fixture.engine.read_cell("sales", 100, "a").await?,
            Some(json!("A0"))
        );
        // Undo restores the original; redo re-runs the transform.
        assert_eq!(fixture.timeline.undo("t1").await?, UndoPath::Heavy);
        assert_eq!(
            fixture.engine.read_cell("sales", 100, "a").await?,
            Some(json!("a0"))
        );
        assert_eq!(fixture.timeline.redo("t1").await?, UndoPath::Heavy);
        assert_eq!(
            fixture.engine.read_cell("sales", 100, "a").await?,
            Some(json!("A0"))
        );
        assert_eq!(*runner.calls.lock().expect("call counter"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_standardize_replays_its_stored_mapping() -> Result<()> {
        let fixture = fixture_with_rows(3).await;
        fixture
            .engine
            .apply_value_map("sales", "b", &[(json!("x"), json!("X"))])
            .await?;
        fixture
            .timeline
            .record_command(
                "t1",
                "Standardize b",
                TimelineParams::Standardize {
                    column: "b".to_string(),
                    mapping: vec![ValueMapping {
                        from: json!("x"),
                        to: json!("X"),
                    }],
                },
                Default::default(),
            )
            .await?;
        fixture.timeline.undo("t1").await?;
        assert_eq!(
            fixture.engine.read_cell("sales", 100, "b").await?,
            Some(json!("x"))
        );
        fixture.timeline.redo("t1").await?;
        assert_eq!(
            fixture.engine.read_cell("sales", 100, "b").await?,
            Some(json!("X"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_failure_names_the_offending_command() -> Result<()> {
        let fixture = fixture_with_rows(2).await;
        // A transform with no registered runner cannot replay.
        fixture
            .timeline
            .record_command(
                "t1",
                "Mystery transform",
                TimelineParams::Transform {
                    transform_type: "uppercase".to_string(),
                    column: Some("a".to_string()),
                    options: BTreeMap::new(),
                },
                Default::default(),
            )
            .await?;
        fixture.timeline.undo("t1").await?;
        let err = fixture
            .timeline
            .redo("t1")
            .await
            .expect_err("no runner registered");
        let replay = err
            .downcast_ref::<ReplayError>()
            .expect("replay error kind");
        assert_eq!(replay.position, 0);
        assert_eq!(replay.label, "Mystery transform");
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_flag_raised_during_heavy_path() -> Result<()> {
        let fixture = fixture_with_rows(2).await;
        fixture
            .timeline
            .record_command("t1", "Merge rows", merge_params(&[200]), Default::default())
            .await?;
        fixture.engine.delete_rows("sales", &[200]).await?;
        assert!(!fixture
            .timeline
            .replaying
            .load(std::sync::atomic::Ordering::SeqCst));
        fixture.timeline.undo("t1").await?;
        // Raised only for the duration of the replay.
        assert!(!fixture
            .timeline
            .replaying
            .load(std::sync::atomic::Ordering::SeqCst));
        Ok(())
    }
}
