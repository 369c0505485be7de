/*!
The timeline: a linear history of commands over one table, with
position-indexed step snapshots. Position −1 is the original snapshot;
position `i` is the state after `commands[i]`.
*/
use std::collections::BTreeMap;

use uuid::Uuid;

use super::command::Command;

/// One step snapshot: always cold on disk, sometimes also hot in the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepSnapshot {
    /// `parquet:`-prefixed reference to the cold snapshot.
    pub parquet_id: String,
    /// Name of the duplicated live table, while this step holds the hot slot.
    pub hot_table_name: Option<String>,
}

/// The command history of one table.
#[derive(Clone, Debug)]
pub struct Timeline {
    /// Unique id of the timeline.
    pub id: String,
    /// The table this history belongs to.
    pub table_id: String,
    /// Human-readable table name at creation time.
    pub table_name: String,
    /// Snapshot of the table before any command; position −1.
    pub original_snapshot_name: String,
    /// The linear history.
    pub commands: Vec<Command>,
    /// −1 = original, `i` = state after `commands[i]`.
    pub current_position: i64,
    /// Step snapshots by position.
    pub snapshots: BTreeMap<i64, StepSnapshot>,
}

impl Timeline {
    /// A fresh timeline positioned at the original snapshot.
    pub fn new(table_id: &str, table_name: &str, original_snapshot_name: &str) -> Self {
        Timeline {
            id: Uuid::new_v4().to_string(),
            table_id: table_id.to_string(),
            table_name: table_name.to_string(),
            original_snapshot_name: original_snapshot_name.to_string(),
            commands: Vec::new(),
            current_position: -1,
            snapshots: BTreeMap::new(),
        }
    }

    /// The command at `position`, if it exists.
    pub fn command_at(&self, position: i64) -> Option<&Command> {
        if position < 0 {
            return None;
        }
        self.commands.get(position as usize)
    }

    /// Whether there is a command to undo.
    pub fn can_undo(&self) -> bool {
        self.current_position >= 0
    }

    /// Whether there is a command to redo.
    pub fn can_redo(&self) -> bool {
        self.current_position + 1 < self.commands.len() as i64
    }

    /// The nearest snapshot position at or before `position`. Falls back to
    /// −1, the original.
    pub fn nearest_snapshot_at_or_before(&self, position: i64) -> i64 {
        self.snapshots
            .range(..=position)
            .next_back()
            .map(|(snapshot_position, _)| *snapshot_position)
            .unwrap_or(-1)
    }

    /// Drop every command strictly after `position`, along with the step
    /// snapshots recorded beyond it. Returns the removed snapshots so the
    /// caller can delete their storage.
    pub fn truncate_after(&mut self, position: i64) -> Vec<StepSnapshot> {
        let keep = (position + 1).max(0) as usize;
        self.commands.truncate(keep);
        let removed_positions: Vec<i64> = self
            .snapshots
            .range(position + 1..)
            .map(|(snapshot_position, _)| *snapshot_position)
            .collect();
        removed_positions
            .into_iter()
            .filter_map(|snapshot_position| self.snapshots.remove(&snapshot_position))
            .collect()
    }

    /// The column order in effect at `position`: the most recent
    /// `column_order_after` at or before it, or None for the registry
    /// default.
    pub fn column_order_at(&self, position: i64) -> Option<&[String]> {
        let mut cursor = position;
        while cursor >= 0 {
            if let Some(order) = self
                .command_at(cursor)
                .and_then(|command| command.column_order_after.as_deref())
            {
                return Some(order);
            }
            cursor -= 1;
        }
        None
    }
}
