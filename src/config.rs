/*!
Tuning knobs for the persistence and combine engines.

All of the scheduler windows scale with table size: a debounced save on a
small table fires after two seconds of quiet, while a million-row table gets
up to ten seconds so that continuous editing does not trigger back-to-back
multi-second exports.
*/
use std::time::Duration;

/// Tunables shared by every component of the engine.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Rows per snapshot shard.
    pub shard_size: usize,
    /// Gap between consecutive `_cs_id` values, leaving room for insertions.
    pub cs_id_step: i64,
    /// Row count at which a table is considered large for scheduling.
    pub large_table_rows: u64,
    /// Debounce window for structural saves on an empty table.
    pub debounce: Duration,
    /// Debounce window at and above [EngineOptions::large_table_rows].
    pub debounce_large: Duration,
    /// Upper bound on how long a dirty table may go unsaved under
    /// continuous editing.
    pub max_wait: Duration,
    /// Max wait at and above [EngineOptions::large_table_rows].
    pub max_wait_large: Duration,
    /// Window after a save during which redundant debounced saves are
    /// suppressed.
    pub recently_saved: Duration,
    /// Recently-saved window at and above [EngineOptions::large_table_rows].
    pub recently_saved_large: Duration,
    /// Period of the background compaction sweep.
    pub compaction_interval: Duration,
    /// Changelog entry count that triggers an immediate compaction sweep.
    pub compaction_entry_threshold: usize,
    /// User idle time that triggers a compaction sweep.
    pub compaction_idle: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            shard_size: 50_000,
            cs_id_step: 100,
            large_table_rows: 1_000_000,
            debounce: Duration::from_secs(2),
            debounce_large: Duration::from_secs(10),
            max_wait: Duration::from_secs(15),
            max_wait_large: Duration::from_secs(45),
            recently_saved: Duration::from_secs(5),
            recently_saved_large: Duration::from_secs(10),
            compaction_interval: Duration::from_secs(10),
            compaction_entry_threshold: 1_000,
            compaction_idle: Duration::from_secs(30),
        }
    }
}

impl EngineOptions {
    /// Debounce window for a table with `rows` rows.
    pub fn debounce_for(&self, rows: u64) -> Duration {
        scale(self.debounce, self.debounce_large, rows, self.large_table_rows)
    }

    /// Max wait for a table with `rows` rows.
    pub fn max_wait_for(&self, rows: u64) -> Duration {
        scale(self.max_wait, self.max_wait_large, rows, self.large_table_rows)
    }

    /// Recently-saved suppression window for a table with `rows` rows.
    pub fn recently_saved_for(&self, rows: u64) -> Duration {
        scale(
            self.recently_saved,
            self.recently_saved_large,
            rows,
            self.large_table_rows,
        )
    }
}

fn scale(base: Duration, cap: Duration, rows: u64, large: u64) -> Duration {
    if large == 0 || rows >= large {
        return cap;
    }
    let extra = cap.saturating_sub(base).as_millis() as u64;
    base + Duration::from_millis(extra * rows / large)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_scale_with_row_count() {
        let options = EngineOptions::default();
        assert_eq!(options.debounce_for(0), Duration::from_secs(2));
        assert_eq!(options.debounce_for(2_000_000), Duration::from_secs(10));
        let mid = options.debounce_for(500_000);
        assert!(mid > Duration::from_secs(2) && mid < Duration::from_secs(10));
        assert_eq!(options.max_wait_for(1_000_000), Duration::from_secs(45));
    }
}
