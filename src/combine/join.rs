/*!
Sharded equi-join, index first: scan each source once to build a tiny
`(cs_id, key, shard)` index, join the two indexes, then hydrate output
shards one at a time, loading only the source shards (and only the rows)
each output slice actually touches.

SQL NULL semantics hold throughout: a NULL key never matches anything, and
the surviving key column is `COALESCE(left, right)` so FULL OUTER rows keep
their key whichever side they came from.
*/
use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::error::CancelToken;
use crate::model::command::JoinKind;
use crate::model::{row_cs_id, CellValue, Row};

use super::{abort_cleanup, CombineEngine, CombineOutcome, CombineSource, OutputWriter};

/// An equi-join of two tables into a new one.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    /// Left source table id.
    pub left_table_id: String,
    /// Right source table id.
    pub right_table_id: String,
    /// Join key column on the left side.
    pub left_key: String,
    /// Join key column on the right side.
    pub right_key: String,
    /// Join flavor.
    pub join_type: JoinKind,
    /// Name of the result table.
    pub result_name: String,
}

/// One indexed source row: everything the index join needs, nothing more.
struct IndexEntry {
    cs_id: i64,
    /// Canonical encoding of the key; None is SQL NULL and never matches.
    key: Option<String>,
    shard: u32,
}

/// One row of the match table, as offsets into the two indexes.
struct MatchEntry {
    left: Option<usize>,
    right: Option<usize>,
}

impl CombineEngine {
    /// Join two tables. The result lands live in the engine under the
    /// normalized result name, with a committed snapshot on disk.
    pub async fn join(
        &self,
        request: &JoinRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        let _gate = self.gate.lock().await;
        let released = self
            .release_active_table(&[
                request.left_table_id.as_str(),
                request.right_table_id.as_str(),
            ])
            .await?;
        let result = self.join_inner(request, cancel).await;
        self.restore_active_table(released).await?;
        result
    }

    async fn join_inner(
        &self,
        request: &JoinRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        let left = self.resolve_source(&request.left_table_id).await?;
        let right = self.resolve_source(&request.right_table_id).await?;
        let sources = [&left, &right];
        match self.join_sources(request, cancel, &left, &right).await {
            Ok(outcome) => {
                self.cleanup_sources(&sources).await;
                Ok(outcome)
            }
            Err(err) => {
                abort_cleanup(self, &request.result_name, &sources).await;
                Err(err)
            }
        }
    }

    async fn join_sources(
        &self,
        request: &JoinRequest,
        cancel: &CancelToken,
        left: &CombineSource,
        right: &CombineSource,
    ) -> Result<CombineOutcome> {
        let left_user = self.user_columns_of(left).await?;
        let right_user = self.user_columns_of(right).await?;
        if !left_user.contains(&request.left_key) {
            return Err(anyhow!(
                "left table has no column {} to join on",
                request.left_key
            ));
        }
        if !right_user.contains(&request.right_key) {
            return Err(anyhow!(
                "right table has no column {} to join on",
                request.right_key
            ));
        }
        // The key survives once, under the left name; colliding right
        // columns get a deterministic suffix.
        let mut result_columns = left_user.clone();
        let mut right_output: Vec<(String, String)> = Vec::new();
        for column in &right_user {
            if column == &request.right_key {
                continue;
            }
            let target = if result_columns.contains(column) {
                format!("{}_2", column)
            } else {
                column.clone()
            };
            result_columns.push(target.clone());
            right_output.push((column.clone(), target));
        }

        // Phase 1: one scan per source, three values per row.
        let left_index = self.build_index(left, &request.left_key, cancel).await?;
        let right_index = self.build_index(right, &request.right_key, cancel).await?;
        debug!(
            left_rows = left_index.len(),
            right_rows = right_index.len(),
            "join indexes built"
        );

        // Phase 2: join the indexes, then let the engine shed memory.
        let matches = index_join(&left_index, &right_index, request.join_type);
        self.engine.checkpoint().await?;
        info!(
            left = %left.info.name,
            right = %right.info.name,
            matches = matches.len(),
            join = ?request.join_type,
            "index join complete"
        );
        let mut writer = OutputWriter::new(self, &request.result_name, &result_columns);
        if matches.is_empty() {
            // Nothing to hydrate; commit the empty result with its schema.
            let manifest = writer.finish().await?;
            let columns = manifest.columns.clone();
            return self.finish_result(&manifest, columns).await;
        }

        // Phase 3: hydrate one output shard at a time.
        for chunk in matches.chunks(self.options.shard_size) {
            cancel.check()?;
            let left_rows = self
                .load_chunk_rows(left, &left_index, chunk.iter().filter_map(|entry| entry.left))
                .await?;
            let right_rows = self
                .load_chunk_rows(
                    right,
                    &right_index,
                    chunk.iter().filter_map(|entry| entry.right),
                )
                .await?;
            for entry in chunk {
                let left_row = match entry.left {
                    Some(index) => Some(
                        left_rows
                            .get(&left_index[index].cs_id)
                            .with_context(|| {
                                format!(
                                    "row {} missing from {}",
                                    left_index[index].cs_id, left.snapshot_id
                                )
                            })?,
                    ),
                    None => None,
                };
                let right_row = match entry.right {
                    Some(index) => Some(
                        right_rows
                            .get(&right_index[index].cs_id)
                            .with_context(|| {
                                format!(
                                    "row {} missing from {}",
                                    right_index[index].cs_id, right.snapshot_id
                                )
                            })?,
                    ),
                    None => None,
                };
                let key_value = left_row
                    .and_then(|row| row.get(&request.left_key))
                    .filter(|value| !value.is_null())
                    .cloned()
                    .or_else(|| {
                        right_row
                            .and_then(|row| row.get(&request.right_key))
                            .cloned()
                    })
                    .unwrap_or(CellValue::Null);
                let mut out = Row::new();
                for column in &left_user {
                    let value = if column == &request.left_key {
                        key_value.clone()
                    } else {
                        left_row
                            .and_then(|row| row.get(column))
                            .cloned()
                            .unwrap_or(CellValue::Null)
                    };
                    out.insert(column.clone(), value);
                }
                for (source_column, target_column) in &right_output {
                    let value = right_row
                        .and_then(|row| row.get(source_column))
                        .cloned()
                        .unwrap_or(CellValue::Null);
                    out.insert(target_column.clone(), value);
                }
                writer.push(out);
            }
            writer.flush_full_shards().await?;
            tokio::task::yield_now().await;
        }

        // Phase 4: commit and materialize.
        let manifest = writer.finish().await?;
        let columns = manifest.columns.clone();
        self.finish_result(&manifest, columns).await
    }

    async fn build_index(
        &self,
        source: &CombineSource,
        key_column: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<IndexEntry>> {
        let mut index = Vec::new();
        for shard in &source.manifest.shards {
            cancel.check()?;
            for row in self.read_shard_rows(source, shard).await? {
                let cs_id = row_cs_id(&row).with_context(|| {
                    format!("row without {} in {}", crate::model::CS_ID_COLUMN, source.snapshot_id)
                })?;
                let key = match row.get(key_column) {
                    None | Some(CellValue::Null) => None,
                    Some(value) => Some(serde_json::to_string(value)?),
                };
                index.push(IndexEntry {
                    cs_id,
                    key,
                    shard: shard.index,
                });
            }
            tokio::task::yield_now().await;
        }
        Ok(index)
    }

    /// Load the rows one output chunk needs from one side: only the shards
    /// it touches, and from each, only the rows in the chunk.
    async fn load_chunk_rows(
        &self,
        source: &CombineSource,
        index: &[IndexEntry],
        selected: impl Iterator<Item = usize>,
    ) -> Result<HashMap<i64, Row>> {
        let mut ids_by_shard: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
        for position in selected {
            let entry = &index[position];
            ids_by_shard.entry(entry.shard).or_default().push(entry.cs_id);
        }
        let mut rows = HashMap::new();
        for (shard_index, ids) in ids_by_shard {
            let shard = source
                .manifest
                .shards
                .get(shard_index as usize)
                .with_context(|| {
                    format!("shard {} missing from {}", shard_index, source.snapshot_id)
                })?;
            let temp = format!("_combine_temp_shard_{}", uuid::Uuid::new_v4());
            self.snapshots
                .load_single_shard(&source.snapshot_id, shard, &temp)
                .await?;
            let fetched = self.engine.read_rows_by_ids(&temp, &ids).await?;
            self.engine.drop_table(&temp).await?;
            for row in fetched {
                let cs_id = row_cs_id(&row)
                    .with_context(|| format!("row without id in {}", source.snapshot_id))?;
                rows.insert(cs_id, row);
            }
            tokio::task::yield_now().await;
        }
        Ok(rows)
    }
}

/// The index join: left rows in order (matched, then per-flavor
/// unmatched), then for FULL OUTER the never-matched right rows.
fn index_join(left: &[IndexEntry], right: &[IndexEntry], kind: JoinKind) -> Vec<MatchEntry> {
    let mut right_by_key: HashMap<&str, Vec<usize>> = HashMap::new();
    for (position, entry) in right.iter().enumerate() {
        if let Some(key) = &entry.key {
            right_by_key.entry(key.as_str()).or_default().push(position);
        }
    }
    let mut right_matched = vec![false; right.len()];
    let mut matches = Vec::new();
    for (left_position, entry) in left.iter().enumerate() {
        let found = entry
            .key
            .as_deref()
            .and_then(|key| right_by_key.get(key));
        match found {
            Some(positions) => {
                for &right_position in positions {
                    right_matched[right_position] = true;
                    matches.push(MatchEntry {
                        left: Some(left_position),
                        right: Some(right_position),
                    });
                }
            }
            None => {
                if kind != JoinKind::Inner {
                    matches.push(MatchEntry {
                        left: Some(left_position),
                        right: None,
                    });
                }
            }
        }
    }
    if kind == JoinKind::Full {
        for (right_position, matched) in right_matched.iter().enumerate() {
            if !matched {
                matches.push(MatchEntry {
                    left: None,
                    right: Some(right_position),
                });
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::combine::test_support::{combine_fixture, freeze_seeded, CombineFixture};
    use crate::engine::SqlEngine;
    use crate::model::{CS_ID_COLUMN, CS_ORIGIN_ID_COLUMN};

    use super::*;

    async fn seed_join_pair(fixture: &CombineFixture) {
        freeze_seeded(
            fixture,
            "l",
            "L",
            &["k", "x"],
            &[vec![json!(1), json!("a")], vec![json!(2), json!("b")]],
        )
        .await;
        freeze_seeded(
            fixture,
            "r",
            "R",
            &["k", "y"],
            &[vec![json!(2), json!("u")], vec![json!(3), json!("v")]],
        )
        .await;
    }

    fn request(kind: JoinKind, result: &str) -> JoinRequest {
        JoinRequest {
            left_table_id: "l".to_string(),
            right_table_id: "r".to_string(),
            left_key: "k".to_string(),
            right_key: "k".to_string(),
            join_type: kind,
            result_name: result.to_string(),
        }
    }

    #[tokio::test]
    async fn test_inner_join_on_frozen_sources() -> Result<()> {
        let fixture = combine_fixture(50).await;
        seed_join_pair(&fixture).await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Inner, "Joined"), &CancelToken::new())
            .await?;
        assert_eq!(outcome.rows, 1);
        assert_eq!(
            outcome.columns,
            vec![
                CS_ID_COLUMN.to_string(),
                CS_ORIGIN_ID_COLUMN.to_string(),
                "k".to_string(),
                "x".to_string(),
                "y".to_string()
            ]
        );
        let rows = fixture.engine.read_rows("joined").await?;
        assert_eq!(rows[0].get("k"), Some(&json!(2)));
        assert_eq!(rows[0].get("x"), Some(&json!("b")));
        assert_eq!(rows[0].get("y"), Some(&json!("u")));
        // Identities are newly assigned.
        assert_eq!(rows[0].get(CS_ID_COLUMN), Some(&json!(100)));
        assert!(rows[0].get(CS_ORIGIN_ID_COLUMN).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_full_outer_join_coalesces_keys() -> Result<()> {
        let fixture = combine_fixture(50).await;
        seed_join_pair(&fixture).await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Full, "Joined"), &CancelToken::new())
            .await?;
        assert_eq!(outcome.rows, 3);
        let rows = fixture.engine.read_rows("joined").await?;
        // Left order first (k=1 unmatched, k=2 matched), right-only last.
        assert_eq!(rows[0].get("k"), Some(&json!(1)));
        assert_eq!(rows[0].get("y"), Some(&CellValue::Null));
        assert_eq!(rows[1].get("k"), Some(&json!(2)));
        assert_eq!(rows[2].get("k"), Some(&json!(3)));
        assert_eq!(rows[2].get("x"), Some(&CellValue::Null));
        assert_eq!(rows[2].get("y"), Some(&json!("v")));
        Ok(())
    }

    #[tokio::test]
    async fn test_left_join_multiplies_matches() -> Result<()> {
        let fixture = combine_fixture(50).await;
        freeze_seeded(&fixture, "l", "L", &["k", "x"], &[vec![json!(2), json!("b")]]).await;
        freeze_seeded(
            &fixture,
            "r",
            "R",
            &["k", "y"],
            &[vec![json!(2), json!("u")], vec![json!(2), json!("w")]],
        )
        .await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Left, "Joined"), &CancelToken::new())
            .await?;
        assert_eq!(outcome.rows, 2);
        let rows = fixture.engine.read_rows("joined").await?;
        assert_eq!(rows[0].get("y"), Some(&json!("u")));
        assert_eq!(rows[1].get("y"), Some(&json!("w")));
        Ok(())
    }

    #[tokio::test]
    async fn test_inner_join_with_no_matches_yields_empty_schema() -> Result<()> {
        let fixture = combine_fixture(50).await;
        freeze_seeded(&fixture, "l", "L", &["k", "x"], &[vec![json!(1), json!("a")]]).await;
        freeze_seeded(&fixture, "r", "R", &["k", "y"], &[vec![json!(9), json!("v")]]).await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Inner, "Joined"), &CancelToken::new())
            .await?;
        assert_eq!(outcome.rows, 0);
        assert_eq!(outcome.shards, 0);
        assert!(fixture.engine.table_exists("joined").await?);
        let columns = fixture.engine.columns("joined").await?;
        assert!(columns.contains(&"k".to_string()));
        assert!(columns.contains(&"x".to_string()));
        assert!(columns.contains(&"y".to_string()));
        assert_eq!(fixture.engine.row_count("joined").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_null_keys_never_match() -> Result<()> {
        let fixture = combine_fixture(50).await;
        freeze_seeded(
            &fixture,
            "l",
            "L",
            &["k", "x"],
            &[vec![CellValue::Null, json!("a")]],
        )
        .await;
        freeze_seeded(
            &fixture,
            "r",
            "R",
            &["k", "y"],
            &[vec![CellValue::Null, json!("v")]],
        )
        .await;
        let inner = fixture
            .combine
            .join(&request(JoinKind::Inner, "Inner"), &CancelToken::new())
            .await?;
        assert_eq!(inner.rows, 0);
        let full = fixture
            .combine
            .join(&request(JoinKind::Full, "Full"), &CancelToken::new())
            .await?;
        // Both null-keyed rows survive, unmatched.
        assert_eq!(full.rows, 2);
        let rows = fixture.engine.read_rows("full").await?;
        assert_eq!(rows[0].get("x"), Some(&json!("a")));
        assert_eq!(rows[0].get("y"), Some(&CellValue::Null));
        assert_eq!(rows[1].get("x"), Some(&CellValue::Null));
        assert_eq!(rows[1].get("y"), Some(&json!("v")));
        Ok(())
    }

    #[tokio::test]
    async fn test_colliding_right_column_gets_suffix() -> Result<()> {
        let fixture = combine_fixture(50).await;
        freeze_seeded(&fixture, "l", "L", &["k", "x"], &[vec![json!(1), json!("lx")]]).await;
        freeze_seeded(&fixture, "r", "R", &["k", "x"], &[vec![json!(1), json!("rx")]]).await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Inner, "Joined"), &CancelToken::new())
            .await?;
        assert!(outcome.columns.contains(&"x".to_string()));
        assert!(outcome.columns.contains(&"x_2".to_string()));
        let rows = fixture.engine.read_rows("joined").await?;
        assert_eq!(rows[0].get("x"), Some(&json!("lx")));
        assert_eq!(rows[0].get("x_2"), Some(&json!("rx")));
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_shard_join_hydrates_per_output_shard() -> Result<()> {
        // Shard size 2: both sources span shards, and so does the output.
        let fixture = combine_fixture(2).await;
        let left: Vec<Vec<CellValue>> =
            (0..6).map(|n| vec![json!(n), json!(format!("l{}", n))]).collect();
        let right: Vec<Vec<CellValue>> =
            (0..6).rev().map(|n| vec![json!(n), json!(format!("r{}", n))]).collect();
        freeze_seeded(&fixture, "l", "L", &["k", "x"], &left).await;
        freeze_seeded(&fixture, "r", "R", &["k", "y"], &right).await;
        let outcome = fixture
            .combine
            .join(&request(JoinKind::Inner, "Joined"), &CancelToken::new())
            .await?;
        assert_eq!(outcome.rows, 6);
        assert_eq!(outcome.shards, 3);
        let manifest = fixture
            .snapshots
            .read_manifest("joined")
            .await?
            .expect("result manifest");
        manifest.validate()?;
        let rows = fixture.engine.read_rows("joined").await?;
        for row in &rows {
            let key = row.get("k").and_then(CellValue::as_i64).expect("key");
            assert_eq!(row.get("x"), Some(&json!(format!("l{}", key))));
            assert_eq!(row.get("y"), Some(&json!(format!("r{}", key))));
        }
        Ok(())
    }
}
