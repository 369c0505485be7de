/*!
Sharded UNION: project each source shard onto the union schema with NULL
padding, stamp fresh row identities, and spill full output shards as they
accumulate. Peak engine memory is one input shard plus the output buffer.
*/
use anyhow::Result;
use itertools::Itertools;
use tracing::info;

use crate::error::CancelToken;
use crate::model::{CellValue, Row};

use super::{abort_cleanup, CombineEngine, CombineOutcome, CombineSource, OutputWriter};

/// A stack (UNION) of two tables into a new one.
#[derive(Clone, Debug)]
pub struct StackRequest {
    /// Upper source table id.
    pub left_table_id: String,
    /// Lower source table id.
    pub right_table_id: String,
    /// Name of the result table.
    pub result_name: String,
}

impl CombineEngine {
    /// Stack two tables. The result lands live in the engine under the
    /// normalized result name, with a committed snapshot on disk.
    pub async fn stack(
        &self,
        request: &StackRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        let _gate = self.gate.lock().await;
        let released = self
            .release_active_table(&[
                request.left_table_id.as_str(),
                request.right_table_id.as_str(),
            ])
            .await?;
        let result = self.stack_inner(request, cancel).await;
        self.restore_active_table(released).await?;
        result
    }

    async fn stack_inner(
        &self,
        request: &StackRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        let left = self.resolve_source(&request.left_table_id).await?;
        let right = self.resolve_source(&request.right_table_id).await?;
        let sources = [&left, &right];
        match self.stack_sources(request, cancel, &left, &right).await {
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

    async fn stack_sources(
        &self,
        request: &StackRequest,
        cancel: &CancelToken,
        left: &CombineSource,
        right: &CombineSource,
    ) -> Result<CombineOutcome> {
        let left_columns = self.user_columns_of(left).await?;
        let right_columns = self.user_columns_of(right).await?;
        let union_columns: Vec<String> = left_columns
            .iter()
            .chain(right_columns.iter())
            .unique()
            .cloned()
            .collect();
        info!(
            left = %left.info.name,
            right = %right.info.name,
            columns = union_columns.len(),
            "stacking tables"
        );
        let mut writer = OutputWriter::new(self, &request.result_name, &union_columns);
        for source in [left, right] {
            for shard in &source.manifest.shards {
                cancel.check()?;
                let rows = self.read_shard_rows(source, shard).await?;
                for row in rows {
                    let mut projected = Row::new();
                    for column in &union_columns {
                        let value = row.get(column).cloned().unwrap_or(CellValue::Null);
                        projected.insert(column.clone(), value);
                    }
                    writer.push(projected);
                }
                writer.flush_full_shards().await?;
                tokio::task::yield_now().await;
            }
        }
        let manifest = writer.finish().await?;
        let columns = manifest.columns.clone();
        self.finish_result(&manifest, columns).await
    }
}
