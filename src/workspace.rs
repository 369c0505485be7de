/*!
The composition root: one object store, one analytical engine, and the
persistence, timeline and combine engines wired over them, sharing the
structural-operation gate and the replay flag.
*/
use std::sync::Arc;

use anyhow::Result;
use object_store::DynObjectStore;
use uuid::Uuid;

use crate::combine::{CombineEngine, CombineOutcome, JoinRequest, StackRequest};
use crate::config::EngineOptions;
use crate::engine::{SqlEngine, SqlGate};
use crate::error::CancelToken;
use crate::model::command::TimelineParams;
use crate::persist::{HydrationReport, PersistenceEngine};
use crate::timeline::TimelineEngine;

/// Everything a host application needs, wired together.
pub struct Workspace {
    engine: Arc<dyn SqlEngine>,
    persistence: Arc<PersistenceEngine>,
    timeline: Arc<TimelineEngine>,
    combine: Arc<CombineEngine>,
}

impl Workspace {
    /// Wire a workspace over a store and an engine.
    pub fn open(
        store: Arc<DynObjectStore>,
        engine: Arc<dyn SqlEngine>,
        options: EngineOptions,
    ) -> Workspace {
        let persistence = PersistenceEngine::new(store, engine.clone(), options);
        let gate = Arc::new(SqlGate::new());
        let timeline = Arc::new(TimelineEngine::new(
            engine.clone(),
            persistence.snapshots().clone(),
            persistence.registry().clone(),
            persistence.options().clone(),
            persistence.replay_flag(),
            gate.clone(),
        ));
        let combine = Arc::new(CombineEngine::new(
            engine.clone(),
            persistence.snapshots().clone(),
            persistence.registry().clone(),
            persistence.options().clone(),
            gate,
        ));
        Workspace {
            engine,
            persistence,
            timeline,
            combine,
        }
    }

    /// Start background tasks and hydrate from disk.
    pub async fn start(&self) -> Result<HydrationReport> {
        self.persistence.spawn_background();
        self.persistence.hydrate().await
    }

    /// Stack two tables and register the result as a new table with its
    /// own timeline. Dirty sources are flushed first so the combine reads
    /// current snapshots.
    pub async fn stack(
        &self,
        request: &StackRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        self.persistence.saver().flush(&request.left_table_id).await?;
        self.persistence.saver().flush(&request.right_table_id).await?;
        let outcome = self.combine.stack(request, cancel).await?;
        let table_id = Uuid::new_v4().to_string();
        self.persistence
            .register_table(&table_id, &request.result_name)
            .await?;
        let (left_name, right_name) = self.source_names(request.left_table_id.as_str(), request.right_table_id.as_str());
        self.timeline
            .record_command(
                &table_id,
                &format!("Stack {} and {}", left_name, right_name),
                TimelineParams::Stack {
                    left_table: left_name,
                    right_table: right_name,
                },
                Default::default(),
            )
            .await?;
        Ok(outcome)
    }

    /// Join two tables and register the result as a new table with its
    /// own timeline.
    pub async fn join(
        &self,
        request: &JoinRequest,
        cancel: &CancelToken,
    ) -> Result<CombineOutcome> {
        self.persistence.saver().flush(&request.left_table_id).await?;
        self.persistence.saver().flush(&request.right_table_id).await?;
        let outcome = self.combine.join(request, cancel).await?;
        let table_id = Uuid::new_v4().to_string();
        self.persistence
            .register_table(&table_id, &request.result_name)
            .await?;
        let (left_name, right_name) = self.source_names(request.left_table_id.as_str(), request.right_table_id.as_str());
        self.timeline
            .record_command(
                &table_id,
                &format!("Join {} with {}", left_name, right_name),
                TimelineParams::Join {
                    left_table: left_name,
                    right_table: right_name,
                    left_key: request.left_key.clone(),
                    right_key: request.right_key.clone(),
                    join_type: request.join_type,
                },
                Default::default(),
            )
            .await?;
        Ok(outcome)
    }

    fn source_names(&self, left_table_id: &str, right_table_id: &str) -> (String, String) {
        let name_of = |table_id: &str| {
            self.persistence
                .registry()
                .get(table_id)
                .map(|info| info.name)
                .unwrap_or_else(|| table_id.to_string())
        };
        (name_of(left_table_id), name_of(right_table_id))
    }

    /// The analytical engine.
    pub fn engine(&self) -> &Arc<dyn SqlEngine> {
        &self.engine
    }

    /// The persistence engine.
    pub fn persistence(&self) -> &Arc<PersistenceEngine> {
        &self.persistence
    }

    /// The timeline engine.
    pub fn timeline(&self) -> &Arc<TimelineEngine> {
        &self.timeline
    }

    /// The combine engine.
    pub fn combine(&self) -> &Arc<CombineEngine> {
        &self.combine
    }
}
