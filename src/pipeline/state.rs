// PipelineState - process-wide run state shared by the orchestrator and checkpoint writer
use super::stage::StageDefinition;
use super::store::ItemStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// One per run. Owned by the orchestrator; the checkpoint writer only snapshots it.
#[derive(Clone)]
pub struct PipelineState {
    /// Fresh for every process run, including resumed ones
    pub run_id: Uuid,
    /// Run id of the checkpoint this run resumed from, if any
    pub resumed_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub retry_epoch: u64,
    pub store: Arc<ItemStore>,
}

impl PipelineState {
    pub fn new(store: Arc<ItemStore>, retry_epoch: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            resumed_from: None,
            started_at: Utc::now(),
            retry_epoch,
            store,
        }
    }

    pub fn resumed_from(mut self, run_id: Uuid) -> Self {
        self.resumed_from = Some(run_id);
        self
    }

    pub fn stages(&self) -> &[StageDefinition] {
        self.store.stages()
    }
}
