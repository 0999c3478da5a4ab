// Resumable pipeline engine - item store, workers, checkpointing and orchestration
pub mod checkpoint;
pub mod item;
pub mod orchestrator;
pub mod processor;
pub mod rate_limit;
pub mod report;
pub mod retry;
pub mod stage;
pub mod state;
pub mod store;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointHandle, CheckpointWriter, FlushPolicy};
pub use item::{ArtifactRef, DiscoveredItem, StageFailure, StageState, WorkItem, WorkItemId};
pub use orchestrator::{Orchestrator, RunPhase};
pub use processor::{
    CommandProcessor, CommandSpec, ProcessorRegistry, SkipProcessor, StageOutcome, StageProcessor,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use report::{FailureEntry, RunOutcome, RunReport, StageSummary};
pub use retry::{RetryDecision, RetryPolicy};
pub use stage::StageDefinition;
pub use state::PipelineState;
pub use store::{ItemStore, StageCounters, Transition};
pub use worker::{FailedItem, StageReport, WorkerPool};
