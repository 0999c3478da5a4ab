// Orchestrator - drives every item through the stages in order and survives restarts
use super::checkpoint::{CheckpointHandle, CheckpointWriter};
use super::item::DiscoveredItem;
use super::processor::ProcessorRegistry;
use super::rate_limit::RateLimiter;
use super::report::{RunOutcome, RunReport};
use super::state::PipelineState;
use super::store::ItemStore;
use super::worker::WorkerPool;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle of a run, observable through [`Orchestrator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "stage", rename_all = "snake_case")]
pub enum RunPhase {
    Initializing,
    /// Working on the stage at this position
    Running(usize),
    Draining,
    Completed,
    PartiallyFailed,
    Interrupted,
}

impl From<RunOutcome> for RunPhase {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => RunPhase::Completed,
            RunOutcome::PartiallyFailed => RunPhase::PartiallyFailed,
            RunOutcome::Interrupted => RunPhase::Interrupted,
        }
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    registry: ProcessorRegistry,
    cancel: CancellationToken,
    phase: watch::Sender<RunPhase>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, registry: ProcessorRegistry) -> Self {
        let (phase, _) = watch::channel(RunPhase::Initializing);
        Self {
            config,
            registry,
            cancel: CancellationToken::new(),
            phase,
        }
    }

    /// Cancelling this token stops new attempts; in-flight ones finish and
    /// are recorded before the final checkpoint.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RunPhase) {
        info!(?phase, "📍 Pipeline phase");
        self.phase.send_replace(phase);
    }

    /// Load or create the checkpoint, merge `discovered`, run every stage and
    /// return the final report. Per-item failures end up in the report; only
    /// run-fatal problems are returned as errors.
    pub async fn run(&self, discovered: Vec<DiscoveredItem>) -> Result<RunReport> {
        self.set_phase(RunPhase::Initializing);

        self.config.validate()?;
        let stages = self.config.stage_definitions();
        self.registry.ensure_covers(&stages)?;
        let limiter = RateLimiter::new(self.config.rate_limits())?;

        let writer = CheckpointWriter::new(&self.config.checkpoint.path);
        let (store, resumed_from, checkpoint_epoch) = match writer.load().await? {
            Some(checkpoint) => {
                let appended = checkpoint.appended_stages(writer.path(), &stages)?;
                if !appended.is_empty() {
                    info!(stages = ?appended, "➕ New stages appended since last checkpoint");
                }
                let store = ItemStore::restore(
                    stages,
                    checkpoint.items,
                    checkpoint.counters.into_iter().collect(),
                );
                (store, Some(checkpoint.run_id), checkpoint.retry_epoch)
            }
            None => (ItemStore::new(stages), None, 0),
        };
        let store = Arc::new(store);

        if self.config.retry_epoch > checkpoint_epoch {
            let reset = store.reset_failures().await;
            info!(
                from = checkpoint_epoch,
                to = self.config.retry_epoch,
                reset,
                "🔄 New retry epoch, failed stages re-queued"
            );
        }
        let retry_epoch = self.config.retry_epoch.max(checkpoint_epoch);

        let discovered_count = discovered.len();
        let added = store.upsert_discovered(discovered).await;
        let total = store.len().await;
        info!(
            discovered = discovered_count,
            added,
            total,
            resumed = resumed_from.is_some(),
            "📋 Item store ready"
        );

        let mut state = PipelineState::new(store.clone(), retry_epoch);
        if let Some(previous) = resumed_from {
            state = state.resumed_from(previous);
        }
        let state = Arc::new(state);

        let checkpoint = CheckpointHandle::spawn(writer, state.clone(), self.config.checkpoint.flush_policy());
        if let Err(e) = checkpoint.flush_now().await {
            let _ = checkpoint.shutdown().await;
            return Err(e);
        }

        let pool = WorkerPool::new(store.clone(), limiter, self.cancel.clone());
        let ran = self.run_stages(&pool, &state).await;

        self.set_phase(RunPhase::Draining);
        let flushed = checkpoint.shutdown().await;
        ran?;
        flushed?;

        let report = RunReport::from_state(&state).await;
        info!(
            run_id = %report.run_id,
            outcome = %report.outcome,
            items = report.total_items,
            failures = report.failures.len(),
            duration_secs = report.duration_secs,
            "🏁 Pipeline run finished"
        );
        self.set_phase(report.outcome.into());
        Ok(report)
    }

    async fn run_stages(&self, pool: &WorkerPool, state: &PipelineState) -> Result<()> {
        for (index, stage) in state.stages().iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_phase(RunPhase::Running(index));

            let processor = self.registry.get(&stage.name).ok_or_else(|| {
                PipelineError::Config(format!("no processor registered for stage '{}'", stage.name))
            })?;

            let mut pass = 0;
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let pending = state.store.pending_for(&stage.name).await;
                if pending.is_empty() {
                    break;
                }
                if pass == self.config.max_stage_passes {
                    warn!(
                        stage = %stage.name,
                        remaining = pending.len(),
                        passes = pass,
                        "⚠️ Stage pass limit reached with work remaining"
                    );
                    break;
                }
                pass += 1;

                info!(stage = %stage.name, pass, items = pending.len(), "▶️ Running stage pass");
                pool.run_stage(stage, pending, processor.clone()).await?;
            }
        }
        Ok(())
    }
}
