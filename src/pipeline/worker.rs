// Worker pool - bounded-concurrency execution of one stage over a batch of items
use super::item::{StageFailure, WorkItem, WorkItemId};
use super::processor::{StageOutcome, StageProcessor};
use super::rate_limit::RateLimiter;
use super::retry::RetryDecision;
use super::stage::StageDefinition;
use super::store::{ItemStore, Transition};
use crate::error::{PipelineError, Result, StageError};
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// An item that exhausted its attempts or failed fatally.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub id: WorkItemId,
    pub attempts: u32,
    pub error: StageError,
}

/// Outcome counts for one `run_stage` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub stage: String,
    pub completed: usize,
    pub skipped: usize,
    /// Permanently failed in this call
    pub failed: usize,
    /// Retries scheduled after a retryable failure
    pub retried: usize,
    /// Items left at their last terminal state because of cancellation
    pub interrupted: usize,
    pub failures: Vec<FailedItem>,
}

impl StageReport {
    fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Self::default()
        }
    }
}

enum Attempt {
    Finished(std::result::Result<StageOutcome, StageError>),
    /// Cancelled before the processor was invoked
    Released,
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<ItemStore>,
    limiter: RateLimiter,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(store: Arc<ItemStore>, limiter: RateLimiter, cancel: CancellationToken) -> Self {
        Self {
            store,
            limiter,
            cancel,
        }
    }

    /// Run `processor` over `items` with at most `stage.max_concurrency`
    /// attempts in flight. Retries wait out their backoff without holding a
    /// slot. Returns once every item reached a terminal state for this call,
    /// or once cancellation has drained the in-flight attempts.
    pub async fn run_stage(
        &self,
        stage: &StageDefinition,
        items: Vec<WorkItemId>,
        processor: Arc<dyn StageProcessor>,
    ) -> Result<StageReport> {
        let mut report = StageReport::new(&stage.name);
        let mut ready: VecDeque<WorkItemId> = items.into();
        let mut in_flight: JoinSet<(WorkItemId, Attempt)> = JoinSet::new();
        let mut waiting: JoinSet<WorkItemId> = JoinSet::new();
        let mut cancel_handled = false;

        tracing::info!(
            stage = %stage.name,
            items = ready.len(),
            max_concurrency = stage.max_concurrency,
            "🚀 Starting stage"
        );

        loop {
            // Fill free slots
            while in_flight.len() < stage.max_concurrency && !self.cancel.is_cancelled() {
                let Some(id) = ready.pop_front() else { break };
                let item = self.start(stage, &id).await?;
                in_flight.spawn(self.attempt(stage, item, processor.clone()));
            }

            let cancelled = self.cancel.is_cancelled();
            if in_flight.is_empty() && waiting.is_empty() && (ready.is_empty() || cancelled) {
                report.interrupted += ready.len();
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !cancel_handled => {
                    cancel_handled = true;
                    let abandoned = ready.len() + waiting.len();
                    report.interrupted += abandoned;
                    ready.clear();
                    waiting.shutdown().await;
                    tracing::warn!(
                        stage = %stage.name,
                        in_flight = in_flight.len(),
                        abandoned,
                        "🛑 Cancellation requested, draining in-flight attempts"
                    );
                }

                Some(joined) = in_flight.join_next() => {
                    match joined {
                        Ok((id, attempt)) => {
                            self.record(stage, id, attempt, &mut report, &mut waiting).await?;
                        }
                        Err(e) => {
                            tracing::error!(stage = %stage.name, "❌ Worker task failed: {}", e);
                        }
                    }
                }

                Some(joined) = waiting.join_next() => {
                    if let Ok(id) = joined {
                        ready.push_back(id);
                    }
                }

                else => break,
            }
        }

        tracing::info!(
            stage = %stage.name,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            retried = report.retried,
            interrupted = report.interrupted,
            "🏁 Stage finished"
        );
        Ok(report)
    }

    /// Mark `id` running and return a snapshot for the processor. An item
    /// that cannot start is a broken invariant and aborts the stage.
    async fn start(&self, stage: &StageDefinition, id: &WorkItemId) -> Result<WorkItem> {
        self.store.transition(id, &stage.name, Transition::Start).await?;
        self.store.get(id).await.ok_or_else(|| {
            PipelineError::invalid_transition(id.as_str(), &stage.name, "item vanished after start")
        })
    }

    fn attempt(
        &self,
        stage: &StageDefinition,
        item: WorkItem,
        processor: Arc<dyn StageProcessor>,
    ) -> impl std::future::Future<Output = (WorkItemId, Attempt)> + Send + 'static {
        let limiter = self.limiter.clone();
        let cancel = self.cancel.clone();
        let class = stage.collaborator_class.clone();
        let timeout = stage.timeout;

        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (item.id.clone(), Attempt::Released),
                _ = limiter.acquire(&class) => {}
            }

            let call = AssertUnwindSafe(processor.process(&item)).catch_unwind();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(StageError::retryable(format!(
                        "attempt timed out after {}s",
                        limit.as_secs_f64()
                    )))),
                },
                None => call.await,
            };

            let result = result.unwrap_or_else(|panic| {
                Err(StageError::fatal(format!(
                    "processor panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
            (item.id.clone(), Attempt::Finished(result))
        }
    }

    async fn record(
        &self,
        stage: &StageDefinition,
        id: WorkItemId,
        attempt: Attempt,
        report: &mut StageReport,
        waiting: &mut JoinSet<WorkItemId>,
    ) -> Result<()> {
        let name = stage.name.as_str();
        match attempt {
            Attempt::Released => {
                self.store.transition(&id, name, Transition::Release).await?;
                report.interrupted += 1;
            }
            Attempt::Finished(Ok(StageOutcome::Completed(artifact))) => {
                let attempts = self
                    .store
                    .transition(&id, name, Transition::Complete(artifact))
                    .await?;
                tracing::info!(item = %id, stage = name, attempt = attempts, "✅ Stage completed");
                report.completed += 1;
            }
            Attempt::Finished(Ok(StageOutcome::Skipped { reason })) => {
                tracing::info!(item = %id, stage = name, "⏭️ Stage skipped: {}", reason);
                self.store
                    .transition(&id, name, Transition::Skip { reason })
                    .await?;
                report.skipped += 1;
            }
            Attempt::Finished(Err(error)) => {
                let failure = StageFailure::new(error.kind, error.message.clone());
                let attempts = self
                    .store
                    .transition(&id, name, Transition::Fail(failure))
                    .await?;

                match stage.retry.decide(attempts, error.kind) {
                    RetryDecision::Retry { .. } if self.cancel.is_cancelled() => {
                        report.interrupted += 1;
                    }
                    RetryDecision::Retry { delay } => {
                        tracing::warn!(
                            item = %id,
                            stage = name,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "🔁 Attempt failed, retrying: {}",
                            error.message
                        );
                        report.retried += 1;
                        waiting.spawn(async move {
                            tokio::time::sleep(delay).await;
                            id
                        });
                    }
                    RetryDecision::GiveUp => {
                        tracing::error!(
                            item = %id,
                            stage = name,
                            attempt = attempts,
                            kind = %error.kind,
                            "❌ Stage failed permanently: {}",
                            error.message
                        );
                        report.failed += 1;
                        report.failures.push(FailedItem {
                            id,
                            attempts,
                            error,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
