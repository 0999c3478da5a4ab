// Run report - final per-stage accounting computed from item state
use super::item::{StageState, WorkItem};
use super::stage::StageDefinition;
use super::state::PipelineState;
use crate::error::{ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every item completed or skipped every stage
    Completed,
    /// Some stage failed permanently and no eligible work remains
    PartiallyFailed,
    /// Eligible work remains (cancelled, or a stage ran out of passes)
    Interrupted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::PartiallyFailed => write!(f, "partially failed"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub completed: usize,
    pub skipped: usize,
    /// Permanently failed
    pub failed: usize,
    /// Still eligible, or waiting on an earlier stage that may yet succeed
    pub pending: usize,
    /// Waiting on an earlier stage that failed permanently
    pub blocked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub id: String,
    pub stage: String,
    pub attempts: u32,
    pub kind: ErrorKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub resumed_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outcome: RunOutcome,
    pub total_items: usize,
    pub stages: Vec<StageSummary>,
    pub failures: Vec<FailureEntry>,
}

/// A failed stage with no attempts left, or a fatal failure.
fn is_permanent_failure(item: &WorkItem, stage: &StageDefinition) -> bool {
    item.state(&stage.name) == Some(StageState::Failed)
        && (item.attempts(&stage.name) >= stage.max_retries()
            || item
                .last_error
                .get(&stage.name)
                .map_or(true, |failure| failure.kind == ErrorKind::Fatal))
}

impl RunReport {
    pub async fn from_state(state: &PipelineState) -> Self {
        let items = state.store.snapshot_items().await;
        let finished_at = Utc::now();
        let mut report = Self::from_items(state.stages(), &items);

        report.run_id = state.run_id;
        report.resumed_from = state.resumed_from;
        report.started_at = state.started_at;
        report.finished_at = finished_at;
        report.duration_secs =
            (finished_at - state.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        report
    }

    /// Tally `items` against `stages`. Timing and run ids are left blank.
    pub fn from_items(stages: &[StageDefinition], items: &[WorkItem]) -> Self {
        let mut summaries: Vec<StageSummary> = stages
            .iter()
            .map(|stage| StageSummary {
                stage: stage.name.clone(),
                ..StageSummary::default()
            })
            .collect();
        let mut failures = Vec::new();

        for item in items {
            let mut blocked = false;
            for (stage, summary) in stages.iter().zip(summaries.iter_mut()) {
                match item.state(&stage.name) {
                    Some(StageState::Completed) => summary.completed += 1,
                    Some(StageState::Skipped) => summary.skipped += 1,
                    _ if blocked => summary.blocked += 1,
                    _ if is_permanent_failure(item, stage) => {
                        summary.failed += 1;
                        blocked = true;
                        if let Some(failure) = item.last_error.get(&stage.name) {
                            failures.push(FailureEntry {
                                id: item.id.to_string(),
                                stage: stage.name.clone(),
                                attempts: item.attempts(&stage.name),
                                kind: failure.kind,
                                error: failure.message.clone(),
                                failed_at: failure.at,
                            });
                        }
                    }
                    _ => summary.pending += 1,
                }
            }
        }

        let all_done = summaries
            .iter()
            .all(|s| s.failed == 0 && s.pending == 0 && s.blocked == 0);
        let pending_left = summaries.iter().any(|s| s.pending > 0);
        let outcome = if all_done {
            RunOutcome::Completed
        } else if pending_left {
            RunOutcome::Interrupted
        } else {
            RunOutcome::PartiallyFailed
        };

        let now = Utc::now();
        Self {
            run_id: Uuid::nil(),
            resumed_from: None,
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            outcome,
            total_items: items.len(),
            stages: summaries,
            failures,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|summary| summary.stage == name)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), "📝 Run report saved");
        Ok(())
    }
}
