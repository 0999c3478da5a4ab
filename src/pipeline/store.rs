// Item store - authoritative in-memory map of work items with per-item locking
use super::item::{ArtifactRef, DiscoveredItem, StageFailure, StageState, WorkItem, WorkItemId};
use super::stage::StageDefinition;
use crate::error::{ErrorKind, PipelineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex, RwLock};

/// A requested change to one (item, stage) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Pending or retryable Failed -> Running.
    Start,
    /// Running -> Completed.
    Complete(ArtifactRef),
    /// Running -> Failed.
    Fail(StageFailure),
    /// Running -> Skipped.
    Skip { reason: String },
    /// Running -> the terminal state it started from. The attempt is not counted.
    Release,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Complete(_) => "complete",
            Transition::Fail(_) => "fail",
            Transition::Skip { .. } => "skip",
            Transition::Release => "release",
        }
    }
}

/// Outcome counts per stage, cumulative across resumed runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub completed: u64,
    pub skipped: u64,
    pub failed_attempts: u64,
}

#[derive(Debug, Default)]
struct CounterCells {
    completed: AtomicU64,
    skipped: AtomicU64,
    failed_attempts: AtomicU64,
}

impl CounterCells {
    fn from_counters(counters: StageCounters) -> Self {
        Self {
            completed: AtomicU64::new(counters.completed),
            skipped: AtomicU64::new(counters.skipped),
            failed_attempts: AtomicU64::new(counters.failed_attempts),
        }
    }

    fn load(&self) -> StageCounters {
        StageCounters {
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Sender half used to tell the checkpoint writer that state changed.
pub type TransitionNotifier = mpsc::UnboundedSender<()>;

pub struct ItemStore {
    stages: Arc<[StageDefinition]>,
    /// The map lock only guards membership; item state sits behind each item's own mutex.
    items: RwLock<HashMap<WorkItemId, Arc<Mutex<WorkItem>>>>,
    counters: HashMap<String, CounterCells>,
    notifier: OnceLock<TransitionNotifier>,
}

impl ItemStore {
    pub fn new(stages: Vec<StageDefinition>) -> Self {
        Self::restore(stages, Vec::new(), HashMap::new())
    }

    /// Rebuild a store from checkpointed items. Any `Running` stage is treated
    /// as the terminal state it started from; stages unknown to the items are
    /// added as `Pending`.
    pub fn restore(
        stages: Vec<StageDefinition>,
        items: Vec<WorkItem>,
        counters: HashMap<String, StageCounters>,
    ) -> Self {
        let stages: Arc<[StageDefinition]> = stages
            .into_iter()
            .enumerate()
            .map(|(order, mut stage)| {
                stage.order = order;
                stage
            })
            .collect();

        let items = items
            .into_iter()
            .map(|item| {
                let mut item = item.to_persisted();
                for stage in stages.iter() {
                    item.stage_status
                        .entry(stage.name.clone())
                        .or_insert(StageState::Pending);
                }
                (item.id.clone(), Arc::new(Mutex::new(item)))
            })
            .collect();

        let counters = stages
            .iter()
            .map(|stage| {
                let loaded = counters.get(&stage.name).copied().unwrap_or_default();
                (stage.name.clone(), CounterCells::from_counters(loaded))
            })
            .collect();

        Self {
            stages,
            items: RwLock::new(items),
            counters,
            notifier: OnceLock::new(),
        }
    }

    /// Route transition notifications to the checkpoint writer. Only the
    /// first notifier attached is kept.
    pub fn attach_notifier(&self, notifier: TransitionNotifier) {
        if self.notifier.set(notifier).is_err() {
            tracing::warn!("Item store already has a checkpoint notifier attached");
        }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Add newly discovered items with every stage pending. Known ids keep
    /// their progress; only metadata keys they lack are merged in.
    /// Returns how many items were new.
    pub async fn upsert_discovered(&self, discovered: Vec<DiscoveredItem>) -> usize {
        let mut items = self.items.write().await;
        let mut added = 0;

        for found in discovered {
            match items.get(&found.id) {
                Some(existing) => {
                    let mut existing = existing.lock().await;
                    for (key, value) in found.metadata {
                        existing.metadata.entry(key).or_insert(value);
                    }
                }
                None => {
                    let item = WorkItem::new(
                        found.id.clone(),
                        self.stages.iter().map(|stage| stage.name.as_str()),
                        found.metadata,
                    );
                    items.insert(found.id, Arc::new(Mutex::new(item)));
                    added += 1;
                }
            }
        }

        drop(items);
        if added > 0 {
            tracing::info!(added, "🆕 Merged newly discovered items");
            self.notify();
        }
        added
    }

    /// Items that may run `stage` now, sorted by id.
    pub async fn pending_for(&self, stage: &str) -> Vec<WorkItemId> {
        let Some(definition) = self.stage(stage) else {
            tracing::warn!(stage, "pending_for called with unknown stage");
            return Vec::new();
        };

        let mut pending = Vec::new();
        for handle in self.handles().await {
            let item = handle.lock().await;
            if self.is_eligible(&item, definition) {
                pending.push(item.id.clone());
            }
        }
        pending.sort();
        pending
    }

    /// Atomic compare-and-set on one (item, stage). Returns the number of
    /// attempts recorded for the stage afterwards.
    pub async fn transition(
        &self,
        id: &WorkItemId,
        stage: &str,
        change: Transition,
    ) -> Result<u32> {
        let definition = self.stage(stage).ok_or_else(|| {
            PipelineError::invalid_transition(id.as_str(), stage, "unknown stage")
        })?;
        let handle = self.items.read().await.get(id).cloned().ok_or_else(|| {
            PipelineError::invalid_transition(id.as_str(), stage, "unknown item")
        })?;

        let mut item = handle.lock().await;
        let current = item.state(stage).unwrap_or(StageState::Pending);
        let attempts = item.attempts(stage);
        let change_name = change.name();

        let reject = |reason: String| {
            PipelineError::invalid_transition(
                id.as_str(),
                stage,
                format!("cannot {} from {}: {}", change_name, current, reason),
            )
        };

        match change {
            Transition::Start => {
                if !self.is_eligible(&item, definition) {
                    return Err(reject(format!(
                        "not eligible ({} of {} attempts used)",
                        attempts,
                        definition.max_retries()
                    )));
                }
                item.stage_status.insert(stage.to_string(), StageState::Running);
            }
            Transition::Release => {
                if current != StageState::Running {
                    return Err(reject("no attempt in flight".into()));
                }
                let restored = if item.last_error.contains_key(stage) {
                    StageState::Failed
                } else {
                    StageState::Pending
                };
                item.stage_status.insert(stage.to_string(), restored);
            }
            Transition::Complete(artifact) => {
                if current != StageState::Running {
                    return Err(reject("no attempt in flight".into()));
                }
                item.stage_status.insert(stage.to_string(), StageState::Completed);
                item.artifacts.insert(stage.to_string(), artifact);
                item.last_error.remove(stage);
                item.attempts.insert(stage.to_string(), attempts + 1);
                self.bump(stage, |cells| &cells.completed);
            }
            Transition::Fail(failure) => {
                if current != StageState::Running {
                    return Err(reject("no attempt in flight".into()));
                }
                item.stage_status.insert(stage.to_string(), StageState::Failed);
                item.last_error.insert(stage.to_string(), failure);
                item.attempts.insert(stage.to_string(), attempts + 1);
                self.bump(stage, |cells| &cells.failed_attempts);
            }
            Transition::Skip { reason } => {
                if current != StageState::Running {
                    return Err(reject("no attempt in flight".into()));
                }
                item.stage_status.insert(stage.to_string(), StageState::Skipped);
                item.last_error.remove(stage);
                item.metadata.insert(format!("{}.skip_reason", stage), reason);
                item.attempts.insert(stage.to_string(), attempts + 1);
                self.bump(stage, |cells| &cells.skipped);
            }
        }

        item.updated_at = Utc::now();
        let recorded = item.attempts(stage);
        tracing::debug!(
            item = %id,
            stage,
            transition = change_name,
            state = %item.state(stage).unwrap_or(StageState::Pending),
            attempts = recorded,
            "Item transition"
        );
        drop(item);

        self.notify();
        Ok(recorded)
    }

    pub async fn get(&self, id: &WorkItemId) -> Option<WorkItem> {
        let handle = self.items.read().await.get(id).cloned()?;
        let item = handle.lock().await;
        Some(item.clone())
    }

    /// Checkpoint-ready copies of every item, sorted by id.
    pub async fn snapshot_items(&self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for handle in self.handles().await {
            items.push(handle.lock().await.to_persisted());
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn counters(&self) -> BTreeMap<String, StageCounters> {
        self.counters
            .iter()
            .map(|(stage, cells)| (stage.clone(), cells.load()))
            .collect()
    }

    /// Return every `Failed` stage to `Pending` with a fresh attempt budget.
    /// Used when a new retry epoch is configured.
    pub async fn reset_failures(&self) -> usize {
        let mut reset = 0;
        for handle in self.handles().await {
            let mut item = handle.lock().await;
            let failed: Vec<String> = item
                .stage_status
                .iter()
                .filter(|(_, state)| **state == StageState::Failed)
                .map(|(stage, _)| stage.clone())
                .collect();
            for stage in failed {
                item.stage_status.insert(stage.clone(), StageState::Pending);
                item.attempts.remove(&stage);
                item.last_error.remove(&stage);
                reset += 1;
            }
        }
        if reset > 0 {
            self.notify();
        }
        reset
    }

    /// Whether `stage` may start for `item`: predecessors done, own state
    /// pending or retryably failed, and attempts left.
    fn is_eligible(&self, item: &WorkItem, stage: &StageDefinition) -> bool {
        let predecessors_done = self.stages[..stage.order]
            .iter()
            .all(|earlier| item.state(&earlier.name).is_some_and(StageState::is_done));
        if !predecessors_done {
            return false;
        }

        let has_budget = item.attempts(&stage.name) < stage.max_retries();
        match item.state(&stage.name) {
            Some(StageState::Pending) | None => has_budget,
            Some(StageState::Failed) => {
                has_budget
                    && item
                        .last_error
                        .get(&stage.name)
                        .is_some_and(|failure| failure.kind == ErrorKind::Retryable)
            }
            Some(StageState::Running | StageState::Completed | StageState::Skipped) => false,
        }
    }

    async fn handles(&self) -> Vec<Arc<Mutex<WorkItem>>> {
        self.items.read().await.values().cloned().collect()
    }

    fn bump(&self, stage: &str, cell: impl Fn(&CounterCells) -> &AtomicU64) {
        if let Some(cells) = self.counters.get(stage) {
            cell(cells).fetch_add(1, Ordering::Relaxed);
        }
    }

    fn notify(&self) {
        if let Some(notifier) = self.notifier.get() {
            // The writer may already be gone during shutdown; the final flush covers it.
            let _ = notifier.send(());
        }
    }
}
