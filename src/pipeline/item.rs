// Work items - one per discovered video, carried through every stage
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

/// Stable identifier of a work item.
///
/// Ids are derived from content, never from position in a discovery listing, so
/// re-running discovery maps the same video to the same item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    /// Use an identifier the source platform already guarantees to be stable
    /// (e.g. a video id or shortcode).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from a content locator such as the canonical video URL.
    pub fn from_content(locator: &str) -> Self {
        let digest = Sha256::digest(locator.trim().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Per-stage status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    /// Only ever held in memory while an attempt is in flight.
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    /// Completed or skipped: later stages may run.
    pub fn is_done(self) -> bool {
        matches!(self, StageState::Completed | StageState::Skipped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Pending => write!(f, "pending"),
            StageState::Running => write!(f, "running"),
            StageState::Completed => write!(f, "completed"),
            StageState::Failed => write!(f, "failed"),
            StageState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Where a stage left its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ArtifactRef {
    Path(PathBuf),
    Key(String),
    Structured(serde_json::Value),
}

impl ArtifactRef {
    /// Render the reference for argument templating.
    pub fn display_value(&self) -> String {
        match self {
            ArtifactRef::Path(path) => path.display().to_string(),
            ArtifactRef::Key(key) => key.clone(),
            ArtifactRef::Structured(value) => value.to_string(),
        }
    }
}

/// Last failure recorded for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One unit of work and its progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub stage_status: HashMap<String, StageState>,
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    #[serde(default)]
    pub last_error: HashMap<String, StageFailure>,
    #[serde(default)]
    pub artifacts: HashMap<String, ArtifactRef>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// New item with every stage pending.
    pub fn new<'a>(
        id: WorkItemId,
        stages: impl IntoIterator<Item = &'a str>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            stage_status: stages
                .into_iter()
                .map(|stage| (stage.to_string(), StageState::Pending))
                .collect(),
            attempts: HashMap::new(),
            last_error: HashMap::new(),
            artifacts: HashMap::new(),
            metadata,
            discovered_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self, stage: &str) -> Option<StageState> {
        self.stage_status.get(stage).copied()
    }

    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    pub fn artifact(&self, stage: &str) -> Option<&ArtifactRef> {
        self.artifacts.get(stage)
    }

    /// State to persist for `stage`. A running attempt is recorded as the
    /// terminal state it started from.
    pub fn persisted_state(&self, stage: &str) -> Option<StageState> {
        self.state(stage).map(|state| match state {
            StageState::Running if self.last_error.contains_key(stage) => StageState::Failed,
            StageState::Running => StageState::Pending,
            other => other,
        })
    }

    /// Copy of this item with no `Running` stages, suitable for a checkpoint.
    pub fn to_persisted(&self) -> WorkItem {
        let mut item = self.clone();
        for (stage, state) in item.stage_status.iter_mut() {
            if let Some(persisted) = self.persisted_state(stage) {
                *state = persisted;
            }
        }
        item
    }
}

/// An item reported by discovery (the metadata fetcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub id: WorkItemId,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DiscoveredItem {
    pub fn new(id: impl Into<WorkItemId>) -> Self {
        Self {
            id: id.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
