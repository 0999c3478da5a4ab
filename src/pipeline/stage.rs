// Stage definitions - the ordered steps every item moves through
use super::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime description of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub name: String,
    /// Position in the pipeline, starting at 0.
    pub order: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Rate-limit bucket shared with other stages calling the same service.
    pub collaborator_class: String,
    pub timeout: Option<Duration>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, order: usize) -> Self {
        let name = name.into();
        Self {
            collaborator_class: name.clone(),
            name,
            order,
            max_concurrency: 1,
            retry: RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(300)),
            timeout: None,
        }
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_collaborator_class(mut self, class: impl Into<String>) -> Self {
        self.collaborator_class = class.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }
}

/// Stage name and position as recorded in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub order: usize,
}

impl From<&StageDefinition> for StageRecord {
    fn from(stage: &StageDefinition) -> Self {
        Self {
            name: stage.name.clone(),
            order: stage.order,
        }
    }
}
