// Pipeline configuration - JSON file plus environment overrides, validated before a run
use crate::error::{PipelineError, Result};
use crate::pipeline::checkpoint::FlushPolicy;
use crate::pipeline::processor::CommandSpec;
use crate::pipeline::rate_limit::RateLimitConfig;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stage::StageDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "pipeline.json";

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".pipeline_checkpoint.json")
}

fn default_flush_every() -> usize {
    16
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_max_stage_passes() -> u32 {
    8
}

fn default_max_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    5000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            flush_every: default_flush_every(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl CheckpointConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            flush_every: self.flush_every,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

/// How a stage does its work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorConfig {
    Command(CommandSpec),
    Skip {
        #[serde(default = "default_skip_reason")]
        reason: String,
    },
}

fn default_skip_reason() -> String {
    "stage disabled in configuration".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Defaults to the stage name
    #[serde(default)]
    pub collaborator_class: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    pub processor: ProcessorConfig,
}

impl StageConfig {
    pub fn collaborator_class(&self) -> &str {
        self.collaborator_class.as_deref().unwrap_or(&self.name)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub stages: Vec<StageConfig>,
    /// Worker pool passes per stage before giving up on remaining retries
    #[serde(default = "default_max_stage_passes")]
    pub max_stage_passes: u32,
    /// Raise above the checkpoint's epoch to give failed stages a fresh budget
    #[serde(default)]
    pub retry_epoch: u64,
    #[serde(default)]
    pub items_path: Option<PathBuf>,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("invalid configuration: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Load `.env`, read the file named by `PIPELINE_CONFIG` (default
    /// `pipeline.json`) and apply `PIPELINE_CHECKPOINT`, `PIPELINE_ITEMS`
    /// and `PIPELINE_REPORT` overrides. The result is validated.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::info!(
            config = %path,
            stages = config.stages.len(),
            checkpoint = %config.checkpoint.path.display(),
            "⚙️ Loaded pipeline configuration"
        );
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("PIPELINE_CHECKPOINT") {
            self.checkpoint.path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PIPELINE_ITEMS") {
            self.items_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("PIPELINE_REPORT") {
            self.report_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::Config("at least one stage is required".into()));
        }
        if self.checkpoint.flush_every == 0 {
            return Err(PipelineError::Config("checkpoint.flush_every must be at least 1".into()));
        }
        if self.checkpoint.flush_interval_ms == 0 {
            return Err(PipelineError::Config(
                "checkpoint.flush_interval_ms must be at least 1".into(),
            ));
        }
        if self.max_stage_passes == 0 {
            return Err(PipelineError::Config("max_stage_passes must be at least 1".into()));
        }

        let mut names = HashSet::new();
        let mut limits: HashMap<&str, RateLimitConfig> = HashMap::new();

        for stage in &self.stages {
            let name = stage.name.as_str();
            if name.trim().is_empty() {
                return Err(PipelineError::Config("stage names must not be empty".into()));
            }
            if name.trim() != name {
                return Err(PipelineError::Config(format!(
                    "stage '{}': name has surrounding whitespace",
                    name
                )));
            }
            if !names.insert(name) {
                return Err(PipelineError::Config(format!("duplicate stage '{}'", name)));
            }
            if stage.max_concurrency == 0 {
                return Err(PipelineError::Config(format!(
                    "stage '{}': max_concurrency must be at least 1",
                    name
                )));
            }
            if stage.max_retries == 0 {
                return Err(PipelineError::Config(format!(
                    "stage '{}': max_retries must be at least 1",
                    name
                )));
            }
            if stage.base_backoff_ms > stage.max_backoff_ms {
                return Err(PipelineError::Config(format!(
                    "stage '{}': base_backoff_ms exceeds max_backoff_ms",
                    name
                )));
            }
            if stage.timeout_secs == Some(0) {
                return Err(PipelineError::Config(format!(
                    "stage '{}': timeout_secs must be at least 1",
                    name
                )));
            }
            if let ProcessorConfig::Command(spec) = &stage.processor {
                if spec.program.trim().is_empty() {
                    return Err(PipelineError::Config(format!(
                        "stage '{}': command program must not be empty",
                        name
                    )));
                }
            }

            if let Some(limit) = stage.rate_limit {
                limit.validate().map_err(|_| {
                    PipelineError::Config(format!(
                        "stage '{}': rate_limit values must all be at least 1",
                        name
                    ))
                })?;
                let class = stage.collaborator_class();
                if let Some(existing) = limits.insert(class, limit) {
                    if existing != limit {
                        return Err(PipelineError::Config(format!(
                            "collaborator class '{}' has conflicting rate limits",
                            class
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        self.stages
            .iter()
            .enumerate()
            .map(|(order, stage)| {
                let definition = StageDefinition::new(stage.name.as_str(), order)
                    .with_concurrency(stage.max_concurrency)
                    .with_retry(stage.retry_policy())
                    .with_collaborator_class(stage.collaborator_class());
                match stage.timeout_secs {
                    Some(secs) => definition.with_timeout(Duration::from_secs(secs)),
                    None => definition,
                }
            })
            .collect()
    }

    /// Rate limits keyed by collaborator class.
    pub fn rate_limits(&self) -> HashMap<String, RateLimitConfig> {
        self.stages
            .iter()
            .filter_map(|stage| {
                stage
                    .rate_limit
                    .map(|limit| (stage.collaborator_class().to_string(), limit))
            })
            .collect()
    }
}
