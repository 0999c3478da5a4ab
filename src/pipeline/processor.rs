// Stage processors - the per-stage work behind a common async interface
use super::item::{ArtifactRef, WorkItem};
use super::stage::StageDefinition;
use crate::config::{PipelineConfig, ProcessorConfig};
use crate::error::{PipelineError, Result, StageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// Successful result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(ArtifactRef),
    /// Nothing to do for this item; later stages may still run.
    Skipped { reason: String },
}

/// Work performed for one stage of one item.
///
/// Implementations must be idempotent: an attempt may be repeated after a
/// crash, so returning an artifact that already exists is preferred over
/// redoing the work.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> std::result::Result<StageOutcome, StageError>;
}

fn default_min_output_bytes() -> u64 {
    1024
}

/// External program invoked once per item.
///
/// `args` and `output` may contain `{id}`, `{meta.KEY}` and `{artifact.STAGE}`
/// placeholders; `args` may also use `{output}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File the program is expected to produce
    #[serde(default)]
    pub output: Option<String>,
    /// An existing output at least this large is reused without running
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Exit codes meaning "retrying will not help"
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output: None,
            min_output_bytes: default_min_output_bytes(),
            fatal_exit_codes: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn output(mut self, template: impl Into<String>) -> Self {
        self.output = Some(template.into());
        self
    }
}

/// Command-line tool wrapper, one process per attempt.
pub struct CommandProcessor {
    spec: CommandSpec,
}

impl CommandProcessor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    async fn existing_output(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() >= self.spec.min_output_bytes,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl StageProcessor for CommandProcessor {
    async fn process(&self, item: &WorkItem) -> std::result::Result<StageOutcome, StageError> {
        let output = self
            .spec
            .output
            .as_deref()
            .map(|template| render_template(template, item, None))
            .transpose()?;

        if let Some(path) = output.as_deref() {
            if self.existing_output(Path::new(path)).await {
                tracing::info!(item = %item.id, "✅ Output already exists, skipping: {}", path);
                return Ok(StageOutcome::Completed(ArtifactRef::Path(path.into())));
            }
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StageError::retryable(format!("Failed to create output directory: {}", e))
                })?;
            }
        }

        let args = self
            .spec
            .args
            .iter()
            .map(|arg| render_template(arg, item, output.as_deref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::debug!(item = %item.id, program = %self.spec.program, ?args, "Running stage command");

        let mut command = Command::new(&self.spec.program);
        command
            .args(&args)
            .envs(&self.spec.env)
            .env("PIPELINE_ITEM_ID", item.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        let result = command.output().await.map_err(|e| {
            StageError::fatal(format!("Failed to execute {}: {}", self.spec.program, e))
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let code = result.status.code();
            let message = format!(
                "{} exited with {}: {}",
                self.spec.program,
                code.map_or_else(|| "signal".to_string(), |c| format!("status {}", c)),
                tail_lines(&stderr, 5)
            );
            return Err(match code {
                Some(c) if self.spec.fatal_exit_codes.contains(&c) => StageError::fatal(message),
                _ => StageError::retryable(message),
            });
        }

        match output {
            Some(path) => {
                if tokio::fs::metadata(&path).await.is_err() {
                    return Err(StageError::fatal(format!(
                        "{} succeeded but did not produce {}",
                        self.spec.program, path
                    )));
                }
                Ok(StageOutcome::Completed(ArtifactRef::Path(path.into())))
            }
            None => {
                let stdout = String::from_utf8_lossy(&result.stdout);
                match stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
                    Some(key) => Ok(StageOutcome::Completed(ArtifactRef::Key(key.to_string()))),
                    None => Err(StageError::fatal(format!(
                        "{} produced no output",
                        self.spec.program
                    ))),
                }
            }
        }
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(count)..].join(" | ")
}

/// Substitute `{id}`, `{output}`, `{meta.KEY}` and `{artifact.STAGE}`.
/// Unknown or unresolvable placeholders are fatal for the item.
pub fn render_template(
    template: &str,
    item: &WorkItem,
    output: Option<&str>,
) -> std::result::Result<String, StageError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            StageError::fatal(format!("Unclosed placeholder in '{}'", template))
        })?;
        rendered.push_str(&resolve_placeholder(&after[..close], item, output)?);
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);

    Ok(rendered)
}

fn resolve_placeholder(
    key: &str,
    item: &WorkItem,
    output: Option<&str>,
) -> std::result::Result<String, StageError> {
    if key == "id" {
        return Ok(item.id.to_string());
    }
    if key == "output" {
        return output
            .map(str::to_string)
            .ok_or_else(|| StageError::fatal("{output} used but no output is configured"));
    }
    if let Some(meta) = key.strip_prefix("meta.") {
        return item
            .metadata
            .get(meta)
            .cloned()
            .ok_or_else(|| StageError::fatal(format!("Item {} has no metadata '{}'", item.id, meta)));
    }
    if let Some(stage) = key.strip_prefix("artifact.") {
        return item
            .artifact(stage)
            .map(ArtifactRef::display_value)
            .ok_or_else(|| StageError::fatal(format!("Item {} has no artifact from '{}'", item.id, stage)));
    }
    Err(StageError::fatal(format!("Unknown placeholder {{{}}}", key)))
}

/// Records every item as skipped, for stages switched off in configuration.
pub struct SkipProcessor {
    reason: String,
}

impl SkipProcessor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StageProcessor for SkipProcessor {
    async fn process(&self, _item: &WorkItem) -> std::result::Result<StageOutcome, StageError> {
        Ok(StageOutcome::Skipped {
            reason: self.reason.clone(),
        })
    }
}

/// Stage name -> processor.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn StageProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        for stage in &config.stages {
            let processor: Arc<dyn StageProcessor> = match &stage.processor {
                ProcessorConfig::Command(spec) => Arc::new(CommandProcessor::new(spec.clone())),
                ProcessorConfig::Skip { reason } => Arc::new(SkipProcessor::new(reason.clone())),
            };
            registry.register(&stage.name, processor);
        }
        registry
    }

    pub fn register(&mut self, stage: &str, processor: Arc<dyn StageProcessor>) -> &mut Self {
        self.processors.insert(stage.to_string(), processor);
        self
    }

    pub fn with(mut self, stage: &str, processor: Arc<dyn StageProcessor>) -> Self {
        self.register(stage, processor);
        self
    }

    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(stage).cloned()
    }

    /// Every stage needs a processor before the run starts.
    pub fn ensure_covers(&self, stages: &[StageDefinition]) -> Result<()> {
        let missing: Vec<&str> = stages
            .iter()
            .filter(|stage| !self.processors.contains_key(&stage.name))
            .map(|stage| stage.name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "no processor registered for stage(s): {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn item() -> WorkItem {
        let mut item = WorkItem::new(
            "Cx1AbC".into(),
            ["download", "transcribe"],
            HashMap::from([("url".to_string(), "https://instagram.com/reel/Cx1AbC".to_string())]),
        );
        item.artifacts
            .insert("download".into(), ArtifactRef::Path("downloads/Cx1AbC.mp4".into()));
        item
    }

    #[test]
    fn test_render_template_placeholders() {
        let rendered = render_template(
            "--in {artifact.download} --out {output} --url {meta.url} --id {id}",
            &item(),
            Some("transcripts/Cx1AbC.txt"),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "--in downloads/Cx1AbC.mp4 --out transcripts/Cx1AbC.txt --url https://instagram.com/reel/Cx1AbC --id Cx1AbC"
        );
    }

    #[test]
    fn test_render_template_missing_values_are_fatal() {
        let item = item();
        for template in ["{meta.caption}", "{artifact.transcribe}", "{output}", "{bogus}", "{id"] {
            let err = render_template(template, &item, None).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Fatal, "{}", template);
        }
    }

    #[tokio::test]
    async fn test_skip_processor() {
        let outcome = SkipProcessor::new("summaries disabled").process(&item()).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Skipped {
                reason: "summaries disabled".into()
            }
        );
    }

    #[tokio::test]
    async fn test_existing_output_is_reused_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("Cx1AbC.mp4");
        std::fs::write(&existing, vec![0u8; 2048]).unwrap();

        let spec = CommandSpec::new("/definitely/not/a/real/program")
            .output(dir.path().join("{id}.mp4").display().to_string());
        let outcome = CommandProcessor::new(spec).process(&item()).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed(ArtifactRef::Path(existing)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let spec = CommandSpec::new("/definitely/not/a/real/program");
        let err = CommandProcessor::new(spec).process(&item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes_map_to_error_kinds() {
        let retry = CommandSpec::new("sh").arg("-c").arg("echo boom >&2; exit 3");
        let err = CommandProcessor::new(retry).process(&item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Retryable);
        assert!(err.message.contains("status 3"));
        assert!(err.message.contains("boom"));

        let mut fatal = CommandSpec::new("sh").arg("-c").arg("exit 2");
        fatal.fatal_exit_codes = vec![2];
        let err = CommandProcessor::new(fatal).process(&item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_becomes_key_artifact() {
        let spec = CommandSpec::new("sh").arg("-c").arg("echo working; echo summary-{id}");
        let outcome = CommandProcessor::new(spec).process(&item()).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Completed(ArtifactRef::Key("summary-Cx1AbC".into()))
        );

        let silent = CommandSpec::new("sh").arg("-c").arg("true");
        let err = CommandProcessor::new(silent).process(&item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_file_must_exist_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("{id}.txt").display().to_string();

        let writes = CommandSpec::new("sh")
            .arg("-c")
            .arg("printf transcript > \"$0\"")
            .arg("{output}")
            .output(output.clone());
        let outcome = CommandProcessor::new(writes).process(&item()).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Completed(ArtifactRef::Path(dir.path().join("out").join("Cx1AbC.txt")))
        );

        let lazy = CommandSpec::new("sh").arg("-c").arg("true").output(
            dir.path().join("missing-{id}.txt").display().to_string(),
        );
        let err = CommandProcessor::new(lazy).process(&item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_registry_reports_uncovered_stages() {
        let registry = ProcessorRegistry::new().with("download", Arc::new(SkipProcessor::new("x")));
        let stages = vec![
            StageDefinition::new("download", 0),
            StageDefinition::new("transcribe", 1),
        ];
        let err = registry.ensure_covers(&stages).unwrap_err();
        assert!(err.to_string().contains("transcribe"));
    }
}
