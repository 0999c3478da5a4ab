// Checkpointing - Persist and resume pipeline progress as an atomically replaced JSON file
use super::item::{StageState, WorkItem};
use super::stage::{StageDefinition, StageRecord};
use super::state::PipelineState;
use super::store::StageCounters;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const CHECKPOINT_SCHEMA: &str = "reels-pipeline/checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint - Snapshot of the whole item store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema: String,
    pub version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_epoch: u64,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub counters: BTreeMap<String, StageCounters>,
    pub items: Vec<WorkItem>,
}

/// Just enough of a checkpoint to reject foreign or future documents before
/// attempting a full parse.
#[derive(Deserialize)]
struct CheckpointHeader {
    schema: Option<String>,
    version: Option<u32>,
}

impl Checkpoint {
    pub async fn capture(state: &PipelineState) -> Self {
        Self {
            schema: CHECKPOINT_SCHEMA.to_string(),
            version: CHECKPOINT_VERSION,
            run_id: state.run_id,
            started_at: state.started_at,
            saved_at: Utc::now(),
            retry_epoch: state.retry_epoch,
            stages: state.stages().iter().map(StageRecord::from).collect(),
            counters: state.store.counters(),
            items: state.store.snapshot_items().await,
        }
    }

    /// Check the recorded stage layout against the configured one. Stages
    /// appended after the recorded ones are allowed and returned; a removed,
    /// renamed or reordered stage makes the checkpoint unusable.
    pub fn appended_stages(&self, path: &Path, configured: &[StageDefinition]) -> Result<Vec<String>> {
        if self.stages.len() > configured.len() {
            let missing: Vec<&str> = self.stages[configured.len()..]
                .iter()
                .map(|stage| stage.name.as_str())
                .collect();
            return Err(PipelineError::corrupt(
                path,
                format!("stages removed from configuration: {}", missing.join(", ")),
            ));
        }

        for (position, (recorded, current)) in self.stages.iter().zip(configured).enumerate() {
            if recorded.name != current.name || recorded.order != position {
                return Err(PipelineError::corrupt(
                    path,
                    format!(
                        "stage layout changed at position {}: checkpoint has '{}', configuration has '{}'",
                        position, recorded.name, current.name
                    ),
                ));
            }
        }

        Ok(configured[self.stages.len()..]
            .iter()
            .map(|stage| stage.name.clone())
            .collect())
    }
}

/// Reads and atomically writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    path: PathBuf,
}

impl CheckpointWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Write to a sibling temp file, fsync, then rename over the canonical path.
    /// Readers only ever observe the previous or the new complete document.
    pub async fn flush(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.temp_path();

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            items = checkpoint.items.len(),
            bytes = bytes.len(),
            "💾 Checkpoint written"
        );
        Ok(())
    }

    /// `Ok(None)` when no checkpoint exists yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "📭 No checkpoint found, starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let header: CheckpointHeader = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::corrupt(&self.path, format!("does not parse: {}", e)))?;

        match header.schema.as_deref() {
            Some(CHECKPOINT_SCHEMA) => {}
            Some(other) => {
                return Err(PipelineError::corrupt(
                    &self.path,
                    format!("unexpected schema '{}'", other),
                ))
            }
            None => return Err(PipelineError::corrupt(&self.path, "missing schema tag")),
        }

        match header.version {
            Some(CHECKPOINT_VERSION) => {}
            Some(other) => {
                return Err(PipelineError::corrupt(
                    &self.path,
                    format!("unsupported version {}", other),
                ))
            }
            None => return Err(PipelineError::corrupt(&self.path, "missing version")),
        }

        let mut checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::corrupt(&self.path, format!("does not parse: {}", e)))?;

        let mut seen = HashSet::new();
        for item in checkpoint.items.iter_mut() {
            if !seen.insert(item.id.clone()) {
                return Err(PipelineError::corrupt(
                    &self.path,
                    format!("duplicate item id {}", item.id),
                ));
            }
            for state in item.stage_status.values_mut() {
                if *state == StageState::Running {
                    *state = StageState::Pending;
                }
            }
        }

        info!(
            path = %self.path.display(),
            items = checkpoint.items.len(),
            run_id = %checkpoint.run_id,
            saved_at = %checkpoint.saved_at,
            "📂 Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }
}

/// When the background writer flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush after this many transitions
    pub flush_every: usize,
    /// ...or after this long with unflushed transitions
    pub flush_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            flush_every: 16,
            flush_interval: Duration::from_secs(2),
        }
    }
}

enum WriterCommand {
    FlushNow(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Handle to the background checkpoint task.
pub struct CheckpointHandle {
    commands: mpsc::Sender<WriterCommand>,
    task: JoinHandle<()>,
}

impl CheckpointHandle {
    /// Spawn the single writer task and route the store's transition
    /// notifications to it.
    pub fn spawn(writer: CheckpointWriter, state: Arc<PipelineState>, policy: FlushPolicy) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        state.store.attach_notifier(notify_tx);

        let (commands, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_writer(writer, state, policy, notify_rx, command_rx));

        Self { commands, task }
    }

    /// Flush immediately and wait for the write to land.
    pub async fn flush_now(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(WriterCommand::FlushNow(ack)).await?;
        done.await.map_err(|_| writer_gone())?
    }

    /// Final flush, then stop the writer task.
    pub async fn shutdown(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(WriterCommand::Shutdown(ack)).await?;
        let result = done.await.map_err(|_| writer_gone())?;
        if let Err(e) = self.task.await {
            error!("❌ Checkpoint writer task panicked: {}", e);
        }
        result
    }

    async fn send(&self, command: WriterCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> PipelineError {
    PipelineError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "checkpoint writer task is no longer running",
    ))
}

async fn write_snapshot(writer: &CheckpointWriter, state: &PipelineState) -> Result<()> {
    let checkpoint = Checkpoint::capture(state).await;
    writer.flush(&checkpoint).await
}

async fn run_writer(
    writer: CheckpointWriter,
    state: Arc<PipelineState>,
    policy: FlushPolicy,
    mut transitions: mpsc::UnboundedReceiver<()>,
    mut commands: mpsc::Receiver<WriterCommand>,
) {
    let mut ticker = tokio::time::interval(policy.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let flush_every = policy.flush_every.max(1);
    let mut unflushed = 0usize;

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => {
                match command {
                    Some(WriterCommand::FlushNow(ack)) => {
                        while transitions.try_recv().is_ok() {}
                        let result = write_snapshot(&writer, &state).await;
                        if result.is_ok() {
                            unflushed = 0;
                        }
                        let _ = ack.send(result);
                    }
                    Some(WriterCommand::Shutdown(ack)) => {
                        while transitions.try_recv().is_ok() {}
                        let result = write_snapshot(&writer, &state).await;
                        if result.is_ok() {
                            info!(path = %writer.path().display(), "💾 Final checkpoint written");
                        }
                        let _ = ack.send(result);
                        break;
                    }
                    None => {
                        // Handle dropped without shutdown
                        if let Err(e) = write_snapshot(&writer, &state).await {
                            error!("❌ Final checkpoint write failed: {}", e);
                        }
                        break;
                    }
                }
            }

            Some(()) = transitions.recv() => {
                unflushed += 1;
                if unflushed >= flush_every {
                    match write_snapshot(&writer, &state).await {
                        Ok(()) => unflushed = 0,
                        Err(e) => error!("❌ Checkpoint write failed ({} transitions unflushed): {}", unflushed, e),
                    }
                }
            }

            _ = ticker.tick() => {
                if unflushed > 0 {
                    match write_snapshot(&writer, &state).await {
                        Ok(()) => unflushed = 0,
                        Err(e) => error!("❌ Checkpoint write failed ({} transitions unflushed): {}", unflushed, e),
                    }
                }
            }
        }
    }

    debug!("Checkpoint writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::item::{ArtifactRef, DiscoveredItem, WorkItemId};
    use crate::pipeline::store::{ItemStore, Transition};
    use std::collections::HashMap;

    fn stages(names: &[&str]) -> Vec<StageDefinition> {
        names
            .iter()
            .enumerate()
            .map(|(order, name)| StageDefinition::new(*name, order))
            .collect()
    }

    async fn state_with(names: &[&str], ids: &[&str]) -> Arc<PipelineState> {
        let store = Arc::new(ItemStore::new(stages(names)));
        store
            .upsert_discovered(ids.iter().map(|id| DiscoveredItem::new(*id)).collect())
            .await;
        Arc::new(PipelineState::new(store, 0))
    }

    #[tokio::test]
    async fn test_flush_then_load_keeps_progress() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("checkpoint.json"));
        let state = state_with(&["download", "transcribe"], &["a", "b"]).await;

        let a = WorkItemId::new("a");
        state.store.transition(&a, "download", Transition::Start).await.unwrap();
        state
            .store
            .transition(&a, "download", Transition::Complete(ArtifactRef::Key("a.mp4".into())))
            .await
            .unwrap();
        let b = WorkItemId::new("b");
        state.store.transition(&b, "download", Transition::Start).await.unwrap();

        writer.flush(&Checkpoint::capture(&state).await).await.unwrap();
        assert!(!writer.temp_path().exists());

        let loaded = writer.load().await.unwrap().unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.items[0].state("download"), Some(StageState::Completed));
        // In-flight attempt is recorded as its last terminal state
        assert_eq!(loaded.items[1].state("download"), Some(StageState::Pending));
        assert_eq!(loaded.counters["download"].completed, 1);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("absent.json"));
        assert!(writer.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"{\"schema\": \"reels-pipeline/check").unwrap();

        let err = CheckpointWriter::new(&path).load().await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
    }

    #[tokio::test]
    async fn test_unknown_schema_or_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        std::fs::write(&path, br#"{"schema": "someone-else", "version": 1}"#).unwrap();
        let err = CheckpointWriter::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("unexpected schema"));

        std::fs::write(&path, br#"{"schema": "reels-pipeline/checkpoint", "version": 9}"#).unwrap();
        let err = CheckpointWriter::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("unsupported version 9"));
    }

    #[tokio::test]
    async fn test_running_on_disk_loads_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("checkpoint.json"));
        let state = state_with(&["download"], &["a"]).await;

        let mut checkpoint = Checkpoint::capture(&state).await;
        checkpoint.items[0]
            .stage_status
            .insert("download".into(), StageState::Running);
        writer.flush(&checkpoint).await.unwrap();

        let loaded = writer.load().await.unwrap().unwrap();
        assert_eq!(loaded.items[0].state("download"), Some(StageState::Pending));
    }

    #[tokio::test]
    async fn test_appended_stage_is_accepted() {
        let state = state_with(&["download", "transcribe"], &["a"]).await;
        let checkpoint = Checkpoint::capture(&state).await;

        let appended = checkpoint
            .appended_stages(Path::new("cp.json"), &stages(&["download", "transcribe", "summarize"]))
            .unwrap();
        assert_eq!(appended, vec!["summarize".to_string()]);
    }

    #[tokio::test]
    async fn test_reordered_or_removed_stage_is_corrupt() {
        let state = state_with(&["download", "transcribe"], &["a"]).await;
        let checkpoint = Checkpoint::capture(&state).await;
        let path = Path::new("cp.json");

        assert!(checkpoint
            .appended_stages(path, &stages(&["transcribe", "download"]))
            .is_err());
        assert!(checkpoint.appended_stages(path, &stages(&["download"])).is_err());
    }

    #[tokio::test]
    async fn test_batcher_flushes_after_flush_every_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("checkpoint.json"));
        let state = state_with(&["download"], &["a", "b"]).await;
        let handle = CheckpointHandle::spawn(
            writer.clone(),
            state.clone(),
            FlushPolicy {
                flush_every: 2,
                flush_interval: Duration::from_secs(3600),
            },
        );

        let a = WorkItemId::new("a");
        state.store.transition(&a, "download", Transition::Start).await.unwrap();
        state
            .store
            .transition(&a, "download", Transition::Complete(ArtifactRef::Key("a".into())))
            .await
            .unwrap();

        let mut flushed = false;
        for _ in 0..100 {
            if let Ok(Some(cp)) = writer.load().await {
                if cp.items.iter().any(|i| i.state("download") == Some(StageState::Completed)) {
                    flushed = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed, "batcher never flushed after two transitions");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("checkpoint.json"));
        let state = state_with(&["download"], &["a"]).await;
        let handle = CheckpointHandle::spawn(writer.clone(), state.clone(), FlushPolicy::default());

        let a = WorkItemId::new("a");
        state.store.transition(&a, "download", Transition::Start).await.unwrap();
        state
            .store
            .transition(&a, "download", Transition::Skip { reason: "disabled".into() })
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        let loaded = writer.load().await.unwrap().unwrap();
        assert_eq!(loaded.items[0].state("download"), Some(StageState::Skipped));
        let restored = ItemStore::restore(
            stages(&["download"]),
            loaded.items,
            loaded.counters.into_iter().collect::<HashMap<_, _>>(),
        );
        assert_eq!(restored.counters()["download"].skipped, 1);
    }
}
