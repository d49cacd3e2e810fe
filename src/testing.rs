//! Shared fixtures for unit tests: a throwaway storage tree with a small
//! catalog, and scripted stand-ins for the network and the engine.

use crate::error::{AppError, AppResult};
use crate::events::JobEvent;
use crate::jobs::{JobContext, JobError, JobKind, Operation};
use crate::models::catalog::{CatalogEntry, CatalogReader};
use crate::models::fetch::AssetFetcher;
use crate::models::placement::{Platform, StorageLayout};
use crate::models::probe::ConnectivityProbe;
use crate::transcription::engine::{TranscriptionEngine, TranscriptionParams};
use anyhow::anyhow;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};

const MODELS_JSON: &str = r#"{
  "small": {
    "repo_id": "Systran/faster-whisper-small",
    "model_bin_size_human": "150 MB",
    "type": "regular",
    "class": "required"
  },
  "large": {
    "repo_id": "Systran/faster-whisper-large-v3",
    "model_bin_size_human": "3 GB",
    "type": "regular"
  },
  "distil-en": {
    "repo_id": "Systran/faster-distil-whisper-large-v3",
    "model_bin_size_human": "1.5 GB",
    "type": "distil",
    "language": "en"
  }
}"#;

const LANGUAGES_JSON: &str = r#"{
  "auto-detect": "Auto-detect",
  "en": "English",
  "de": "German"
}"#;

/// Temporary storage tree. The layout uses a non-primary platform so
/// required models land in their own root.
pub struct TestStorage {
    dir: TempDir,
}

impl TestStorage {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.json"), MODELS_JSON).unwrap();
        std::fs::write(dir.path().join("languages.json"), LANGUAGES_JSON).unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::create_dir_all(dir.path().join("required")).unwrap();
        Self { dir }
    }

    pub fn models_file(&self) -> PathBuf {
        self.dir.path().join("models.json")
    }

    pub fn languages_file(&self) -> PathBuf {
        self.dir.path().join("languages.json")
    }

    pub fn general_dir(&self) -> PathBuf {
        self.dir.path().join("models")
    }

    pub fn required_dir(&self) -> PathBuf {
        self.dir.path().join("required")
    }

    pub fn transcriptions_dir(&self) -> PathBuf {
        self.dir.path().join("transcriptions")
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.general_dir(), self.required_dir(), Platform::Windows)
    }

    pub fn catalog(&self) -> CatalogReader {
        CatalogReader::new(self.models_file(), self.languages_file(), self.layout(), "bin")
    }

    /// Put a complete model directory (with its marker file) under `root`.
    pub fn install_model(&self, model_id: &str, root: impl AsRef<Path>) {
        let dir = root.as_ref().join(model_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{}").unwrap();
        std::fs::write(dir.join("model.bin"), b"weights").unwrap();
    }
}

/// Collect every event already sitting in the receiver.
pub fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

pub struct StubProbe {
    online: bool,
}

impl StubProbe {
    pub fn new(online: bool) -> Self {
        Self { online }
    }
}

#[async_trait]
impl ConnectivityProbe for StubProbe {
    async fn check(&self) -> AppResult<()> {
        if self.online {
            Ok(())
        } else {
            Err(AppError::NetworkUnavailable(
                "We cannot reach the model hub".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchMode {
    Quick,
    Slow,
    Failing,
    WithoutMarker,
}

/// Writes fake repository files instead of talking to the hub.
pub struct FakeFetcher {
    mode: FetchMode,
}

impl FakeFetcher {
    pub fn quick() -> Self {
        Self { mode: FetchMode::Quick }
    }

    /// Keeps writing chunks until stopped.
    pub fn slow() -> Self {
        Self { mode: FetchMode::Slow }
    }

    pub fn failing() -> Self {
        Self { mode: FetchMode::Failing }
    }

    /// Completes, but the repository has no weights file.
    pub fn without_marker() -> Self {
        Self { mode: FetchMode::WithoutMarker }
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _entry: &CatalogEntry,
        destination: &Path,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        tokio::fs::write(destination.join("config.json"), "{}").await?;
        match self.mode {
            FetchMode::Quick => {
                tokio::fs::write(destination.join("model.bin"), b"weights").await?;
                ctx.progress("Downloading model.bin", 7, Some(7));
                Ok(())
            }
            FetchMode::Slow => {
                let mut chunk = 0u64;
                loop {
                    ctx.checkpoint()?;
                    tokio::fs::write(destination.join(format!("chunk-{}.part", chunk)), b"x").await?;
                    ctx.progress("Downloading model.bin", chunk, None);
                    chunk += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            FetchMode::Failing => Err(JobError::Transfer(
                anyhow!("connection reset by peer").context("reading model.bin"),
            )),
            FetchMode::WithoutMarker => {
                tokio::fs::write(destination.join("tokenizer.json"), "{}").await?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Reports one progress step (task "working") and succeeds
    Succeed,
    Fail(&'static str),
    Panic,
    UntilStopped,
}

/// Job body that follows a script and records what happened to it.
pub struct ScriptedOperation {
    script: Script,
    kind: JobKind,
    panic_on_discard: bool,
    pub ran: Arc<AtomicBool>,
    pub discarded: Arc<AtomicBool>,
}

impl ScriptedOperation {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            kind: JobKind::Download,
            panic_on_discard: false,
            ran: Arc::new(AtomicBool::new(false)),
            discarded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_panicking_discard(mut self) -> Self {
        self.panic_on_discard = true;
        self
    }
}

#[async_trait]
impl Operation for ScriptedOperation {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        self.ran.store(true, Ordering::SeqCst);
        match self.script {
            Script::Succeed => {
                ctx.progress("working", 1, Some(1));
                Ok(())
            }
            Script::Fail(reason) => Err(JobError::Transfer(anyhow!(reason))),
            Script::Panic => panic!("scripted panic"),
            Script::UntilStopped => loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
        }
    }

    async fn discard(&mut self) -> anyhow::Result<()> {
        self.discarded.store(true, Ordering::SeqCst);
        if self.panic_on_discard {
            panic!("scripted discard panic");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum EngineMode {
    Succeed,
    Fail,
    UntilStopped,
}

/// Engine stand-in that never spawns a process.
pub struct FakeEngine {
    mode: EngineMode,
}

impl FakeEngine {
    /// Writes `transcript.json` into the output directory.
    pub fn succeed() -> Self {
        Self { mode: EngineMode::Succeed }
    }

    pub fn fail() -> Self {
        Self { mode: EngineMode::Fail }
    }

    pub fn until_stopped() -> Self {
        Self { mode: EngineMode::UntilStopped }
    }
}

#[async_trait]
impl TranscriptionEngine for FakeEngine {
    async fn run(&self, params: &TranscriptionParams, ctx: &JobContext) -> Result<(), JobError> {
        match self.mode {
            EngineMode::Succeed => {
                ctx.progress("Transcribing", 1, Some(1));
                tokio::fs::write(params.output_dir.join("transcript.json"), "[]").await?;
                Ok(())
            }
            EngineMode::Fail => Err(JobError::Engine(anyhow!("model crashed"))),
            EngineMode::UntilStopped => loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
        }
    }
}
