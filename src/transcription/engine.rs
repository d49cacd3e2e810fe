//! # Transcription Engine
//!
//! The speech-to-text and speaker diarization work itself happens in an
//! external engine. This module defines what a transcription run needs and
//! drives the engine as a child process.
//!
//! ## Engine Command Line:
//! ```text
//! <program> <extra_args...> transcribe <input>
//!     --model <name> --model-dir <dir> --language <code>
//!     --device <cpu|gpu> --compute-type <int8|float16>
//!     --output-dir <dir> [--speaker-detection [--num-speakers <n>]]
//! ```
//!
//! ## Progress Protocol:
//! Each stdout line of the form `{"task": "...", "current": 3, "total": 10}`
//! becomes a progress event. Any other output is only logged.
//!
//! ## Cancellation:
//! The child is killed as soon as the job's stop signal fires, and the run
//! reports `JobError::Cancelled`.

use crate::jobs::{JobContext, JobError};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Stderr kept for the failure diagnostic.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Compute device for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            _ => Err(format!("Unknown device: {}", s)),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu => write!(f, "gpu"),
        }
    }
}

/// Numeric precision the engine runs the model with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    #[default]
    Int8,
    Float16,
}

impl std::str::FromStr for ComputeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int8" => Ok(ComputeType::Int8),
            "float16" => Ok(ComputeType::Float16),
            _ => Err(format!("Unknown compute type: {}", s)),
        }
    }
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeType::Int8 => write!(f, "int8"),
            ComputeType::Float16 => write!(f, "float16"),
        }
    }
}

/// Everything one transcription run needs.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionParams {
    pub file_id: String,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub model: String,
    pub model_dir: PathBuf,
    pub language: String,
    pub speaker_detection: bool,
    /// `None` lets the engine detect the speaker count
    pub num_speakers: Option<u32>,
    pub device: Device,
    pub compute_type: ComputeType,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe `params.input` into `params.output_dir`.
    async fn run(&self, params: &TranscriptionParams, ctx: &JobContext) -> Result<(), JobError>;
}

#[derive(Debug, Deserialize)]
struct EngineProgress {
    task: String,
    current: u64,
    total: Option<u64>,
}

/// Runs an external engine program per transcription.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    extra_args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    fn command(&self, params: &TranscriptionParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg("transcribe")
            .arg(&params.input)
            .arg("--model")
            .arg(&params.model)
            .arg("--model-dir")
            .arg(&params.model_dir)
            .arg("--language")
            .arg(&params.language)
            .arg("--device")
            .arg(params.device.to_string())
            .arg("--compute-type")
            .arg(params.compute_type.to_string())
            .arg("--output-dir")
            .arg(&params.output_dir);

        if params.speaker_detection {
            cmd.arg("--speaker-detection");
            if let Some(count) = params.num_speakers {
                cmd.arg("--num-speakers").arg(count.to_string());
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn kill(child: &mut Child, file_id: &str) {
        if let Err(err) = child.kill().await {
            warn!(file_id, error = %err, "Failed to kill transcription engine");
        }
    }
}

#[async_trait]
impl TranscriptionEngine for CommandEngine {
    async fn run(&self, params: &TranscriptionParams, ctx: &JobContext) -> Result<(), JobError> {
        let mut child = self.command(params).spawn().map_err(|e| {
            JobError::Engine(anyhow!(e).context(format!("starting {}", self.program)))
        })?;
        info!(file_id = %params.file_id, model = %params.model, "Transcription engine started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Engine(anyhow!("engine stdout was not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Engine(anyhow!("engine stderr was not captured")))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&buf[start..]).trim().to_string()
        });

        let stop = ctx.stop_signal().clone();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = stop.stopped() => {
                    Self::kill(&mut child, &params.file_id).await;
                    return Err(JobError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => match serde_json::from_str::<EngineProgress>(&line) {
                        Ok(progress) => ctx.progress(progress.task, progress.current, progress.total),
                        Err(_) => debug!(file_id = %params.file_id, line = %line, "Engine output"),
                    },
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = stop.stopped() => {
                Self::kill(&mut child, &params.file_id).await;
                return Err(JobError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            return Ok(());
        }

        let stderr_tail = stderr_task.await.unwrap_or_default();
        Err(JobError::Engine(
            anyhow::Error::msg(stderr_tail).context(format!("{} exited with {}", self.program, status)),
        ))
    }
}
