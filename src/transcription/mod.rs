//! # Transcription Module
//!
//! Runs uploaded audio through the external speech-to-text engine as
//! background jobs.
//!
//! ## Key Components:
//! - **Engine** (`engine.rs`): the engine seam and the child-process implementation
//! - **Job** (`job.rs`): upload directories, request validation, the job body
//!   and the service the HTTP layer calls

pub mod engine;
pub mod job;

pub use engine::{CommandEngine, ComputeType, Device};
pub use job::{PendingUpload, TranscriptionRequest, TranscriptionService};
