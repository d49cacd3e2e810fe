//! Transcription jobs: upload bookkeeping, request validation and the job
//! body that hands the audio to the engine.
//!
//! Each upload gets its own directory under the transcriptions root, named
//! by its file id (`<YYYY-MM-DD HH-MM-SS> <stem>`). The engine writes its
//! outputs next to the uploaded audio; a failed or cancelled run removes the
//! whole directory.

use crate::error::{AppError, AppResult};
use crate::jobs::{JobContext, JobError, JobKind, JobRegistry, JobTicket, Operation};
use crate::models::catalog::CatalogReader;
use crate::transcription::engine::{ComputeType, Device, TranscriptionEngine, TranscriptionParams};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options the user picked for one transcription.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub language: String,
    pub speaker_detection: bool,
    pub num_speakers: Option<u32>,
    pub device: Device,
    pub compute_type: ComputeType,
}

/// An uploaded audio file waiting for its transcription job.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_id: String,
    pub dir: PathBuf,
    pub input: PathBuf,
}

/// Owns an upload while the request that created it is still running.
///
/// Dropping it removes the upload directory. This covers every way a request
/// can end early, including the client disconnecting mid-upload, which drops
/// the handler future. Call `into_upload` once the upload is handed on.
#[derive(Debug, Default)]
pub struct PendingUpload {
    upload: Option<Upload>,
}

impl PendingUpload {
    pub fn get(&self) -> Option<&Upload> {
        self.upload.as_ref()
    }

    pub fn set(&mut self, upload: Upload) -> &Upload {
        self.upload.insert(upload)
    }

    /// Release the upload without removing it.
    pub fn into_upload(mut self) -> Option<Upload> {
        self.upload.take()
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if let Some(upload) = self.upload.take() {
            match std::fs::remove_dir_all(&upload.dir) {
                Ok(()) => debug!(file_id = %upload.file_id, "Removed unfinished upload"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(dir = %upload.dir.display(), error = %err, "Failed to remove unfinished upload")
                }
            }
        }
    }
}

/// Job body for one transcription.
pub struct TranscriptionJob {
    params: TranscriptionParams,
    engine: Arc<dyn TranscriptionEngine>,
}

#[async_trait]
impl Operation for TranscriptionJob {
    fn kind(&self) -> JobKind {
        JobKind::Transcription
    }

    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.checkpoint()?;
        self.engine.run(&self.params, ctx).await?;
        info!(file_id = %self.params.file_id, "Transcription finished");
        Ok(())
    }

    async fn discard(&mut self) -> anyhow::Result<()> {
        if tokio::fs::try_exists(&self.params.output_dir).await? {
            debug!(dir = %self.params.output_dir.display(), "Removing transcription output");
            tokio::fs::remove_dir_all(&self.params.output_dir).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TranscriptionService {
    catalog: CatalogReader,
    registry: JobRegistry,
    engine: Arc<dyn TranscriptionEngine>,
    transcriptions_dir: PathBuf,
}

impl TranscriptionService {
    pub fn new(
        catalog: CatalogReader,
        registry: JobRegistry,
        engine: Arc<dyn TranscriptionEngine>,
        transcriptions_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            registry,
            engine,
            transcriptions_dir,
        }
    }

    /// Reserve a fresh directory for an uploaded file.
    pub async fn prepare_upload(&self, filename: &str) -> AppResult<Upload> {
        let name = Path::new(filename)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::BadRequest("Uploaded file has no name".to_string()))?;
        let stem = Path::new(&name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| name.clone());

        tokio::fs::create_dir_all(&self.transcriptions_dir).await?;
        let base_id = format!("{} {}", Utc::now().format("%Y-%m-%d %H-%M-%S"), stem);

        let mut file_id = base_id.clone();
        let mut attempt = 1;
        loop {
            let dir = self.transcriptions_dir.join(&file_id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    let input = dir.join(&name);
                    return Ok(Upload { file_id, dir, input });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    attempt += 1;
                    file_id = format!("{} ({})", base_id, attempt);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Validate the request and start transcribing `upload`.
    ///
    /// The upload directory is removed if the job cannot be started.
    pub async fn start(&self, upload: Upload, request: TranscriptionRequest) -> AppResult<JobTicket> {
        let result = self.start_job(&upload, request);
        if result.is_err() {
            self.discard_upload(&upload).await;
        }
        result
    }

    /// Remove an upload that will never be transcribed.
    async fn discard_upload(&self, upload: &Upload) {
        if let Err(err) = tokio::fs::remove_dir_all(&upload.dir).await {
            warn!(dir = %upload.dir.display(), error = %err, "Failed to remove rejected upload");
        }
    }

    fn start_job(&self, upload: &Upload, request: TranscriptionRequest) -> AppResult<JobTicket> {
        let model_dir = self.catalog.downloaded_dir(&request.model)?.ok_or_else(|| {
            AppError::ValidationError(format!("Model '{}' is not downloaded", request.model))
        })?;

        let languages = self.catalog.languages_for(&request.model)?;
        if !languages.contains_key(&request.language) {
            return Err(AppError::ValidationError(format!(
                "Model '{}' does not support language '{}'",
                request.model, request.language
            )));
        }

        let params = TranscriptionParams {
            file_id: upload.file_id.clone(),
            input: upload.input.clone(),
            output_dir: upload.dir.clone(),
            model: request.model,
            model_dir,
            language: request.language,
            speaker_detection: request.speaker_detection,
            num_speakers: request.num_speakers.filter(|_| request.speaker_detection),
            device: request.device,
            compute_type: request.compute_type,
        };
        let job = TranscriptionJob {
            params,
            engine: Arc::clone(&self.engine),
        };
        self.registry.start(&upload.file_id, job)
    }

    pub async fn stop_transcription(&self, file_id: &str) -> bool {
        self.registry.stop(file_id).await
    }

    /// Stop every running transcription; downloads keep going.
    pub async fn stop_all_transcriptions(&self) -> usize {
        self.registry.stop_all_of(JobKind::Transcription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, JobEvent};
    use crate::jobs::JobOutcome;
    use crate::testing::{drain, FakeEngine, ScriptedOperation, Script, TestStorage};

    fn request(model: &str, language: &str) -> TranscriptionRequest {
        TranscriptionRequest {
            model: model.to_string(),
            language: language.to_string(),
            speaker_detection: false,
            num_speakers: Some(3),
            device: Device::Cpu,
            compute_type: ComputeType::Int8,
        }
    }

    fn service(storage: &TestStorage, engine: FakeEngine) -> (TranscriptionService, EventBus) {
        let bus = EventBus::new(64);
        let service = TranscriptionService::new(
            storage.catalog(),
            JobRegistry::new(bus.clone()),
            Arc::new(engine),
            storage.transcriptions_dir(),
        );
        (service, bus)
    }

    async fn stage_upload(service: &TranscriptionService, name: &str) -> Upload {
        let upload = service.prepare_upload(name).await.unwrap();
        tokio::fs::write(&upload.input, b"RIFF").await.unwrap();
        upload
    }

    #[tokio::test]
    async fn test_file_id_and_layout() {
        let storage = TestStorage::new();
        let (service, _bus) = service(&storage, FakeEngine::succeed());

        let first = service.prepare_upload("../meetings/interview.wav").await.unwrap();
        assert!(first.file_id.ends_with(" interview"));
        assert_eq!(first.dir, storage.transcriptions_dir().join(&first.file_id));
        assert_eq!(first.input, first.dir.join("interview.wav"));

        assert!(matches!(
            service.prepare_upload("").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_transcription_completes() {
        let storage = TestStorage::new();
        storage.install_model("large", storage.general_dir());
        let (service, bus) = service(&storage, FakeEngine::succeed());
        let mut rx = bus.subscribe();

        let upload = stage_upload(&service, "interview.wav").await;
        let ticket = service.start(upload.clone(), request("large", "en")).await.unwrap();
        assert_eq!(ticket.resource, upload.file_id);
        assert_eq!(ticket.wait().await, JobOutcome::Completed);

        assert!(upload.dir.join("transcript.json").is_file());
        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(JobEvent::Started { kind: JobKind::Transcription, .. })));
        assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_model_must_be_downloaded() {
        let storage = TestStorage::new();
        let (service, _bus) = service(&storage, FakeEngine::succeed());

        let upload = stage_upload(&service, "interview.wav").await;
        let result = service.start(upload.clone(), request("large", "en")).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
        assert!(!upload.dir.exists());
    }

    #[tokio::test]
    async fn test_distil_model_rejects_other_languages() {
        let storage = TestStorage::new();
        storage.install_model("distil-en", storage.general_dir());
        let (service, _bus) = service(&storage, FakeEngine::succeed());

        let upload = stage_upload(&service, "interview.wav").await;
        let result = service.start(upload, request("distil-en", "auto-detect")).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));

        let upload = stage_upload(&service, "interview.wav").await;
        let ticket = service.start(upload, request("distil-en", "en")).await.unwrap();
        assert!(ticket.wait().await.is_completed());
    }

    #[tokio::test]
    async fn test_failed_transcription_removes_output() {
        let storage = TestStorage::new();
        storage.install_model("large", storage.general_dir());
        let (service, bus) = service(&storage, FakeEngine::fail());
        let mut rx = bus.subscribe();

        let upload = stage_upload(&service, "interview.wav").await;
        let outcome = service.start(upload.clone(), request("large", "en")).await.unwrap().wait().await;
        assert!(matches!(outcome, JobOutcome::Failed { ref reason, .. } if reason.contains("engine")));
        assert!(!upload.dir.exists());

        let events = drain(&mut rx);
        assert_eq!(events.last().map(|e| e.stream_name()), Some("error"));
    }

    #[tokio::test]
    async fn test_stop_all_transcriptions_spares_downloads() {
        let storage = TestStorage::new();
        storage.install_model("large", storage.general_dir());
        let (service, _bus) = service(&storage, FakeEngine::until_stopped());

        let download = service
            .registry
            .start("small", ScriptedOperation::new(Script::UntilStopped))
            .unwrap();
        let upload = stage_upload(&service, "interview.wav").await;
        let ticket = service.start(upload.clone(), request("large", "en")).await.unwrap();

        assert_eq!(service.stop_all_transcriptions().await, 1);
        assert_eq!(ticket.wait().await, JobOutcome::Cancelled);
        assert!(!upload.dir.exists());
        assert!(service.registry.is_active("small"));

        service.registry.stop("small").await;
        assert_eq!(download.wait().await, JobOutcome::Cancelled);
        assert_eq!(service.stop_all_transcriptions().await, 0);
    }

    #[tokio::test]
    async fn test_stop_one_transcription() {
        let storage = TestStorage::new();
        storage.install_model("large", storage.general_dir());
        let (service, _bus) = service(&storage, FakeEngine::until_stopped());

        let upload = stage_upload(&service, "interview.wav").await;
        let ticket = service.start(upload.clone(), request("large", "en")).await.unwrap();

        assert!(service.stop_transcription(&upload.file_id).await);
        assert_eq!(ticket.wait().await, JobOutcome::Cancelled);
        assert!(!upload.dir.exists());
        assert!(!service.stop_transcription(&upload.file_id).await);
    }

    #[tokio::test]
    async fn test_pending_upload_is_removed_unless_released() {
        let storage = TestStorage::new();
        let (service, _bus) = service(&storage, FakeEngine::succeed());

        let abandoned = stage_upload(&service, "abandoned.wav").await;
        {
            let mut pending = PendingUpload::default();
            pending.set(abandoned.clone());
        }
        assert!(!abandoned.dir.exists());

        let kept = stage_upload(&service, "kept.wav").await;
        let mut pending = PendingUpload::default();
        pending.set(kept.clone());
        let released = pending.into_upload().unwrap();
        assert_eq!(released.dir, kept.dir);
        assert!(kept.dir.join("kept.wav").is_file());
    }
}
