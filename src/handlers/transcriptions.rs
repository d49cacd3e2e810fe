//! # Transcription REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /transcriptions` - Upload audio and start a transcription job
//! - `DELETE /transcriptions/{file_id}` - Cancel one transcription
//! - `POST /transcriptions/stop` - Cancel every running transcription

use crate::transcription::{ComputeType, Device, PendingUpload, TranscriptionRequest, TranscriptionService};
use crate::{error::AppError, state::AppState};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

/// Upper bound for a single text field of the form.
const MAX_TEXT_FIELD_BYTES: usize = 4 * 1024;

/// Upload an audio file and start transcribing it.
///
/// ## Endpoint: `POST /api/v1/transcriptions`
///
/// ## Request:
/// Multipart form data with fields:
/// - `file`: the audio file
/// - `model`: a downloaded model id
/// - `language`: a language code supported by the model (default `auto-detect`)
/// - `speaker_detection`: `true` to label speakers
/// - `num_speakers`: expected number of speakers, empty to detect
/// - `device`: `cpu` or `gpu`
/// - `compute_type`: `int8` or `float16`
///
/// ## Response (`202 Accepted`):
/// ```json
/// {
///   "file_id": "2025-01-01 10-00-00 interview",
///   "job_id": "4b0f5c3e-...",
///   "status": "started"
/// }
/// ```
pub async fn create_transcription(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let service = &state.transcriptions;
    // removes the upload directory on any early return or disconnect
    let mut pending = PendingUpload::default();

    let fields = receive_form(service, &mut payload, &mut pending).await?;
    if pending.get().is_none() {
        return Err(AppError::ValidationError("No audio file provided".to_string()));
    }
    let request = parse_request(&fields)?;

    let upload = pending
        .into_upload()
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let ticket = service.start(upload, request).await?;
    Ok(HttpResponse::Accepted().json(json!({
        "file_id": ticket.resource,
        "job_id": ticket.job_id,
        "status": "started"
    })))
}

/// Cancel one transcription and wait until its output directory is gone.
pub async fn stop_transcription(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let file_id = path.into_inner();
    let stopped = state.transcriptions.stop_transcription(&file_id).await;
    Ok(HttpResponse::Ok().json(json!({
        "file_id": file_id,
        "stopped": stopped
    })))
}

pub async fn stop_all_transcriptions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stopped = state.transcriptions.stop_all_transcriptions().await;
    Ok(HttpResponse::Ok().json(json!({ "stopped": stopped })))
}

/// Stream the file part to disk and collect the text parts.
async fn receive_form(
    service: &TranscriptionService,
    payload: &mut Multipart,
    pending: &mut PendingUpload,
) -> Result<HashMap<String, String>, AppError> {
    let mut fields = HashMap::new();

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        if field_name == "file" {
            if pending.get().is_some() {
                return Err(AppError::ValidationError("Only one file per request".to_string()));
            }
            let filename = content_disposition.get_filename().unwrap_or_default().to_string();
            let target = pending.set(service.prepare_upload(&filename).await?);

            let mut file = tokio::fs::File::create(&target.input).await?;
            while let Some(chunk) = field.next().await {
                let chunk =
                    chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
        } else {
            let mut value = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk =
                    chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                if value.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
                    return Err(AppError::ValidationError(format!("Field '{}' is too large", field_name)));
                }
                value.extend_from_slice(&chunk);
            }
            let value = String::from_utf8(value)
                .map_err(|_| AppError::ValidationError(format!("Field '{}' is not UTF-8", field_name)))?;
            fields.insert(field_name, value.trim().to_string());
        }
    }

    Ok(fields)
}

fn parse_request(fields: &HashMap<String, String>) -> Result<TranscriptionRequest, AppError> {
    let text = |name: &str| fields.get(name).map(String::as_str).filter(|v| !v.is_empty());

    let model = text("model")
        .ok_or_else(|| AppError::ValidationError("Field 'model' is required".to_string()))?
        .to_string();
    let language = text("language").unwrap_or("auto-detect").to_string();
    let speaker_detection = matches!(text("speaker_detection"), Some("true" | "on" | "1"));

    let num_speakers = text("num_speakers")
        .map(|v| {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| AppError::ValidationError(format!("Invalid number of speakers: {}", v)))
        })
        .transpose()?;
    let device = text("device")
        .map(|v| v.parse::<Device>())
        .transpose()
        .map_err(AppError::ValidationError)?
        .unwrap_or_default();
    let compute_type = text("compute_type")
        .map(|v| v.parse::<ComputeType>())
        .transpose()
        .map_err(AppError::ValidationError)?
        .unwrap_or_default();

    Ok(TranscriptionRequest {
        model,
        language,
        speaker_detection,
        num_speakers,
        device,
        compute_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobOutcome};
    use crate::testing::{Script, ScriptedOperation, TestStorage};
    use actix_web::{http::StatusCode, test as actix_test, App};

    const BOUNDARY: &str = "----transcriber-test";

    fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> String {
        let mut body = String::new();
        for (name, filename, value) in parts {
            body.push_str(&format!("--{}\r\n", BOUNDARY));
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: audio/wav\r\n\r\n",
                    name, filename
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    name
                )),
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        body
    }

    fn upload_request(parts: &[(&str, Option<&str>, &str)]) -> actix_test::TestRequest {
        actix_test::TestRequest::post()
            .uri("/transcriptions")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(parts))
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_request_defaults() {
        let request = parse_request(&fields(&[("model", "large")])).unwrap();
        assert_eq!(request.language, "auto-detect");
        assert!(!request.speaker_detection);
        assert_eq!(request.num_speakers, None);
        assert_eq!(request.device, Device::Cpu);
        assert_eq!(request.compute_type, ComputeType::Int8);
    }

    #[test]
    fn test_parse_request_rejects_bad_values() {
        assert!(parse_request(&fields(&[])).is_err());
        assert!(parse_request(&fields(&[("model", "large"), ("num_speakers", "zero")])).is_err());
        assert!(parse_request(&fields(&[("model", "large"), ("device", "tpu")])).is_err());

        let request = parse_request(&fields(&[
            ("model", "large"),
            ("speaker_detection", "true"),
            ("num_speakers", "2"),
            ("device", "GPU"),
            ("compute_type", "float16"),
        ]))
        .unwrap();
        assert!(request.speaker_detection);
        assert_eq!(request.num_speakers, Some(2));
        assert_eq!(request.device, Device::Gpu);
        assert_eq!(request.compute_type, ComputeType::Float16);
    }

    #[actix_web::test]
    async fn test_upload_starts_transcription() {
        let storage = TestStorage::new();
        storage.install_model("large", storage.general_dir());
        let state = web::Data::new(AppState::for_tests(&storage, true));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/transcriptions", web::post().to(create_transcription)),
        )
        .await;

        let resp = actix_test::call_service(
            &app,
            upload_request(&[
                ("model", None, "large"),
                ("language", None, "en"),
                ("file", Some("interview.wav"), "RIFF"),
            ])
            .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        let file_id = body["file_id"].as_str().unwrap().to_string();
        assert!(file_id.ends_with(" interview"));

        while state.registry.is_active(&file_id) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let dir = storage.transcriptions_dir().join(&file_id);
        assert_eq!(std::fs::read(dir.join("interview.wav")).unwrap(), b"RIFF");
        assert!(dir.join("transcript.json").is_file());
    }

    #[actix_web::test]
    async fn test_rejected_upload_leaves_no_directory() {
        let storage = TestStorage::new();
        let state = web::Data::new(AppState::for_tests(&storage, true));
        let app = actix_test::init_service(
            App::new()
                .app_data(state)
                .route("/transcriptions", web::post().to(create_transcription)),
        )
        .await;

        // model not downloaded
        let resp = actix_test::call_service(
            &app,
            upload_request(&[("file", Some("interview.wav"), "RIFF"), ("model", None, "large")])
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // missing model field
        let resp = actix_test::call_service(
            &app,
            upload_request(&[("file", Some("interview.wav"), "RIFF")]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let leftovers = std::fs::read_dir(storage.transcriptions_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[actix_web::test]
    async fn test_stop_single_transcription() {
        let storage = TestStorage::new();
        let state = web::Data::new(AppState::for_tests(&storage, true));
        let file_id = "2025-01-01 10-00-00 interview";
        let ticket = state
            .registry
            .start(
                file_id,
                ScriptedOperation::new(Script::UntilStopped).with_kind(JobKind::Transcription),
            )
            .unwrap();
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/transcriptions/{file_id}", web::delete().to(stop_transcription)),
        )
        .await;

        let body: serde_json::Value = actix_test::call_and_read_body_json(
            &app,
            actix_test::TestRequest::delete()
                .uri("/transcriptions/2025-01-01%2010-00-00%20interview")
                .to_request(),
        )
        .await;
        assert_eq!(body["file_id"], file_id);
        assert_eq!(body["stopped"], true);
        assert_eq!(ticket.wait().await, JobOutcome::Cancelled);
        assert!(!state.registry.is_active(file_id));

        let body: serde_json::Value = actix_test::call_and_read_body_json(
            &app,
            actix_test::TestRequest::delete().uri("/transcriptions/unknown").to_request(),
        )
        .await;
        assert_eq!(body["stopped"], false);
    }
}
