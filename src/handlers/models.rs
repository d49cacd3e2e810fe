//! # Model Management REST API Handlers
//!
//! ## Available Endpoints:
//! - `GET /models` - Catalog with download state, downloaded models first
//! - `GET /models/downloaded` - Downloaded model ids and the default model
//! - `GET /models/{id}/languages` - Languages a model can transcribe
//! - `POST /models/{id}/download` - Start a download (`?wait=true` blocks until it ends)
//! - `DELETE /models/{id}/download` - Cancel a running download
//! - `POST /models/downloads/stop` - Cancel every running download
//! - `DELETE /models/{id}` - Delete a downloaded model

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    /// Block until the download ends and return the refreshed catalog
    #[serde(default)]
    pub wait: bool,
}

/// ## Response:
/// ```json
/// {
///   "models": [
///     { "model": "large-v3", "size": "3.09 GB", "required": false, "downloaded": true }
///   ]
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let models = state.models.catalog().annotated_catalog()?;
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "models": models
    })))
}

pub async fn list_downloaded(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let downloaded = state.models.catalog().list_downloaded()?;
    let default_model = state.models.default_model()?;
    Ok(HttpResponse::Ok().json(json!({
        "downloaded": downloaded,
        "default_model": default_model
    })))
}

pub async fn model_languages(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let model = path.into_inner();
    let languages = state.models.catalog().languages_for(&model)?;
    Ok(HttpResponse::Ok().json(json!({
        "model": model,
        "languages": languages
    })))
}

/// Start downloading a model.
///
/// ## Endpoint: `POST /api/v1/models/{id}/download`
///
/// Without `wait` this answers `202 Accepted` as soon as the job runs; progress
/// and the outcome arrive on the event stream. With `?wait=true` it answers
/// once the job has ended:
/// ```json
/// {
///   "outcome": { "outcome": "completed" },
///   "models": [ ... ]
/// }
/// ```
pub async fn download_model(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<DownloadQuery>,
) -> Result<HttpResponse, AppError> {
    let model = path.into_inner();
    let ticket = state.models.request_download(&model).await?;

    if !query.wait {
        return Ok(HttpResponse::Accepted().json(json!({
            "model": model,
            "job_id": ticket.job_id,
            "status": "started"
        })));
    }

    let outcome = ticket.wait().await;
    let models = state.models.catalog().annotated_catalog()?;
    Ok(HttpResponse::Ok().json(json!({
        "model": model,
        "job_id": ticket.job_id,
        "outcome": outcome,
        "models": models
    })))
}

/// Cancel one download and wait until its partial files are gone.
pub async fn stop_download(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let model = path.into_inner();
    let stopped = state.models.stop_download(&model).await;
    Ok(HttpResponse::Ok().json(json!({
        "model": model,
        "stopped": stopped
    })))
}

pub async fn stop_all_downloads(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stopped = state.models.stop_all_downloads().await;
    Ok(HttpResponse::Ok().json(json!({ "stopped": stopped })))
}

pub async fn delete_model(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let model = path.into_inner();
    if !state.models.delete_model(&model).await? {
        return Err(AppError::NotFound(format!("Model '{}' is not downloaded", model)));
    }
    Ok(HttpResponse::Ok().json(json!({
        "model": model,
        "deleted": true
    })))
}
