//! # Transcriber Backend - Main Application Entry Point
//!
//! HTTP backend of a local transcription web UI. It manages the two kinds of
//! long-running work the UI starts: speech model downloads and transcription
//! runs. Both run as cancellable background jobs whose progress is pushed to
//! the browser as server-sent events.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state, services and request metrics
//! - **jobs**: Job registry, cancellable workers and the job lifecycle
//! - **events**: Broadcast of job lifecycle events
//! - **models**: Model catalog, storage placement, connectivity probe and downloads
//! - **transcription**: External engine driver and transcription jobs
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request metrics
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Error types and HTTP error responses

mod config;
mod error;
mod events;
mod handlers;
mod health;
mod jobs;
mod middleware;
mod models;
mod state;
mod transcription;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::jobs::JobRegistry;
use crate::state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        models_dir = %config.storage.models_dir.display(),
        transcriptions_dir = %config.storage.transcriptions_dir.display(),
        engine = %config.engine.program,
        "Configuration loaded"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = web::Data::new(AppState::from_config(config)?);
    let registry = app_state.registry.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(web::scope("/api/v1").configure(api_routes))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    // SSE connections never finish on their own
    .shutdown_timeout(5)
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping jobs and server...");
            // Stopping jobs first lets requests waiting on them finish.
            stop_jobs(&registry).await;
            server_handle.stop(true).await;
        }
    }

    // Jobs started while the server was draining, or left by a server error.
    stop_jobs(&registry).await;

    info!("Server stopped gracefully");
    Ok(())
}

async fn stop_jobs(registry: &JobRegistry) {
    let stopped = registry.stop_all().await;
    if stopped > 0 {
        info!(stopped, "Cancelled running jobs");
    }
}

fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/config", web::get().to(handlers::get_config))
        .route("/models", web::get().to(handlers::list_models))
        .route("/models/downloaded", web::get().to(handlers::list_downloaded))
        .route("/models/downloads/stop", web::post().to(handlers::stop_all_downloads))
        .route("/models/{id}/languages", web::get().to(handlers::model_languages))
        .route("/models/{id}/download", web::post().to(handlers::download_model))
        .route("/models/{id}/download", web::delete().to(handlers::stop_download))
        .route("/models/{id}", web::delete().to(handlers::delete_model))
        .route("/transcriptions", web::post().to(handlers::create_transcription))
        .route("/transcriptions/stop", web::post().to(handlers::stop_all_transcriptions))
        .route("/transcriptions/{file_id}", web::delete().to(handlers::stop_transcription))
        .route("/jobs", web::get().to(handlers::list_jobs))
        .route("/events", web::get().to(handlers::event_stream));
}

/// `RUST_LOG` controls filtering, defaulting to
/// "transcriber_backend=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcriber_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere).
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C");
    }
}
