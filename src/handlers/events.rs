//! Job observation endpoints: the in-flight job list and the live event stream.

use crate::{error::AppError, state::AppState};
use actix_web::{http::header, web, HttpResponse};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;

/// Comment line sent periodically so proxies keep idle streams open.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn list_jobs(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "jobs": state.registry.snapshot()
    })))
}

/// Server-sent events for every job.
///
/// ## Endpoint: `GET /api/v1/events`
///
/// Only events published after the client connected are delivered.
/// ```text
/// event: progress
/// data: {"type":"progress","resource":"large-v3","task":"Downloading model.bin","current":4194304,"total":3087007744}
/// ```
pub async fn event_stream(state: web::Data<AppState>) -> HttpResponse {
    let events = state
        .events()
        .stream()
        .map(|event| Ok::<_, actix_web::Error>(web::Bytes::from(event.to_sse())));
    let keep_alive = IntervalStream::new(tokio::time::interval(KEEP_ALIVE_INTERVAL))
        .map(|_| Ok::<_, actix_web::Error>(web::Bytes::from_static(b": keep-alive\n\n")));

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream::select(events, keep_alive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEvent;
    use crate::jobs::JobKind;
    use crate::testing::{ScriptedOperation, Script, TestStorage};
    use actix_web::{body::MessageBody, test, App};

    #[actix_web::test]
    async fn test_event_stream_delivers_sse_messages() {
        let storage = TestStorage::new();
        let state = web::Data::new(AppState::for_tests(&storage, true));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/events", web::get().to(event_stream)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/events").to_request()).await;
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        state.events().publish(JobEvent::Cancelled {
            resource: "large".into(),
            kind: JobKind::Download,
        });

        let mut body = resp.into_body();
        let mut received = String::new();
        while !received.contains("event: error") {
            let chunk = std::future::poll_fn(|cx| std::pin::Pin::new(&mut body).poll_next(cx))
                .await
                .unwrap()
                .unwrap();
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(received.contains(r#""type":"cancelled""#));
    }

    #[actix_web::test]
    async fn test_list_jobs() {
        let storage = TestStorage::new();
        let state = web::Data::new(AppState::for_tests(&storage, true));
        state
            .registry
            .start("large", ScriptedOperation::new(Script::UntilStopped))
            .unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/jobs", web::get().to(list_jobs)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/jobs").to_request()).await;
        assert_eq!(body["jobs"][0]["resource"], "large");
        assert_eq!(body["jobs"][0]["kind"], "download");
        assert_eq!(body["jobs"][0]["state"], "running");

        state.registry.stop_all().await;
    }
}
