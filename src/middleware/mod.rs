//! Request middleware. Request logging itself is handled by
//! `tracing_actix_web::TracingLogger` in `main.rs`.

pub mod metrics;

pub use metrics::MetricsMiddleware;
