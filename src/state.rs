//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Ownership:
//! - The configuration is fixed after startup, so it sits in a plain `Arc`
//! - Request metrics change on every request and sit behind an `RwLock`
//! - The job registry and the event bus are single per process; the model and
//!   transcription services hold clones of them

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::jobs::{JobKind, JobRegistry};
use crate::models::{CatalogReader, HttpProbe, HubFetcher, ModelService, Platform, StorageLayout};
use crate::transcription::{CommandEngine, TranscriptionService};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub registry: JobRegistry,
    pub models: ModelService,
    pub transcriptions: TranscriptionService,
}

/// Request metrics collected by the metrics middleware.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire up the production services from configuration.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let events = EventBus::new(config.events.capacity);
        let registry = JobRegistry::new(events);

        let layout = StorageLayout::new(
            config.storage.models_dir.clone(),
            config.storage.required_models_dir.clone(),
            Platform::current(),
        );
        let catalog = CatalogReader::new(
            config.catalog.models_file.clone(),
            config.catalog.languages_file.clone(),
            layout,
            config.storage.marker_extension.clone(),
        );

        let probe = HttpProbe::new(config.network.probe_url.clone(), config.network.probe_timeout())?;
        let models = ModelService::new(
            catalog.clone(),
            registry.clone(),
            Arc::new(probe),
            Arc::new(HubFetcher::new()?),
            config.catalog.preferred_model.clone(),
        );

        let engine = CommandEngine::new(config.engine.program.clone(), config.engine.extra_args.clone());
        let transcriptions = TranscriptionService::new(
            catalog,
            registry.clone(),
            Arc::new(engine),
            config.storage.transcriptions_dir.clone(),
        );

        Ok(Self::new(config, registry, models, transcriptions))
    }

    pub fn new(
        config: AppConfig,
        registry: JobRegistry,
        models: ModelService,
        transcriptions: TranscriptionService,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            models,
            transcriptions,
        }
    }

    pub fn events(&self) -> &EventBus {
        self.registry.events()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record one request against an endpoint like "GET /api/v1/models".
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    /// In-flight jobs per kind.
    pub fn active_jobs(&self) -> HashMap<JobKind, usize> {
        let mut counts = HashMap::from([(JobKind::Download, 0), (JobKind::Transcription, 0)]);
        for job in self.registry.snapshot() {
            *counts.entry(job.kind).or_default() += 1;
        }
        counts
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State backed by a temporary storage tree and test doubles.
    pub fn for_tests(storage: &crate::testing::TestStorage, online: bool) -> Self {
        use crate::testing::{FakeEngine, FakeFetcher, StubProbe};

        let registry = JobRegistry::new(EventBus::new(64));
        let models = ModelService::new(
            storage.catalog(),
            registry.clone(),
            Arc::new(StubProbe::new(online)),
            Arc::new(FakeFetcher::quick()),
            Some("large".to_string()),
        );
        let transcriptions = TranscriptionService::new(
            storage.catalog(),
            registry.clone(),
            Arc::new(FakeEngine::succeed()),
            storage.transcriptions_dir(),
        );
        Self::new(AppConfig::default(), registry, models, transcriptions)
    }
}
