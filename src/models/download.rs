//! # Model Downloads
//!
//! Turns "download model X" requests into registry jobs and manages the
//! on-disk result.
//!
//! ## Download Flow:
//! 1. Look the model up in the catalog (`NotFound` otherwise)
//! 2. Refuse early if a job for it is already running
//! 3. Run the connectivity probe; an offline machine fails here with
//!    `NetworkUnavailable`, before any job or directory exists
//! 4. Start a `DownloadModel` job that fetches into a staging directory and
//!    renames it into place only after every file arrived
//!
//! Because the marker file only ever appears in the final directory through
//! that rename, a failed or cancelled download can never read as downloaded,
//! and discarding it never touches an earlier completed copy.

use crate::error::{AppError, AppResult};
use crate::jobs::{JobContext, JobError, JobKind, JobRegistry, JobTicket, Operation};
use crate::models::catalog::{contains_marker, CatalogEntry, CatalogReader};
use crate::models::fetch::AssetFetcher;
use crate::models::placement::StorageLayout;
use crate::models::probe::ConnectivityProbe;
use anyhow::anyhow;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Job body for one model download.
pub struct DownloadModel {
    entry: CatalogEntry,
    staging_dir: PathBuf,
    final_dir: PathBuf,
    marker_extension: String,
    fetcher: Arc<dyn AssetFetcher>,
}

impl DownloadModel {
    pub fn new(
        entry: CatalogEntry,
        layout: &StorageLayout,
        marker_extension: impl Into<String>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self {
            staging_dir: layout.staging_dir(&entry.id, entry.class),
            final_dir: layout.model_dir(&entry.id, entry.class),
            entry,
            marker_extension: marker_extension.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl Operation for DownloadModel {
    fn kind(&self) -> JobKind {
        JobKind::Download
    }

    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        // leftovers of a crashed process
        if tokio::fs::try_exists(&self.staging_dir).await? {
            tokio::fs::remove_dir_all(&self.staging_dir).await?;
        }
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        self.fetcher
            .fetch(&self.entry, &self.staging_dir, ctx)
            .await?;
        ctx.checkpoint()?;

        if !contains_marker(&self.staging_dir, &self.marker_extension)? {
            return Err(JobError::Transfer(anyhow!(
                "repository {} has no .{} file",
                self.entry.repo_id,
                self.marker_extension
            )));
        }

        if tokio::fs::try_exists(&self.final_dir).await? {
            tokio::fs::remove_dir_all(&self.final_dir).await?;
        }
        tokio::fs::rename(&self.staging_dir, &self.final_dir).await?;
        info!(model = %self.entry.id, dir = %self.final_dir.display(), "Model installed");
        Ok(())
    }

    async fn discard(&mut self) -> anyhow::Result<()> {
        if tokio::fs::try_exists(&self.staging_dir).await? {
            debug!(dir = %self.staging_dir.display(), "Removing partial download");
            tokio::fs::remove_dir_all(&self.staging_dir).await?;
        }
        Ok(())
    }
}

/// Model management entry point used by the HTTP layer.
#[derive(Clone)]
pub struct ModelService {
    catalog: CatalogReader,
    registry: JobRegistry,
    probe: Arc<dyn ConnectivityProbe>,
    fetcher: Arc<dyn AssetFetcher>,
    preferred_model: Option<String>,
}

impl ModelService {
    pub fn new(
        catalog: CatalogReader,
        registry: JobRegistry,
        probe: Arc<dyn ConnectivityProbe>,
        fetcher: Arc<dyn AssetFetcher>,
        preferred_model: Option<String>,
    ) -> Self {
        Self {
            catalog,
            registry,
            probe,
            fetcher,
            preferred_model,
        }
    }

    pub fn catalog(&self) -> &CatalogReader {
        &self.catalog
    }

    pub fn default_model(&self) -> AppResult<Option<String>> {
        self.catalog.default_model(self.preferred_model.as_deref())
    }

    /// Start downloading a model. Returns once the job is running.
    pub async fn request_download(&self, model_id: &str) -> AppResult<JobTicket> {
        let entry = self.catalog.entry(model_id)?;
        if self.registry.is_active(model_id) {
            return Err(AppError::AlreadyRunning(model_id.to_string()));
        }

        self.probe.check().await?;

        let operation = DownloadModel::new(
            entry,
            self.catalog.layout(),
            self.catalog.marker_extension(),
            Arc::clone(&self.fetcher),
        );
        self.registry.start(model_id, operation)
    }

    /// Cancel the download of one model and wait for its cleanup.
    pub async fn stop_download(&self, model_id: &str) -> bool {
        self.registry.stop(model_id).await
    }

    pub async fn stop_all_downloads(&self) -> usize {
        self.registry.stop_all_of(JobKind::Download).await
    }

    /// Remove a downloaded model from every storage root.
    ///
    /// Returns whether anything was removed.
    pub async fn delete_model(&self, model_id: &str) -> AppResult<bool> {
        self.catalog.entry(model_id)?;
        if self.registry.is_active(model_id) {
            return Err(AppError::AlreadyRunning(model_id.to_string()));
        }

        let mut removed = false;
        for root in self.catalog.layout().roots() {
            let dir = root.join(model_id);
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
                removed = true;
            }
        }
        info!(model = model_id, removed, "Model deleted");
        Ok(removed)
    }
}
