//! # Model Asset Transfer
//!
//! Downloads the files of a model repository into a directory.
//!
//! ## Transfer Process:
//! 1. Ask the HuggingFace hub (via `hf-hub`) which files the repository has
//! 2. Stream each file with `reqwest`, writing chunk by chunk
//! 3. Check the job's stop signal before every file and every chunk
//! 4. Publish byte progress every few megabytes
//!
//! Every network wait (listing, request, next chunk) is raced against the stop
//! signal, so a stalled connection never delays a stop.
//!
//! The fetcher only ever writes into the directory it is given. Deciding
//! where that is, and promoting or discarding it afterwards, is the caller's job.

use crate::jobs::{JobContext, JobError};
use crate::models::catalog::CatalogEntry;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::StreamExt;
use hf_hub::api::tokio::{Api, ApiBuilder};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Bytes between two progress events for one file.
const PROGRESS_STEP_BYTES: u64 = 4 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest silence tolerated between two reads of a response body.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download every file of `entry` into `destination`.
    ///
    /// Must return `JobError::Cancelled` promptly once `ctx` reports a stop.
    async fn fetch(
        &self,
        entry: &CatalogEntry,
        destination: &Path,
        ctx: &JobContext,
    ) -> Result<(), JobError>;
}

/// Fetches model repositories from the HuggingFace hub.
pub struct HubFetcher {
    api: Api,
    client: reqwest::Client,
    token: Option<String>,
}

impl HubFetcher {
    /// Build a fetcher, picking up `HF_TOKEN` for gated repositories.
    pub fn new() -> anyhow::Result<Self> {
        let token = std::env::var("HF_TOKEN").ok();
        let api = ApiBuilder::new()
            .with_token(token.clone())
            .with_progress(false)
            .build()
            .context("Failed to build HuggingFace API client")?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { api, client, token })
    }
}

/// Stream `url` into `target`, publishing progress under `task`.
async fn download_file(
    client: &reqwest::Client,
    token: Option<&str>,
    url: &str,
    target: &Path,
    task: &str,
    ctx: &JobContext,
) -> Result<(), JobError> {
    let stop = ctx.stop_signal();
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = stop
        .or_stopped(request.send())
        .await?
        .and_then(|response| response.error_for_status())
        .map_err(|e| JobError::Transfer(anyhow!(e).context(format!("requesting {}", url))))?;

    let total = response.content_length();
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut last_reported: u64 = 0;

    while let Some(chunk) = stop.or_stopped(stream.next()).await? {
        let chunk =
            chunk.map_err(|e| JobError::Transfer(anyhow!(e).context(format!("reading {}", url))))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if written - last_reported >= PROGRESS_STEP_BYTES {
            ctx.progress(task, written, total);
            last_reported = written;
        }
    }
    file.flush().await?;
    ctx.progress(task, written, total);
    Ok(())
}

/// Resolve a repository file name below `destination`.
///
/// Only plain relative names are accepted; `..`, roots and prefixes are refused.
fn target_path(destination: &Path, filename: &str) -> Result<PathBuf, JobError> {
    let relative = Path::new(filename);
    let plain = relative.components().next().is_some()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(JobError::Transfer(anyhow!(
            "refusing to write repository file outside the model directory: {}",
            filename
        )));
    }
    Ok(destination.join(relative))
}

#[async_trait]
impl AssetFetcher for HubFetcher {
    async fn fetch(
        &self,
        entry: &CatalogEntry,
        destination: &Path,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let repo = self.api.model(entry.repo_id.clone());
        let info = ctx.stop_signal().or_stopped(repo.info()).await?.map_err(|e| {
            JobError::Transfer(anyhow!(e).context(format!("listing files of {}", entry.repo_id)))
        })?;

        let files: Vec<String> = info
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .filter(|name| !name.starts_with('.'))
            .collect();
        info!(model = %entry.id, repo = %entry.repo_id, files = files.len(), "Downloading model files");

        for filename in files {
            ctx.checkpoint()?;
            let target = target_path(destination, &filename)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(model = %entry.id, file = %filename, "Fetching file");
            let task = format!("Downloading {}", filename);
            download_file(
                &self.client,
                self.token.as_deref(),
                &repo.url(&filename),
                &target,
                &task,
                ctx,
            )
            .await?;
        }
        Ok(())
    }
}
