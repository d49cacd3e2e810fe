//! # Model Catalog
//!
//! Reads the static model catalog and language table, and inspects local
//! storage to find out which models are already downloaded.
//!
//! ## Catalog Format (`models.json`):
//! ```json
//! {
//!   "large-v3": {
//!     "repo_id": "Systran/faster-whisper-large-v3",
//!     "model_bin_size_human": "3.09 GB",
//!     "type": "regular",
//!     "class": "required"
//!   },
//!   "distil-large-v3": {
//!     "repo_id": "Systran/faster-distil-whisper-large-v3",
//!     "model_bin_size_human": "1.51 GB",
//!     "type": "distil",
//!     "language": "en"
//!   }
//! }
//! ```
//!
//! ## Download State:
//! Nothing is cached. A model counts as downloaded if and only if its
//! directory in one of the storage roots contains a file with the marker
//! extension. Every query rescans, so manual edits on disk are picked up.

use crate::error::{AppError, AppResult};
use crate::models::placement::{ResourceClass, StorageLayout};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Model family. Distil variants only support a single language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Distil,
    /// Any other family name
    #[default]
    #[serde(other)]
    Regular,
}

#[derive(Debug, Deserialize)]
struct RawCatalogEntry {
    repo_id: String,
    model_bin_size_human: String,
    #[serde(default, rename = "type")]
    variant: ModelVariant,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    class: ResourceClass,
}

/// Static metadata for one model in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub repo_id: String,
    /// Human readable size, e.g. "3.09 GB"
    pub size: String,
    pub class: ResourceClass,
    pub variant: ModelVariant,
    /// Only language a distil variant supports
    pub language: Option<String>,
}

/// One row of the model manager listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelListing {
    pub model: String,
    pub size: String,
    pub required: bool,
    pub downloaded: bool,
}

/// Reads catalog metadata and derives download state from storage.
#[derive(Debug, Clone)]
pub struct CatalogReader {
    models_file: PathBuf,
    languages_file: PathBuf,
    layout: StorageLayout,
    marker_extension: String,
}

impl CatalogReader {
    pub fn new(
        models_file: PathBuf,
        languages_file: PathBuf,
        layout: StorageLayout,
        marker_extension: impl Into<String>,
    ) -> Self {
        Self {
            models_file,
            languages_file,
            layout,
            marker_extension: marker_extension.into(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// All models in catalog order.
    pub fn list_known(&self) -> AppResult<Vec<CatalogEntry>> {
        let raw: IndexMap<String, RawCatalogEntry> = read_json(&self.models_file)?;
        Ok(raw
            .into_iter()
            .map(|(id, entry)| CatalogEntry {
                id,
                repo_id: entry.repo_id,
                size: entry.model_bin_size_human,
                class: entry.class,
                variant: entry.variant,
                language: entry.language,
            })
            .collect())
    }

    /// Look up a single model, failing with `NotFound` for unknown ids.
    pub fn entry(&self, model_id: &str) -> AppResult<CatalogEntry> {
        self.list_known()?
            .into_iter()
            .find(|entry| entry.id == model_id)
            .ok_or_else(|| AppError::NotFound(format!("Unknown model: {}", model_id)))
    }

    /// Ids of all downloaded models, in catalog order, each at most once.
    ///
    /// Scans both storage roots (creating them if absent). Directories that do
    /// not match a catalog id, such as download staging directories, are ignored.
    pub fn list_downloaded(&self) -> AppResult<Vec<String>> {
        let known = self.list_known()?;
        let mut present = HashSet::new();

        for root in self.layout.roots() {
            fs::create_dir_all(root)?;
            for dir_entry in fs::read_dir(root)? {
                let dir_entry = dir_entry?;
                if !dir_entry.file_type()?.is_dir() {
                    continue;
                }
                let name = dir_entry.file_name().to_string_lossy().to_string();
                if !known.iter().any(|entry| entry.id == name) {
                    continue;
                }
                if self.has_marker(&dir_entry.path())? {
                    present.insert(name);
                }
            }
        }

        debug!(count = present.len(), "Scanned model storage");
        Ok(known
            .into_iter()
            .filter(|entry| present.contains(&entry.id))
            .map(|entry| entry.id)
            .collect())
    }

    /// Catalog with download state, downloaded models first.
    ///
    /// The sort is stable, so catalog order is kept within each group.
    pub fn annotated_catalog(&self) -> AppResult<Vec<ModelListing>> {
        let downloaded = self.list_downloaded()?;
        let mut listing: Vec<ModelListing> = self
            .list_known()?
            .into_iter()
            .map(|entry| ModelListing {
                downloaded: downloaded.contains(&entry.id),
                required: entry.class.is_required(),
                model: entry.id,
                size: entry.size,
            })
            .collect();
        listing.sort_by_key(|model| !model.downloaded);
        Ok(listing)
    }

    /// Languages a model can transcribe, as `code -> display name`.
    ///
    /// Regular models support the full language table. A distil variant is
    /// restricted to its configured language.
    pub fn languages_for(&self, model_id: &str) -> AppResult<IndexMap<String, String>> {
        let entry = self.entry(model_id)?;
        let languages: IndexMap<String, String> = read_json(&self.languages_file)?;

        match (entry.variant, entry.language) {
            (ModelVariant::Distil, Some(code)) => {
                let name = languages.get(&code).cloned().ok_or_else(|| {
                    AppError::CatalogUnavailable(format!(
                        "language '{}' of model '{}' is missing from the language table",
                        code, model_id
                    ))
                })?;
                Ok(IndexMap::from([(code, name)]))
            }
            (ModelVariant::Distil, None) => Err(AppError::CatalogUnavailable(format!(
                "distil model '{}' has no language configured",
                model_id
            ))),
            (ModelVariant::Regular, _) => Ok(languages),
        }
    }

    /// Directory holding a downloaded model, if any root has it.
    pub fn downloaded_dir(&self, model_id: &str) -> AppResult<Option<PathBuf>> {
        for root in self.layout.roots() {
            let candidate = root.join(model_id);
            if candidate.is_dir() && self.has_marker(&candidate)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Model offered by default: the preferred one if downloaded, else the first downloaded.
    pub fn default_model(&self, preferred: Option<&str>) -> AppResult<Option<String>> {
        let downloaded = self.list_downloaded()?;
        if let Some(preferred) = preferred {
            if downloaded.iter().any(|id| id == preferred) {
                return Ok(Some(preferred.to_string()));
            }
        }
        Ok(downloaded.into_iter().next())
    }

    pub fn marker_extension(&self) -> &str {
        &self.marker_extension
    }

    fn has_marker(&self, dir: &Path) -> AppResult<bool> {
        Ok(contains_marker(dir, &self.marker_extension)?)
    }
}

/// Whether `dir` directly contains a file with the completed-asset extension.
pub fn contains_marker(dir: &Path, marker_extension: &str) -> std::io::Result<bool> {
    for file in fs::read_dir(dir)? {
        let path = file?.path();
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy() == marker_extension)
            .unwrap_or(false);
        if matches && path.is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> AppResult<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::CatalogUnavailable(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::CatalogUnavailable(format!("{}: {}", path.display(), e)))
}
