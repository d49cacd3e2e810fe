//! # Model Placement
//!
//! Decides which storage root a model lives under. Pure and deterministic:
//! the answer depends only on the model's class and the host platform.
//!
//! ## Placement Rules:
//! - **Optional models**: always the general models directory
//! - **Required models on Linux**: the general models directory
//! - **Required models elsewhere**: the dedicated required-models directory,
//!   which stays next to the application installation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether a model is needed for baseline operation or is a user-selected extra.
///
/// Unknown class names in the catalog deserialize as `Optional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Required,
    #[default]
    #[serde(other)]
    Optional,
}

impl ResourceClass {
    pub fn is_required(&self) -> bool {
        matches!(self, ResourceClass::Required)
    }
}

/// Host operating system, as far as placement cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl Platform {
    /// The platform required models share the general directory on.
    pub const PRIMARY: Platform = Platform::Linux;

    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// The two storage roots a model can be placed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRoot {
    General,
    RequiredAssets,
}

/// Map a model's class and the host platform to its storage root.
pub fn placement(class: ResourceClass, platform: Platform) -> StorageRoot {
    match class {
        ResourceClass::Required if platform != Platform::PRIMARY => StorageRoot::RequiredAssets,
        _ => StorageRoot::General,
    }
}

/// Concrete directories backing the storage roots.
///
/// ## Layout:
/// ```text
/// <models_dir>/<model_id>/            completed general models
/// <required_models_dir>/<model_id>/   completed required models (non-Linux)
/// <root>/.<model_id>.partial/         staging area of an in-flight download
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub models_dir: PathBuf,
    pub required_models_dir: PathBuf,
    pub platform: Platform,
}

impl StorageLayout {
    pub fn new(models_dir: PathBuf, required_models_dir: PathBuf, platform: Platform) -> Self {
        Self {
            models_dir,
            required_models_dir,
            platform,
        }
    }

    pub fn root(&self, root: StorageRoot) -> &Path {
        match root {
            StorageRoot::General => &self.models_dir,
            StorageRoot::RequiredAssets => &self.required_models_dir,
        }
    }

    /// Both roots, general first. Scans and deletions walk these.
    pub fn roots(&self) -> [&Path; 2] {
        [&self.models_dir, &self.required_models_dir]
    }

    /// Final directory of a completed model.
    pub fn model_dir(&self, model_id: &str, class: ResourceClass) -> PathBuf {
        self.root(placement(class, self.platform)).join(model_id)
    }

    /// Staging directory a download writes into before promotion.
    ///
    /// Lives in the same root as the final directory so promotion is a rename.
    /// The leading dot keeps it from ever matching a catalog id.
    pub fn staging_dir(&self, model_id: &str, class: ResourceClass) -> PathBuf {
        self.root(placement(class, self.platform))
            .join(format!(".{}.partial", model_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_models_always_use_general_root() {
        for platform in [Platform::Linux, Platform::Windows, Platform::MacOs, Platform::Other] {
            assert_eq!(placement(ResourceClass::Optional, platform), StorageRoot::General);
        }
    }

    #[test]
    fn test_required_models_split_by_platform() {
        assert_eq!(placement(ResourceClass::Required, Platform::Linux), StorageRoot::General);
        assert_eq!(placement(ResourceClass::Required, Platform::Windows), StorageRoot::RequiredAssets);
        assert_eq!(placement(ResourceClass::Required, Platform::MacOs), StorageRoot::RequiredAssets);
    }

    #[test]
    fn test_unknown_class_is_optional() {
        let class: ResourceClass = serde_json::from_str("\"bundled\"").unwrap();
        assert_eq!(class, ResourceClass::Optional);
        let class: ResourceClass = serde_json::from_str("\"required\"").unwrap();
        assert_eq!(class, ResourceClass::Required);
    }

    #[test]
    fn test_staging_dir_sits_next_to_model_dir() {
        let layout = StorageLayout::new("/m".into(), "/r".into(), Platform::Windows);
        assert_eq!(layout.model_dir("small", ResourceClass::Required), PathBuf::from("/r/small"));
        assert_eq!(
            layout.staging_dir("small", ResourceClass::Required),
            PathBuf::from("/r/.small.partial")
        );
        assert_eq!(layout.model_dir("large", ResourceClass::Optional), PathBuf::from("/m/large"));
    }
}
