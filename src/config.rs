//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__STORAGE__MODELS_DIR`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore because many field
//! names contain a single one.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub events: EventsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (the UI runs locally)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where models and transcriptions live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// General model storage
    pub models_dir: PathBuf,
    /// Storage for required models on platforms where they are kept apart
    pub required_models_dir: PathBuf,
    /// One directory per transcription, named by file id
    pub transcriptions_dir: PathBuf,
    /// File extension whose presence marks a model directory as complete
    pub marker_extension: String,
}

/// Static model metadata sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub models_file: PathBuf,
    pub languages_file: PathBuf,
    /// Model offered by default when it is downloaded
    pub preferred_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// URL probed before every download
    pub probe_url: String,
    pub probe_timeout_ms: u64,
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// External transcription engine command.
///
/// The engine is invoked as `program extra_args... transcribe <input> --model ...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub program: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before a slow one starts missing events
    pub capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("transcriber");

        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                models_dir: data_dir.join("models"),
                required_models_dir: data_dir.join("required-models"),
                transcriptions_dir: data_dir.join("transcriptions"),
                marker_extension: "bin".to_string(),
            },
            catalog: CatalogConfig {
                models_file: PathBuf::from("data/models.json"),
                languages_file: PathBuf::from("data/languages.json"),
                preferred_model: Some("large-v3".to_string()),
            },
            network: NetworkConfig {
                probe_url: "https://huggingface.co".to_string(),
                probe_timeout_ms: 1000,
            },
            engine: EngineConfig {
                program: "transcriber-engine".to_string(),
                extra_args: Vec::new(),
            },
            events: EventsConfig { capacity: 256 },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__STORAGE__MODELS_DIR=/srv/models`: Override model storage
    /// - `APP__ENGINE__PROGRAM=/opt/engine/run`: Override the engine command
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("engine.extra_args")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.network.probe_timeout_ms == 0 {
            return Err(anyhow!("Probe timeout must be greater than 0"));
        }

        if self.events.capacity == 0 {
            return Err(anyhow!("Event capacity must be greater than 0"));
        }

        if self.storage.marker_extension.trim().is_empty() {
            return Err(anyhow!("Marker extension cannot be empty"));
        }

        if self.engine.program.trim().is_empty() {
            return Err(anyhow!("Engine program cannot be empty"));
        }

        Ok(())
    }
}
