//! # Models Module
//!
//! Knows which speech models exist, which are on disk and where they belong,
//! and downloads them as background jobs.
//!
//! ## Key Components:
//! - **Placement** (`placement.rs`): which storage root a model lives in
//! - **Catalog** (`catalog.rs`): the known-model list and the downloaded set
//! - **Probe** (`probe.rs`): reachability check before a download
//! - **Fetch** (`fetch.rs`): transfer of a model repository
//! - **Download** (`download.rs`): the download job and the model service

pub mod catalog;
pub mod download;
pub mod fetch;
pub mod placement;
pub mod probe;

pub use catalog::CatalogReader;
pub use download::ModelService;
pub use fetch::HubFetcher;
pub use placement::{Platform, StorageLayout};
pub use probe::HttpProbe;
