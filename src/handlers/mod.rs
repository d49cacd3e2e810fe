pub mod config;
pub mod events;
pub mod models;
pub mod transcriptions;

pub use self::config::*;
pub use events::*;
pub use models::*;
pub use transcriptions::*;
