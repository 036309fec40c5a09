pub mod config;
pub mod errors;

pub use config::{AppConfig, MasterConfig, RingConfig, SlaveConfig};
pub use errors::{OrchestratorError, OrchestratorResult};
