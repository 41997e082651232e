//! Pooler configuration, credentials and instance layout

pub mod auth;
pub mod config;
pub mod instance;
pub mod store;

pub use auth::CredentialError;
pub use config::{ConfigParseError, PoolerConfig};
pub use instance::{ServiceInstance, detected_cores, instance_fleet};
pub use store::{ApplyOutcome, ConfigError, ConfigStore};
