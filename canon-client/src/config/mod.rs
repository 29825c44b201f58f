//! Client configuration
//!
//! Loaded from `config.toml` in the canon config directory. Every section
//! has defaults, so a partial or missing file is valid.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ClientConfig, ConnectionConfig, HealthConfig, NamespaceConfig, OrphanConfig, ReconnectConfig,
    SpawnConfig, StorageConfig,
};
