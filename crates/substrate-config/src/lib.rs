//! # substrate-config
//!
//! Configuration system for the Substrate runtime. Reads from `substrate.toml`,
//! then applies environment variable overrides, then validates.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::SubstrateConfig;
pub use schema::{
    AgentConfig, BlockSeed, ConfigWarning, EmbeddingConfig, LoggingConfig, MemoryConfig,
    ProvidersConfig, WarningSeverity,
};
