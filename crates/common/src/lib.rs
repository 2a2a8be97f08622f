//! Shardgen common library
//!
//! This crate contains shared code used across Shardgen components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ShardgenConfig;
pub use error::{Result, ShardgenError};
pub use metrics::{MetricsRegistry, METRICS};
