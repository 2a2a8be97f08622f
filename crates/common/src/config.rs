//! Configuration structures for Shardgen
//!
//! This module defines all configuration types used by the shard server.
//! Configurations are loaded from an optional YAML file and can be overridden
//! by environment variables (`SHARDGEN_<SECTION>__<KEY>`). The distributed
//! section additionally honours the usual launcher variables `RANK`,
//! `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`.

use crate::error::{Result, ShardgenError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a shard server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardgenConfig {
    /// Model selection
    pub model: ModelSettings,

    /// Process group membership
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Continuous batching limits
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model selection, as handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Local directory or hub identifier
    pub model_id: String,

    /// Hub revision (branch, tag or commit)
    #[serde(default)]
    pub revision: Option<String>,

    /// Shard the model across the process group
    #[serde(default)]
    pub sharded: bool,

    /// Store linear weights as int8
    #[serde(default)]
    pub quantize: bool,

    /// Allow reduced-precision matmul on accelerators
    #[serde(default = "default_reduced_precision")]
    pub allow_reduced_precision: bool,
}

/// Process group membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// This process's rank
    #[serde(default)]
    pub rank: usize,

    /// Number of processes in the group
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// Address rank 0 listens on
    #[serde(default = "default_master_addr")]
    pub master_addr: String,

    /// Port rank 0 listens on
    #[serde(default = "default_master_port")]
    pub master_port: u16,

    /// Bound on rendezvous and on every collective
    #[serde(default = "default_collective_timeout")]
    pub timeout_secs: u64,
}

/// Continuous batching limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum number of requests in the running batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Decode steps after which a small batch is onboarded regardless of size
    #[serde(default = "default_max_waiting_tokens")]
    pub max_waiting_tokens: usize,

    /// Maximum queued requests before rejecting
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Maximum requests in flight (queued + running)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_reduced_precision() -> bool {
    true
}

fn default_world_size() -> usize {
    1
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

fn default_collective_timeout() -> u64 {
    600
}

fn default_max_batch_size() -> usize {
    32
}

fn default_max_waiting_tokens() -> usize {
    20
}

fn default_max_queue_size() -> usize {
    512
}

fn default_max_concurrent_requests() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: default_world_size(),
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            timeout_secs: default_collective_timeout(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_waiting_tokens: default_max_waiting_tokens(),
            max_queue_size: default_max_queue_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl DistributedConfig {
    /// Overlay launcher variables (`RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT`)
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(rank) = std::env::var("RANK") {
            self.rank = rank
                .parse()
                .map_err(|_| ShardgenError::config(format!("Invalid RANK: {}", rank)))?;
        }
        if let Ok(world_size) = std::env::var("WORLD_SIZE") {
            self.world_size = world_size
                .parse()
                .map_err(|_| ShardgenError::config(format!("Invalid WORLD_SIZE: {}", world_size)))?;
        }
        if let Ok(addr) = std::env::var("MASTER_ADDR") {
            self.master_addr = addr;
        }
        if let Ok(port) = std::env::var("MASTER_PORT") {
            self.master_port = port
                .parse()
                .map_err(|_| ShardgenError::config(format!("Invalid MASTER_PORT: {}", port)))?;
        }
        Ok(())
    }

    /// Collective timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether this process is rank 0
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }
}

impl ShardgenConfig {
    /// Load configuration from a YAML file layered under environment variables
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::build(Some(path.as_ref()), true)
    }

    /// Load configuration from environment variables, and from `path` if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, false)
    }

    fn build(path: Option<&Path>, required: bool) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(required));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("SHARDGEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: ShardgenConfig = settings.try_deserialize()?;
        config.distributed.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.model_id.is_empty() {
            return Err(ShardgenError::config("model.model_id must be set"));
        }

        let distributed = &self.distributed;
        if distributed.world_size == 0 {
            return Err(ShardgenError::config("distributed.world_size must be at least 1"));
        }
        if distributed.rank >= distributed.world_size {
            return Err(ShardgenError::config(format!(
                "rank {} is outside world of size {}",
                distributed.rank, distributed.world_size
            )));
        }
        if self.model.sharded && distributed.world_size < 2 {
            return Err(ShardgenError::config(
                "sharded requires a world_size of at least 2",
            ));
        }
        if !self.model.sharded && distributed.world_size > 1 {
            return Err(ShardgenError::config(format!(
                "world_size {} requires sharded to be set",
                distributed.world_size
            )));
        }

        if self.batching.max_batch_size == 0 {
            return Err(ShardgenError::config("batching.max_batch_size must be positive"));
        }
        if self.batching.max_queue_size == 0 {
            return Err(ShardgenError::config("batching.max_queue_size must be positive"));
        }
        Ok(())
    }
}
