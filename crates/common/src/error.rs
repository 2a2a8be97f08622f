//! Common error types for Shardgen
//!
//! This module defines all error types used across the Shardgen system.
//! Fatal errors stop the rank; the rest fail only the requests involved.

use thiserror::Error;

/// Main error type for Shardgen
#[derive(Error, Debug)]
pub enum ShardgenError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested model, sharding or quantization combination is not supported
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A loaded slice disagrees with the placeholder shape
    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A declared parameter was never filled
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// A parameter was filled more than once
    #[error("Parameter filled twice: {0}")]
    DuplicateParameter(String),

    /// Weight file could not be resolved or read
    #[error("Weight file error: {0}")]
    WeightFile(String),

    /// Two batches being merged share a request id
    #[error("Duplicate request id {0} in batch")]
    DuplicateRequestId(u64),

    /// A batch was built from an empty wire batch
    #[error("Empty batch {0}")]
    EmptyBatch(u64),

    /// A request carries missing or invalid parameters
    #[error("Invalid request {id}: {reason}")]
    InvalidRequest { id: u64, reason: String },

    /// Any other violation of the batch protocol
    #[error("Batch protocol violation: {0}")]
    BatchProtocol(String),

    /// Ranks disagree on the collective call sequence
    #[error("Collective desync: {0}")]
    CollectiveDesync(String),

    /// Collective transport errors
    #[error("Collective error: {0}")]
    Collective(String),

    /// Tensor operation errors
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Tokenizer errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Request stream ended without a final message
    #[error("Incomplete generation")]
    IncompleteGeneration,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ShardgenError {
    fn from(err: config::ConfigError) -> Self {
        ShardgenError::Config(err.to_string())
    }
}

impl ShardgenError {
    /// Whether the error must stop the process rather than a single request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShardgenError::Config(_)
                | ShardgenError::Unsupported(_)
                | ShardgenError::ShapeMismatch { .. }
                | ShardgenError::MissingParameter(_)
                | ShardgenError::DuplicateParameter(_)
                | ShardgenError::WeightFile(_)
                | ShardgenError::CollectiveDesync(_)
                | ShardgenError::Collective(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ShardgenError::Config(msg.into())
    }

    /// Create an unsupported-combination error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ShardgenError::Unsupported(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        ShardgenError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a weight file error
    pub fn weight_file(msg: impl Into<String>) -> Self {
        ShardgenError::WeightFile(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(id: u64, reason: impl Into<String>) -> Self {
        ShardgenError::InvalidRequest {
            id,
            reason: reason.into(),
        }
    }

    /// Create a batch protocol error
    pub fn batch_protocol(msg: impl Into<String>) -> Self {
        ShardgenError::BatchProtocol(msg.into())
    }

    /// Create a collective transport error
    pub fn collective(msg: impl Into<String>) -> Self {
        ShardgenError::Collective(msg.into())
    }

    /// Create a collective desync error
    pub fn desync(msg: impl Into<String>) -> Self {
        ShardgenError::CollectiveDesync(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        ShardgenError::Tokenizer(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        ShardgenError::QueueFull(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ShardgenError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ShardgenError::Internal(msg.into())
    }
}

/// Result type alias for Shardgen operations
pub type Result<T> = std::result::Result<T, ShardgenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(ShardgenError::shape_mismatch("w", &[2, 2], &[4, 2]).is_fatal());
        assert!(ShardgenError::desync("rank 1 at sequence 3").is_fatal());
        assert!(!ShardgenError::EmptyBatch(0).is_fatal());
        assert!(!ShardgenError::invalid_request(1, "temperature").is_fatal());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = ShardgenError::shape_mismatch("embed_out.weight", &[8, 4], &[16, 4]);
        assert_eq!(
            err.to_string(),
            "Shape mismatch for embed_out.weight: expected [8, 4], got [16, 4]"
        );
    }
}
