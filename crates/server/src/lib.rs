//! Shardgen shard server
//!
//! Continuous-batching text generation over a model whose parameters may be
//! split across a fixed group of ranks. Rank 0 schedules requests and drives
//! every generation step; the other ranks replay its commands and join the
//! collectives.

pub mod api;
pub mod batch;
pub mod distributed;
pub mod engine;
pub mod generation;
pub mod infer;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod tensor;
pub mod tokenizer;

pub use batch::{Batch, BatchContext, BatchOps, RequestStatus};
pub use distributed::{initialize_distributed, ProcessGroup, ShardSpec};
pub use engine::{Engine, Generations};
pub use generation::FinishReason;
pub use infer::{Infer, InferResponse, InferStreamResponse};
pub use models::{get_model, Capability, Model, ModelVariant};
