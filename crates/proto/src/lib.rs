//! Shardgen wire messages
//!
//! Protobuf messages exchanged between the request scheduler and the shards,
//! and between ranks of a process group. The messages are declared directly
//! with `prost` derives, so no build-time code generation is involved.

use serde::{Deserialize, Serialize};

/// Token selection parameters attached to every request
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct NextTokenChooserParameters {
    /// Logits are divided by the temperature before sampling
    #[prost(float, tag = "1")]
    pub temperature: f32,

    /// Restrict sampling to the k most likely tokens (0 disables)
    #[prost(uint32, tag = "2")]
    pub top_k: u32,

    /// Nucleus sampling threshold (1.0 disables)
    #[prost(float, tag = "3")]
    pub top_p: f32,

    /// Sample instead of greedy argmax
    #[prost(bool, tag = "4")]
    pub do_sample: bool,

    /// Sampling seed
    #[prost(uint64, optional, tag = "5")]
    pub seed: Option<u64>,
}

/// Stopping parameters attached to every request
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct StoppingCriteriaParameters {
    /// Maximum number of generated tokens
    #[prost(uint32, tag = "1")]
    pub max_new_tokens: u32,

    /// Stop generating once the output ends with one of these
    #[prost(string, repeated, tag = "2")]
    pub stop_sequences: Vec<String>,
}

/// A single generation request
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier
    #[prost(uint64, tag = "1")]
    pub id: u64,

    /// Prompt
    #[prost(string, tag = "2")]
    pub inputs: String,

    /// Prompt length in tokens, as measured at validation time
    #[prost(uint32, tag = "3")]
    pub input_length: u32,

    #[prost(message, optional, tag = "4")]
    pub parameters: Option<NextTokenChooserParameters>,

    #[prost(message, optional, tag = "5")]
    pub stopping_parameters: Option<StoppingCriteriaParameters>,
}

/// Identity of a batch of requests
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Batch {
    /// Batch identifier
    #[prost(uint64, tag = "1")]
    pub id: u64,

    /// Requests, in row order
    #[prost(message, repeated, tag = "2")]
    pub requests: Vec<Request>,

    /// Number of requests
    #[prost(uint32, tag = "3")]
    pub size: u32,
}

impl Batch {
    /// Request identifiers in row order
    pub fn request_ids(&self) -> Vec<u64> {
        self.requests.iter().map(|r| r.id).collect()
    }
}

/// Terminal record for one completed request
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GeneratedText {
    #[prost(message, optional, tag = "1")]
    pub request: Option<Request>,

    /// Decoded output
    #[prost(string, tag = "2")]
    pub output_text: String,

    /// Number of generated tokens
    #[prost(uint32, tag = "3")]
    pub generated_tokens: u32,

    /// Decoded text of every generated token
    #[prost(string, repeated, tag = "4")]
    pub tokens: Vec<String>,

    #[prost(uint32, repeated, tag = "5")]
    pub token_ids: Vec<u32>,

    #[prost(float, repeated, tag = "6")]
    pub logprobs: Vec<f32>,

    /// "stop", "length" or "stop_sequence"
    #[prost(string, tag = "7")]
    pub finish_reason: String,

    /// Seed used when sampling
    #[prost(uint64, optional, tag = "8")]
    pub seed: Option<u64>,
}

/// Streamed partial-token notification
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Intermediate {
    #[prost(string, tag = "1")]
    pub token: String,

    #[prost(uint64, tag = "2")]
    pub request_id: u64,

    #[prost(uint32, tag = "3")]
    pub token_id: u32,

    #[prost(float, tag = "4")]
    pub logprob: f32,
}

/// Kind of a replicated step command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StepKind {
    Prefill = 0,
    Decode = 1,
    Shutdown = 2,
    /// Drop the named batches
    Clear = 3,
    /// Nothing to run; rank 0 is still alive
    Keepalive = 4,
}

/// Command replicated from rank 0 to every rank before each step
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepCommand {
    #[prost(enumeration = "StepKind", tag = "1")]
    pub kind: i32,

    /// One batch for prefill, one or more for decode, the batches to drop
    /// for clear
    #[prost(message, repeated, tag = "2")]
    pub batches: Vec<Batch>,
}

/// Dense f32 tensor payload used by collectives
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorFrame {
    #[prost(uint64, repeated, tag = "1")]
    pub shape: Vec<u64>,

    #[prost(float, repeated, tag = "2")]
    pub data: Vec<f32>,
}

/// One rank's contribution to a collective
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectiveFrame {
    /// Position of the collective in the group's call sequence
    #[prost(uint64, tag = "1")]
    pub sequence: u64,

    #[prost(uint32, tag = "2")]
    pub rank: u32,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Result of a collective, one payload per rank in rank order
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GatheredFrame {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,

    #[prost(bytes = "vec", repeated, tag = "2")]
    pub payloads: Vec<Vec<u8>>,
}
