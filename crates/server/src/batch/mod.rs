//! Batch protocol
//!
//! A [`Batch`] is the device-side state of a set of requests advancing
//! together. Every kind is built from a wire batch ([`BatchOps::from_pb`]),
//! reports its identity back ([`BatchOps::to_pb`]), merges with batches of
//! the same kind and phase ([`BatchOps::concatenate`]) and sheds requests
//! ([`BatchOps::filter`]). Row order always follows request order.

mod causal;
mod flash;
mod seq2seq;

pub use causal::CausalLmBatch;
pub use flash::FlashCausalLmBatch;
pub use seq2seq::Seq2SeqLmBatch;

use crate::generation::{validate_parameters, FinishReason, NextTokenChooser, StoppingCriteria};
use crate::models::{Model, ModelKind};
use crate::orchestrator::{Emitted, StepOutput};
use crate::tokenizer::Tokenizer;
use candle_core::{Device, Tensor};
use shardgen_common::{Result, ShardgenError};
use shardgen_proto::{self as proto, Request};
use std::collections::HashSet;
use std::sync::Arc;

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    Prefilling,
    Decoding,
    Finished(FinishReason),
    Aborted,
}

/// Model facts a batch needs to tokenize and pad its requests
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub stop_token_id: Option<u32>,
    pub pad_token_id: u32,
    pub decoder_start_token_id: u32,
    pub device: Device,
}

impl BatchContext {
    pub fn for_model(model: &Model) -> Self {
        let config = model.config();
        Self {
            tokenizer: Arc::clone(model.tokenizer()),
            stop_token_id: config.eos_token_id,
            pad_token_id: config.pad_token(),
            decoder_start_token_id: config.decoder_start_token(),
            device: model.device().clone(),
        }
    }
}

/// Per-request generation state
#[derive(Debug)]
pub struct RequestState {
    pub(crate) request: Request,
    pub(crate) chooser: NextTokenChooser,
    pub(crate) stopping: StoppingCriteria,
    pub(crate) prompt_ids: Vec<u32>,
    pub(crate) generated_ids: Vec<u32>,
    pub(crate) generated_tokens: Vec<String>,
    pub(crate) logprobs: Vec<f32>,
    pub(crate) status: RequestStatus,
}

impl RequestState {
    /// Validate and tokenize one wire request
    pub fn from_pb(request: &Request, ctx: &BatchContext) -> Result<Self> {
        let parameters = request
            .parameters
            .as_ref()
            .ok_or_else(|| ShardgenError::invalid_request(request.id, "missing sampling parameters"))?;
        let stopping = request
            .stopping_parameters
            .as_ref()
            .ok_or_else(|| ShardgenError::invalid_request(request.id, "missing stopping parameters"))?;
        validate_parameters(request.id, parameters, stopping)?;

        let prompt_ids = ctx.tokenizer.encode(&request.inputs)?;
        if prompt_ids.is_empty() {
            return Err(ShardgenError::invalid_request(request.id, "prompt encodes to no tokens"));
        }

        Ok(Self {
            request: request.clone(),
            chooser: NextTokenChooser::from_pb(parameters),
            stopping: StoppingCriteria::from_pb(stopping, ctx.stop_token_id),
            prompt_ids,
            generated_ids: Vec::new(),
            generated_tokens: Vec::new(),
            logprobs: Vec::new(),
            status: RequestStatus::Prefilling,
        })
    }

    pub fn id(&self) -> u64 {
        self.request.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    pub fn generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Most recent token, or the last prompt token before the first step
    pub(crate) fn last_token(&self) -> u32 {
        self.generated_ids
            .last()
            .or_else(|| self.prompt_ids.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Operations every batch kind provides
pub trait BatchOps: Sized {
    /// Tokenize and lay out a wire batch
    fn from_pb(batch: &proto::Batch, ctx: &BatchContext) -> Result<Self>;

    /// Merge batches of this kind, preserving left-to-right request order
    fn concatenate(batches: Vec<Self>) -> Result<Self>;

    /// Keep only `request_ids`, in existing order
    fn filter(self, request_ids: &[u64]) -> Result<Self>;

    /// Run one forward pass and choose one token per request
    ///
    /// Returns `None` for the batch once every request has finished.
    fn generate_step(self, model: &Model) -> Result<(Emitted, Option<Self>)>;

    fn id(&self) -> u64;

    fn requests(&self) -> &[RequestState];

    /// Whether the prompt has been run through the model
    fn is_prefilled(&self) -> bool;

    /// Wire identity of this batch
    fn to_pb(&self) -> proto::Batch {
        let requests: Vec<Request> = self.requests().iter().map(|r| r.request.clone()).collect();
        proto::Batch {
            id: self.id(),
            size: requests.len() as u32,
            requests,
        }
    }
}

/// Any batch kind
#[derive(Debug)]
pub enum Batch {
    Causal(CausalLmBatch),
    Flash(FlashCausalLmBatch),
    Seq2Seq(Seq2SeqLmBatch),
}

macro_rules! dispatch {
    ($batch:expr, $inner:ident => $body:expr) => {
        match $batch {
            Batch::Causal($inner) => $body,
            Batch::Flash($inner) => $body,
            Batch::Seq2Seq($inner) => $body,
        }
    };
}

impl Batch {
    /// Build the batch kind consumed by `kind` models
    pub fn from_pb(kind: ModelKind, batch: &proto::Batch, ctx: &BatchContext) -> Result<Self> {
        Ok(match kind {
            ModelKind::Causal => Batch::Causal(CausalLmBatch::from_pb(batch, ctx)?),
            ModelKind::FlashCausal => Batch::Flash(FlashCausalLmBatch::from_pb(batch, ctx)?),
            ModelKind::Seq2Seq => Batch::Seq2Seq(Seq2SeqLmBatch::from_pb(batch, ctx)?),
        })
    }

    pub fn to_pb(&self) -> proto::Batch {
        dispatch!(self, b => b.to_pb())
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Batch::Causal(_) => ModelKind::Causal,
            Batch::Flash(_) => ModelKind::FlashCausal,
            Batch::Seq2Seq(_) => ModelKind::Seq2Seq,
        }
    }

    pub fn id(&self) -> u64 {
        dispatch!(self, b => b.id())
    }

    pub fn len(&self) -> usize {
        self.requests().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests().is_empty()
    }

    pub fn requests(&self) -> &[RequestState] {
        dispatch!(self, b => b.requests())
    }

    pub fn request_ids(&self) -> Vec<u64> {
        self.requests().iter().map(RequestState::id).collect()
    }

    pub fn is_prefilled(&self) -> bool {
        dispatch!(self, b => b.is_prefilled())
    }

    pub fn filter(self, request_ids: &[u64]) -> Result<Self> {
        Ok(match self {
            Batch::Causal(b) => Batch::Causal(b.filter(request_ids)?),
            Batch::Flash(b) => Batch::Flash(b.filter(request_ids)?),
            Batch::Seq2Seq(b) => Batch::Seq2Seq(b.filter(request_ids)?),
        })
    }

    /// Merge batches of one kind into a single batch
    pub fn concatenate(batches: Vec<Batch>) -> Result<Self> {
        let kind = batches
            .first()
            .map(Batch::kind)
            .ok_or_else(|| ShardgenError::batch_protocol("no batches to concatenate"))?;

        Ok(match kind {
            ModelKind::Causal => Batch::Causal(CausalLmBatch::concatenate(unwrap_all(batches, |b| match b {
                Batch::Causal(b) => Ok(b),
                other => Err(other),
            })?)?),
            ModelKind::FlashCausal => Batch::Flash(FlashCausalLmBatch::concatenate(unwrap_all(batches, |b| match b {
                Batch::Flash(b) => Ok(b),
                other => Err(other),
            })?)?),
            ModelKind::Seq2Seq => Batch::Seq2Seq(Seq2SeqLmBatch::concatenate(unwrap_all(batches, |b| match b {
                Batch::Seq2Seq(b) => Ok(b),
                other => Err(other),
            })?)?),
        })
    }

    /// One generation step
    pub fn generate_step(self, model: &Model) -> Result<StepOutput> {
        let (emitted, batch) = match self {
            Batch::Causal(b) => {
                let (emitted, next) = b.generate_step(model)?;
                (emitted, next.map(Batch::Causal))
            }
            Batch::Flash(b) => {
                let (emitted, next) = b.generate_step(model)?;
                (emitted, next.map(Batch::Flash))
            }
            Batch::Seq2Seq(b) => {
                let (emitted, next) = b.generate_step(model)?;
                (emitted, next.map(Batch::Seq2Seq))
            }
        };
        Ok(StepOutput {
            intermediates: emitted.intermediates,
            generated_texts: emitted.generated_texts,
            failed: emitted.failed,
            batch,
        })
    }
}

fn unwrap_all<T>(batches: Vec<Batch>, unwrap: impl Fn(Batch) -> std::result::Result<T, Batch>) -> Result<Vec<T>> {
    batches
        .into_iter()
        .map(|batch| {
            unwrap(batch).map_err(|other| {
                ShardgenError::batch_protocol(format!(
                    "cannot concatenate a {:?} batch ({}) with batches of another kind",
                    other.kind(),
                    other.id()
                ))
            })
        })
        .collect()
}

/// Validate a wire batch and build its request states
pub(crate) fn prepare_requests(batch: &proto::Batch, ctx: &BatchContext) -> Result<Vec<RequestState>> {
    if batch.requests.is_empty() {
        return Err(ShardgenError::EmptyBatch(batch.id));
    }
    if batch.size as usize != batch.requests.len() {
        return Err(ShardgenError::batch_protocol(format!(
            "batch {} declares size {} but carries {} requests",
            batch.id,
            batch.size,
            batch.requests.len()
        )));
    }
    ensure_unique(batch.requests.iter().map(|r| r.id))?;

    batch
        .requests
        .iter()
        .map(|request| RequestState::from_pb(request, ctx))
        .collect()
}

pub(crate) fn ensure_unique(ids: impl IntoIterator<Item = u64>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ShardgenError::DuplicateRequestId(id));
        }
    }
    Ok(())
}

/// Phase shared by every batch being merged
pub(crate) fn common_phase(phases: impl IntoIterator<Item = bool>) -> Result<bool> {
    let mut phases = phases.into_iter();
    let first = phases
        .next()
        .ok_or_else(|| ShardgenError::batch_protocol("no batches to concatenate"))?;
    if phases.any(|phase| phase != first) {
        return Err(ShardgenError::batch_protocol(
            "cannot concatenate prefilled and unprefilled batches",
        ));
    }
    Ok(first)
}

/// Row indices of `request_ids` within `requests`, in request order
pub(crate) fn retained_rows(requests: &[RequestState], request_ids: &[u64]) -> Result<Vec<usize>> {
    let wanted: HashSet<u64> = request_ids.iter().copied().collect();
    let present: HashSet<u64> = requests.iter().map(RequestState::id).collect();
    if let Some(unknown) = wanted.iter().find(|id| !present.contains(id)) {
        return Err(ShardgenError::batch_protocol(format!(
            "request {} is not part of the batch",
            unknown
        )));
    }
    if wanted.is_empty() {
        return Err(ShardgenError::batch_protocol("filter would leave the batch empty"));
    }

    Ok(requests
        .iter()
        .enumerate()
        .filter(|(_, r)| wanted.contains(&r.id()))
        .map(|(row, _)| row)
        .collect())
}

/// Keep the items at `rows` (ascending)
pub(crate) fn pick<T>(items: Vec<T>, rows: &[usize]) -> Vec<T> {
    let mut rows = rows.iter().peekable();
    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| {
            if rows.peek() == Some(&&index) {
                rows.next();
                Some(item)
            } else {
                None
            }
        })
        .collect()
}

/// Select `rows` of `tensor` along `dim`
pub(crate) fn select_rows(tensor: &Tensor, rows: &[usize], dim: usize) -> Result<Tensor> {
    let total = tensor.dim(dim)?;
    if rows.len() == total && rows.iter().enumerate().all(|(i, &r)| i == r) {
        return Ok(tensor.clone());
    }
    let index: Vec<u32> = rows.iter().map(|&r| r as u32).collect();
    let index = Tensor::from_vec(index, rows.len(), tensor.device())?;
    Ok(tensor.index_select(&index, dim)?)
}

/// Left-pad every row with `value` up to `width`
pub(crate) fn pad_rows_left(rows: &mut [Vec<u32>], width: usize, value: u32) {
    for row in rows.iter_mut() {
        if row.len() < width {
            let mut padded = vec![value; width - row.len()];
            padded.append(row);
            *row = padded;
        }
    }
}

/// Left padding shared by every row of `mask`
pub(crate) fn leading_padding(mask: &[Vec<u32>]) -> usize {
    mask.iter()
        .map(|row| row.iter().take_while(|&&v| v == 0).count())
        .min()
        .unwrap_or(0)
}

/// Drop the first `count` columns of every row
pub(crate) fn drop_columns(rows: &mut [Vec<u32>], count: usize) {
    if count > 0 {
        for row in rows.iter_mut() {
            row.drain(..count);
        }
    }
}

/// Row-major tensor from equally long rows
pub(crate) fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::tokenizer::HfTokenizer;
    use shardgen_proto::{NextTokenChooserParameters, StoppingCriteriaParameters};

    pub const VOCAB_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "hello": 1, "world": 2, "how": 3, "are": 4, "you": 5},
            "unk_token": "<unk>"
        }
    }"#;

    pub fn context() -> BatchContext {
        BatchContext {
            tokenizer: Arc::new(HfTokenizer::from_json(VOCAB_JSON).unwrap()),
            stop_token_id: Some(0),
            pad_token_id: 0,
            decoder_start_token_id: 0,
            device: Device::Cpu,
        }
    }

    pub fn request(id: u64, inputs: &str) -> Request {
        Request {
            id,
            inputs: inputs.to_string(),
            input_length: inputs.split_whitespace().count() as u32,
            parameters: Some(NextTokenChooserParameters {
                temperature: 1.0,
                top_k: 0,
                top_p: 1.0,
                do_sample: false,
                seed: None,
            }),
            stopping_parameters: Some(StoppingCriteriaParameters {
                max_new_tokens: 4,
                stop_sequences: vec![],
            }),
        }
    }

    pub fn wire_batch(id: u64, requests: Vec<Request>) -> proto::Batch {
        proto::Batch {
            id,
            size: requests.len() as u32,
            requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_prepare_rejects_bad_batches() {
        let ctx = context();

        let empty = wire_batch(9, vec![]);
        assert!(matches!(prepare_requests(&empty, &ctx), Err(ShardgenError::EmptyBatch(9))));

        let duplicated = wire_batch(1, vec![request(4, "hello"), request(4, "world")]);
        assert!(matches!(
            prepare_requests(&duplicated, &ctx),
            Err(ShardgenError::DuplicateRequestId(4))
        ));

        let mut missing = request(5, "hello");
        missing.parameters = None;
        assert!(matches!(
            prepare_requests(&wire_batch(1, vec![missing]), &ctx),
            Err(ShardgenError::InvalidRequest { id: 5, .. })
        ));
    }

    #[test]
    fn test_request_state() {
        let ctx = context();
        let state = RequestState::from_pb(&request(3, "hello world"), &ctx).unwrap();
        assert_eq!(state.id(), 3);
        assert_eq!(state.prompt_ids(), &[1, 2]);
        assert_eq!(state.status(), RequestStatus::Prefilling);
        assert_eq!(state.last_token(), 2);
    }

    #[test]
    fn test_batch_kinds_round_trip() {
        let ctx = context();
        let wire = wire_batch(11, vec![request(1, "hello"), request(2, "how are you")]);

        for kind in [ModelKind::Causal, ModelKind::FlashCausal, ModelKind::Seq2Seq] {
            let batch = Batch::from_pb(kind, &wire, &ctx).unwrap();
            assert_eq!(batch.kind(), kind);
            assert_eq!(batch.to_pb(), wire);
            assert!(!batch.is_prefilled());
        }
    }

    #[test]
    fn test_concatenate_rejects_mixed_kinds() {
        let ctx = context();
        let a = Batch::from_pb(ModelKind::Causal, &wire_batch(1, vec![request(1, "hello")]), &ctx).unwrap();
        let b = Batch::from_pb(ModelKind::Seq2Seq, &wire_batch(2, vec![request(2, "world")]), &ctx).unwrap();

        let err = Batch::concatenate(vec![a, b]).unwrap_err();
        assert!(matches!(err, ShardgenError::BatchProtocol(_)));
    }

    #[test]
    fn test_row_helpers() {
        assert_eq!(pick(vec!['a', 'b', 'c', 'd'], &[0, 2, 3]), vec!['a', 'c', 'd']);

        let mut rows = vec![vec![1, 1], vec![1, 1, 1]];
        pad_rows_left(&mut rows, 3, 0);
        assert_eq!(rows, vec![vec![0, 1, 1], vec![1, 1, 1]]);

        let mask = vec![vec![0, 0, 1, 1], vec![0, 1, 1, 1]];
        assert_eq!(leading_padding(&mask), 1);

        assert!(common_phase([true, true]).unwrap());
        assert!(common_phase([true, false]).is_err());
    }
}
