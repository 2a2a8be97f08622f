//! Generation step orchestration
//!
//! Helpers shared by every batch kind: position and sequence-boundary
//! layout, gathering vocabulary-split logits, and advancing each request by
//! one token.

use crate::batch::{Batch, RequestState, RequestStatus};
use crate::distributed::ProcessGroup;
use crate::generation::FinishReason;
use crate::models::Model;
use crate::tokenizer::Tokenizer;
use candle_core::Tensor;
use shardgen_common::metrics::LatencyTimer;
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto::{GeneratedText, Intermediate};
use tracing::{debug, trace, warn};

/// A request dropped from its batch by an error of its own
#[derive(Debug)]
pub struct FailedRequest {
    pub request_id: u64,
    pub error: ShardgenError,
}

/// What the requests of one step produced
#[derive(Debug, Default)]
pub struct Emitted {
    /// One entry per request that produced a token and is still running
    pub intermediates: Vec<Intermediate>,
    /// One entry per request that finished on this step
    pub generated_texts: Vec<GeneratedText>,
    pub failed: Vec<FailedRequest>,
}

/// Result of one generation step
#[derive(Debug)]
pub struct StepOutput {
    pub intermediates: Vec<Intermediate>,
    pub generated_texts: Vec<GeneratedText>,
    pub failed: Vec<FailedRequest>,
    /// Surviving requests, `None` when none are left running
    pub batch: Option<Batch>,
}

/// Positions of the last `q_len` columns of a left-padded attention mask
///
/// A real token's position is the number of real tokens before it, so the
/// same request gets the same positions however much padding precedes it.
pub fn positions_from_mask(attention_mask: &[Vec<u32>], q_len: usize) -> Vec<u32> {
    let mut positions = Vec::with_capacity(attention_mask.len() * q_len);
    for row in attention_mask {
        let mut seen = 0u32;
        let row_positions: Vec<u32> = row
            .iter()
            .map(|&visible| {
                seen += visible;
                if visible == 1 {
                    seen - 1
                } else {
                    0
                }
            })
            .collect();
        positions.extend_from_slice(&row_positions[row_positions.len().saturating_sub(q_len)..]);
    }
    positions
}

/// Cumulative sequence boundaries `[0, l0, l0 + l1, ...]`
pub fn cu_seqlens(lengths: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut bounds = vec![0];
    let mut total = 0;
    for length in lengths {
        total += length;
        bounds.push(total);
    }
    bounds
}

/// Full-vocabulary logits
///
/// When the output head is split along the vocabulary every rank holds a
/// contiguous slice of each row; the slices are gathered in rank order.
pub fn gather_logits(group: &dyn ProcessGroup, local: &Tensor, tp_embeddings: bool) -> Result<Tensor> {
    if tp_embeddings {
        group.all_gather(local, 1)
    } else {
        Ok(local.clone())
    }
}

/// Requests after one token each
pub(crate) struct Selection {
    pub emitted: Emitted,
    /// Unfinished requests, in order
    pub survivors: Vec<RequestState>,
    /// Row of each survivor in the input
    pub keep: Vec<usize>,
}

/// Choose one token per row of `logits` `[requests, vocab]`
///
/// A request whose sampling or detokenization fails is aborted alone and
/// reported in [`Emitted::failed`]; the rest of the batch carries on.
pub(crate) fn select_tokens(
    requests: Vec<RequestState>,
    logits: &Tensor,
    tokenizer: &dyn Tokenizer,
) -> Result<Selection> {
    let rows = logits.dim(0)?;
    if rows != requests.len() {
        return Err(ShardgenError::internal(format!(
            "{} logit rows for {} requests",
            rows,
            requests.len()
        )));
    }

    let mut selection = Selection {
        emitted: Emitted::default(),
        survivors: Vec::with_capacity(rows),
        keep: Vec::with_capacity(rows),
    };
    for (row, mut state) in requests.into_iter().enumerate() {
        let logits = logits.get(row)?;
        let request_id = state.id();
        match advance(&mut state, &logits, tokenizer) {
            Ok(None) => {
                selection.emitted.intermediates.push(Intermediate {
                    token: state.generated_tokens.last().cloned().unwrap_or_default(),
                    request_id,
                    token_id: state.last_token(),
                    logprob: state.logprobs.last().copied().unwrap_or_default(),
                });
                selection.survivors.push(state);
                selection.keep.push(row);
            }
            Ok(Some(reason)) => match finish(state, reason, tokenizer) {
                Ok(generated) => selection.emitted.generated_texts.push(generated),
                Err(error) => fail(&mut selection.emitted, request_id, error)?,
            },
            Err(error) => fail(&mut selection.emitted, request_id, error)?,
        }
    }
    Ok(selection)
}

fn fail(emitted: &mut Emitted, request_id: u64, error: ShardgenError) -> Result<()> {
    if error.is_fatal() {
        return Err(error);
    }
    warn!(request_id, error = %error, status = ?RequestStatus::Aborted, "Request failed");
    emitted.failed.push(FailedRequest { request_id, error });
    Ok(())
}

fn advance(state: &mut RequestState, logits: &Tensor, tokenizer: &dyn Tokenizer) -> Result<Option<FinishReason>> {
    let (token_id, logprob) = state.chooser.choose(logits)?;
    state.generated_ids.push(token_id);
    state.generated_tokens.push(tokenizer.decode(&[token_id])?);
    state.logprobs.push(logprob);

    let output_text = tokenizer.decode(&state.generated_ids)?;
    let reason = state.stopping.check(token_id, &output_text);
    state.status = match reason {
        Some(reason) => RequestStatus::Finished(reason),
        None => RequestStatus::Decoding,
    };
    trace!(request_id = state.id(), token_id, logprob, "Token selected");
    Ok(reason)
}

fn finish(state: RequestState, reason: FinishReason, tokenizer: &dyn Tokenizer) -> Result<GeneratedText> {
    let output_text = tokenizer.decode(&state.generated_ids)?;
    debug!(
        request_id = state.id(),
        generated_tokens = state.generated_ids.len(),
        finish_reason = %reason,
        "Request finished"
    );
    Ok(GeneratedText {
        generated_tokens: state.generated_ids.len() as u32,
        seed: state.chooser.seed(),
        request: Some(state.request),
        output_text,
        tokens: state.generated_tokens,
        token_ids: state.generated_ids,
        logprobs: state.logprobs,
        finish_reason: reason.as_str().to_string(),
    })
}

/// Advance `batch` by one token per request
pub fn generate_step(model: &Model, batch: Batch) -> Result<StepOutput> {
    if batch.kind() != model.kind() {
        return Err(ShardgenError::batch_protocol(format!(
            "{:?} batch {} cannot run on {}",
            batch.kind(),
            batch.id(),
            model.variant()
        )));
    }

    let size = batch.len();
    METRICS.shard.batch_size.observe(size as f64);
    let output = METRICS.shard.forward_duration.time(|| batch.generate_step(model))?;

    let tokens = output.intermediates.len() + output.generated_texts.len();
    METRICS.inference.tokens_generated_total.inc_by(tokens as u64);
    METRICS
        .shard
        .active_sequences
        .set(output.batch.as_ref().map_or(0, Batch::len) as i64);
    Ok(output)
}
