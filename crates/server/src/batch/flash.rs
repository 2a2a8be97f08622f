//! Packed decoder-only batches
//!
//! No padding: every request keeps its own pending tokens, position offset
//! and per-layer cache. Forward inputs are packed along one token axis and
//! delimited by `cu_seqlens`.

use super::{
    common_phase, ensure_unique, pick, prepare_requests, retained_rows, BatchContext, BatchOps, RequestState,
};
use crate::models::{LayerCache, Model};
use crate::orchestrator::{cu_seqlens, gather_logits, select_tokens, Emitted};
use candle_core::{Device, Tensor};
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto as proto;
use tracing::trace;

#[derive(Debug)]
pub struct FlashCausalLmBatch {
    id: u64,
    requests: Vec<RequestState>,
    /// Tokens to feed on the next step, per request
    pending: Vec<Vec<u32>>,
    /// Tokens already cached, per request
    offsets: Vec<usize>,
    /// Indexed by request, then layer
    past: Option<Vec<LayerCache>>,
    device: Device,
}

/// Packed forward inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedInputs {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
    pub cu_seqlens: Vec<usize>,
    /// Longest sequence, cache included
    pub max_s: usize,
}

impl FlashCausalLmBatch {
    /// Lay out the pending tokens of every request
    pub fn packed_inputs(&self) -> PackedInputs {
        let input_ids = self.pending.iter().flatten().copied().collect();
        let position_ids = self
            .pending
            .iter()
            .zip(&self.offsets)
            .flat_map(|(tokens, &offset)| (offset..offset + tokens.len()).map(|p| p as u32))
            .collect();
        let max_s = self
            .pending
            .iter()
            .zip(&self.offsets)
            .map(|(tokens, offset)| offset + tokens.len())
            .max()
            .unwrap_or(0);

        PackedInputs {
            input_ids,
            position_ids,
            cu_seqlens: cu_seqlens(self.pending.iter().map(Vec::len)),
            max_s,
        }
    }
}

impl BatchOps for FlashCausalLmBatch {
    fn from_pb(batch: &proto::Batch, ctx: &BatchContext) -> Result<Self> {
        let requests = prepare_requests(batch, ctx)?;
        let pending = requests.iter().map(|r| r.prompt_ids.clone()).collect();
        let offsets = vec![0; requests.len()];

        Ok(Self {
            id: batch.id,
            requests,
            pending,
            offsets,
            past: None,
            device: ctx.device.clone(),
        })
    }

    fn concatenate(batches: Vec<Self>) -> Result<Self> {
        ensure_unique(batches.iter().flat_map(|b| b.requests.iter().map(RequestState::id)))?;
        let prefilled = common_phase(batches.iter().map(|b| b.is_prefilled()))?;

        let mut batches = batches.into_iter();
        let Some(mut merged) = batches.next() else {
            return Err(ShardgenError::batch_protocol("no batches to concatenate"));
        };
        let mut merged_any = false;
        for mut batch in batches {
            merged.requests.append(&mut batch.requests);
            merged.pending.append(&mut batch.pending);
            merged.offsets.append(&mut batch.offsets);
            if let (Some(past), Some(mut other)) = (merged.past.as_mut(), batch.past.take()) {
                past.append(&mut other);
            }
            merged_any = true;
        }

        if merged_any {
            METRICS.shard.concatenations_total.inc();
            trace!(batch_id = merged.id, size = merged.requests.len(), prefilled, "Concatenated packed batches");
        }
        Ok(merged)
    }

    fn filter(self, request_ids: &[u64]) -> Result<Self> {
        let rows = retained_rows(&self.requests, request_ids)?;
        Ok(Self {
            id: self.id,
            requests: pick(self.requests, &rows),
            pending: pick(self.pending, &rows),
            offsets: pick(self.offsets, &rows),
            past: self.past.map(|past| pick(past, &rows)),
            device: self.device,
        })
    }

    fn generate_step(self, model: &Model) -> Result<(Emitted, Option<Self>)> {
        let network = model.causal()?;
        let inputs = self.packed_inputs();
        trace!(
            batch_id = self.id,
            tokens = inputs.input_ids.len(),
            max_s = inputs.max_s,
            "Packed forward"
        );

        let tokens = inputs.input_ids.len();
        let input_ids = Tensor::from_vec(inputs.input_ids, tokens, &self.device)?;
        let (logits, present) =
            network.forward_packed(&input_ids, &inputs.position_ids, &inputs.cu_seqlens, self.past.as_deref())?;
        let logits = gather_logits(model.group().as_ref(), &logits, model.tp_embeddings())?;

        let offsets: Vec<usize> = self
            .offsets
            .iter()
            .zip(&self.pending)
            .map(|(offset, tokens)| offset + tokens.len())
            .collect();

        let selection = select_tokens(self.requests, &logits, model.tokenizer().as_ref())?;
        if selection.survivors.is_empty() {
            return Ok((selection.emitted, None));
        }

        let keep = &selection.keep;
        let next = Self {
            id: self.id,
            pending: selection.survivors.iter().map(|r| vec![r.last_token()]).collect(),
            offsets: pick(offsets, keep),
            past: Some(pick(present, keep)),
            requests: selection.survivors,
            device: self.device,
        };
        Ok((selection.emitted, Some(next)))
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn requests(&self) -> &[RequestState] {
        &self.requests
    }

    fn is_prefilled(&self) -> bool {
        self.past.is_some()
    }
}
