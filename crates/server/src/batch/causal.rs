//! Left-padded decoder-only batches

use super::{
    common_phase, drop_columns, ensure_unique, leading_padding, pad_rows_left, pick, prepare_requests,
    retained_rows, rows_to_tensor, select_rows, BatchContext, BatchOps, RequestState,
};
use crate::models::{LayerCache, Model};
use crate::orchestrator::{gather_logits, positions_from_mask, select_tokens, Emitted};
use crate::tensor::ops::{causal_bias, pad_left};
use candle_core::Device;
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto as proto;
use tracing::trace;

/// Decoder-only batch with a padded key/value cache
///
/// `attention_mask` always spans the cached positions plus the pending
/// `input_ids`; every row has the same width and padding sits on the left.
#[derive(Debug)]
pub struct CausalLmBatch {
    id: u64,
    requests: Vec<RequestState>,
    input_ids: Vec<Vec<u32>>,
    attention_mask: Vec<Vec<u32>>,
    past: Option<LayerCache>,
    pad_token_id: u32,
    device: Device,
}

impl CausalLmBatch {
    /// Pending tokens per row
    pub fn input_ids(&self) -> &[Vec<u32>] {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> &[Vec<u32>] {
        &self.attention_mask
    }

    /// Cached positions, 0 before the first step
    pub fn past_len(&self) -> usize {
        self.attention_mask.first().map_or(0, Vec::len) - self.input_ids.first().map_or(0, Vec::len)
    }

    fn trim_padding(mut self) -> Result<Self> {
        let trim = leading_padding(&self.attention_mask);
        if trim == 0 {
            return Ok(self);
        }

        drop_columns(&mut self.attention_mask, trim);
        match self.past.as_mut() {
            Some(past) => {
                for (key, value) in past.iter_mut() {
                    let len = key.dim(2)?;
                    *key = key.narrow(2, trim, len - trim)?;
                    *value = value.narrow(2, trim, len - trim)?;
                }
            }
            None => drop_columns(&mut self.input_ids, trim),
        }
        Ok(self)
    }
}

impl BatchOps for CausalLmBatch {
    fn from_pb(batch: &proto::Batch, ctx: &BatchContext) -> Result<Self> {
        let requests = prepare_requests(batch, ctx)?;
        let width = requests.iter().map(|r| r.prompt_ids.len()).max().unwrap_or(0);

        let mut input_ids: Vec<Vec<u32>> = requests.iter().map(|r| r.prompt_ids.clone()).collect();
        let mut attention_mask: Vec<Vec<u32>> = requests.iter().map(|r| vec![1; r.prompt_ids.len()]).collect();
        pad_rows_left(&mut input_ids, width, ctx.pad_token_id);
        pad_rows_left(&mut attention_mask, width, 0);

        Ok(Self {
            id: batch.id,
            requests,
            input_ids,
            attention_mask,
            past: None,
            pad_token_id: ctx.pad_token_id,
            device: ctx.device.clone(),
        })
    }

    fn concatenate(batches: Vec<Self>) -> Result<Self> {
        ensure_unique(batches.iter().flat_map(|b| b.requests.iter().map(RequestState::id)))?;
        let prefilled = common_phase(batches.iter().map(|b| b.is_prefilled()))?;
        if batches.len() == 1 {
            return batches
                .into_iter()
                .next()
                .ok_or_else(|| ShardgenError::batch_protocol("no batches to concatenate"));
        }

        let width = batches
            .iter()
            .map(|b| b.attention_mask.first().map_or(0, Vec::len))
            .max()
            .unwrap_or(0);
        let layers = batches.iter().filter_map(|b| b.past.as_ref().map(Vec::len)).max().unwrap_or(0);

        let mut batches = batches.into_iter();
        let Some(first) = batches.next() else {
            return Err(ShardgenError::batch_protocol("no batches to concatenate"));
        };
        let (id, pad_token_id, device) = (first.id, first.pad_token_id, first.device.clone());

        let mut requests = Vec::new();
        let mut input_ids = Vec::new();
        let mut attention_mask = Vec::new();
        let mut keys = vec![Vec::new(); layers];
        let mut values = vec![Vec::new(); layers];

        for mut batch in std::iter::once(first).chain(batches) {
            pad_rows_left(&mut batch.attention_mask, width, 0);
            if prefilled {
                let past = batch.past.take().unwrap_or_default();
                if past.len() != layers {
                    return Err(ShardgenError::batch_protocol(format!(
                        "batch {} caches {} layers, expected {}",
                        batch.id,
                        past.len(),
                        layers
                    )));
                }
                for (layer, (key, value)) in past.into_iter().enumerate() {
                    keys[layer].push(pad_left(&key, 2, width - 1)?);
                    values[layer].push(pad_left(&value, 2, width - 1)?);
                }
            } else {
                pad_rows_left(&mut batch.input_ids, width, pad_token_id);
            }

            requests.append(&mut batch.requests);
            input_ids.append(&mut batch.input_ids);
            attention_mask.append(&mut batch.attention_mask);
        }

        let past = if prefilled {
            let merged = keys
                .iter()
                .zip(&values)
                .map(|(k, v)| Ok((candle_core::Tensor::cat(k, 0)?, candle_core::Tensor::cat(v, 0)?)))
                .collect::<Result<LayerCache>>()?;
            Some(merged)
        } else {
            None
        };

        METRICS.shard.concatenations_total.inc();
        trace!(batch_id = id, size = requests.len(), width, "Concatenated causal batches");
        Self {
            id,
            requests,
            input_ids,
            attention_mask,
            past,
            pad_token_id,
            device,
        }
        .trim_padding()
    }

    fn filter(self, request_ids: &[u64]) -> Result<Self> {
        let rows = retained_rows(&self.requests, request_ids)?;
        if rows.len() == self.requests.len() {
            return Ok(self);
        }

        let past = match &self.past {
            Some(past) => Some(
                past.iter()
                    .map(|(k, v)| Ok((select_rows(k, &rows, 0)?, select_rows(v, &rows, 0)?)))
                    .collect::<Result<LayerCache>>()?,
            ),
            None => None,
        };
        Self {
            id: self.id,
            requests: pick(self.requests, &rows),
            input_ids: pick(self.input_ids, &rows),
            attention_mask: pick(self.attention_mask, &rows),
            past,
            pad_token_id: self.pad_token_id,
            device: self.device,
        }
        .trim_padding()
    }

    fn generate_step(self, model: &Model) -> Result<(Emitted, Option<Self>)> {
        let network = model.causal()?;
        let seq = self.input_ids.first().map_or(0, Vec::len);

        let input_ids = rows_to_tensor(&self.input_ids, &self.device)?;
        let positions = positions_from_mask(&self.attention_mask, seq);
        let bias = causal_bias(&self.attention_mask, seq, &self.device)?;
        let (logits, present) = network.forward_padded(&input_ids, &positions, &bias, self.past.as_deref())?;
        let logits = gather_logits(model.group().as_ref(), &logits, model.tp_embeddings())?;

        let selection = select_tokens(self.requests, &logits, model.tokenizer().as_ref())?;
        if selection.survivors.is_empty() {
            return Ok((selection.emitted, None));
        }

        let keep = &selection.keep;
        let mut attention_mask = pick(self.attention_mask, keep);
        for row in attention_mask.iter_mut() {
            row.push(1);
        }
        let past = present
            .iter()
            .map(|(k, v)| Ok((select_rows(k, keep, 0)?, select_rows(v, keep, 0)?)))
            .collect::<Result<LayerCache>>()?;

        let next = Self {
            id: self.id,
            input_ids: selection.survivors.iter().map(|r| vec![r.last_token()]).collect(),
            requests: selection.survivors,
            attention_mask,
            past: Some(past),
            pad_token_id: self.pad_token_id,
            device: self.device,
        }
        .trim_padding()?;
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
