//! Encoder-decoder batches

use super::{
    common_phase, drop_columns, ensure_unique, leading_padding, pad_rows_left, pick, prepare_requests,
    retained_rows, rows_to_tensor, select_rows, BatchContext, BatchOps, RequestState,
};
use crate::models::{LayerCache, Model};
use crate::orchestrator::{gather_logits, positions_from_mask, select_tokens, Emitted};
use crate::tensor::ops::{causal_bias, pad_left, padding_bias};
use candle_core::{Device, Tensor};
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto as proto;
use tracing::trace;

/// Encoder-decoder batch
///
/// The encoder runs once, on the first step; its output is kept for every
/// later step. The decoder is fed one token per request per step, starting
/// with the decoder start token.
#[derive(Debug)]
pub struct Seq2SeqLmBatch {
    id: u64,
    requests: Vec<RequestState>,
    encoder_ids: Vec<Vec<u32>>,
    encoder_mask: Vec<Vec<u32>>,
    /// `[batch, encoder_len, hidden]` once encoded
    encoder_states: Option<Tensor>,
    decoder_ids: Vec<u32>,
    /// Spans cached decoder positions plus `decoder_ids`
    decoder_mask: Vec<Vec<u32>>,
    past: Option<LayerCache>,
    pad_token_id: u32,
    device: Device,
}

impl Seq2SeqLmBatch {
    pub fn encoder_mask(&self) -> &[Vec<u32>] {
        &self.encoder_mask
    }

    pub fn decoder_mask(&self) -> &[Vec<u32>] {
        &self.decoder_mask
    }

    pub fn decoder_ids(&self) -> &[u32] {
        &self.decoder_ids
    }

    fn trim_padding(mut self) -> Result<Self> {
        let encoder_trim = leading_padding(&self.encoder_mask);
        if encoder_trim > 0 {
            drop_columns(&mut self.encoder_mask, encoder_trim);
            drop_columns(&mut self.encoder_ids, encoder_trim);
            if let Some(states) = self.encoder_states.as_mut() {
                let len = states.dim(1)?;
                *states = states.narrow(1, encoder_trim, len - encoder_trim)?;
            }
        }

        let decoder_trim = leading_padding(&self.decoder_mask);
        if decoder_trim > 0 {
            drop_columns(&mut self.decoder_mask, decoder_trim);
            if let Some(past) = self.past.as_mut() {
                for (key, value) in past.iter_mut() {
                    let len = key.dim(2)?;
                    *key = key.narrow(2, decoder_trim, len - decoder_trim)?;
                    *value = value.narrow(2, decoder_trim, len - decoder_trim)?;
                }
            }
        }
        Ok(self)
    }
}

fn width(rows: &[Vec<u32>]) -> usize {
    rows.first().map_or(0, Vec::len)
}

impl BatchOps for Seq2SeqLmBatch {
    fn from_pb(batch: &proto::Batch, ctx: &BatchContext) -> Result<Self> {
        let requests = prepare_requests(batch, ctx)?;
        let encoder_len = requests.iter().map(|r| r.prompt_ids.len()).max().unwrap_or(0);

        let mut encoder_ids: Vec<Vec<u32>> = requests.iter().map(|r| r.prompt_ids.clone()).collect();
        let mut encoder_mask: Vec<Vec<u32>> = requests.iter().map(|r| vec![1; r.prompt_ids.len()]).collect();
        pad_rows_left(&mut encoder_ids, encoder_len, ctx.pad_token_id);
        pad_rows_left(&mut encoder_mask, encoder_len, 0);

        let rows = requests.len();
        Ok(Self {
            id: batch.id,
            requests,
            encoder_ids,
            encoder_mask,
            encoder_states: None,
            decoder_ids: vec![ctx.decoder_start_token_id; rows],
            decoder_mask: vec![vec![1]; rows],
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

        let encoder_len = batches.iter().map(|b| width(&b.encoder_mask)).max().unwrap_or(0);
        let decoder_len = batches.iter().map(|b| width(&b.decoder_mask)).max().unwrap_or(0);
        let layers = batches.iter().filter_map(|b| b.past.as_ref().map(Vec::len)).max().unwrap_or(0);

        let mut batches = batches.into_iter();
        let Some(first) = batches.next() else {
            return Err(ShardgenError::batch_protocol("no batches to concatenate"));
        };
        let (id, pad_token_id, device) = (first.id, first.pad_token_id, first.device.clone());

        let mut requests = Vec::new();
        let mut encoder_ids = Vec::new();
        let mut encoder_mask = Vec::new();
        let mut encoder_states = Vec::new();
        let mut decoder_ids = Vec::new();
        let mut decoder_mask = Vec::new();
        let mut keys = vec![Vec::new(); layers];
        let mut values = vec![Vec::new(); layers];

        for mut batch in std::iter::once(first).chain(batches) {
            pad_rows_left(&mut batch.encoder_ids, encoder_len, pad_token_id);
            pad_rows_left(&mut batch.encoder_mask, encoder_len, 0);
            pad_rows_left(&mut batch.decoder_mask, decoder_len, 0);

            if prefilled {
                let states = batch.encoder_states.take().ok_or_else(|| {
                    ShardgenError::batch_protocol(format!("batch {} has no encoder states", batch.id))
                })?;
                encoder_states.push(pad_left(&states, 1, encoder_len)?);

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
                    keys[layer].push(pad_left(&key, 2, decoder_len - 1)?);
                    values[layer].push(pad_left(&value, 2, decoder_len - 1)?);
                }
            }

            requests.append(&mut batch.requests);
            encoder_ids.append(&mut batch.encoder_ids);
            encoder_mask.append(&mut batch.encoder_mask);
            decoder_ids.append(&mut batch.decoder_ids);
            decoder_mask.append(&mut batch.decoder_mask);
        }

        let (encoder_states, past) = if prefilled {
            let past = keys
                .iter()
                .zip(&values)
                .map(|(k, v)| Ok((Tensor::cat(k, 0)?, Tensor::cat(v, 0)?)))
                .collect::<Result<LayerCache>>()?;
            (Some(Tensor::cat(&encoder_states, 0)?), Some(past))
        } else {
            (None, None)
        };

        METRICS.shard.concatenations_total.inc();
        trace!(batch_id = id, size = requests.len(), encoder_len, decoder_len, "Concatenated seq2seq batches");
        Self {
            id,
            requests,
            encoder_ids,
            encoder_mask,
            encoder_states,
            decoder_ids,
            decoder_mask,
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

        let encoder_states = match &self.encoder_states {
            Some(states) => Some(select_rows(states, &rows, 0)?),
            None => None,
        };
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
            encoder_ids: pick(self.encoder_ids, &rows),
            encoder_mask: pick(self.encoder_mask, &rows),
            encoder_states,
            decoder_ids: pick(self.decoder_ids, &rows),
            decoder_mask: pick(self.decoder_mask, &rows),
            past,
            pad_token_id: self.pad_token_id,
            device: self.device,
        }
        .trim_padding()
    }

    fn generate_step(self, model: &Model) -> Result<(Emitted, Option<Self>)> {
        let network = model.seq2seq()?;
        let rows = self.requests.len();

        let encoder_bias = padding_bias(&self.encoder_mask, &self.device)?;
        let encoder_states = match &self.encoder_states {
            Some(states) => states.clone(),
            None => {
                let encoder_len = width(&self.encoder_ids);
                let input_ids = rows_to_tensor(&self.encoder_ids, &self.device)?;
                let positions = positions_from_mask(&self.encoder_mask, encoder_len);
                network.encode(&input_ids, &positions, &encoder_bias)?
            }
        };

        let decoder_input = Tensor::from_vec(self.decoder_ids.clone(), (rows, 1), &self.device)?;
        let positions = positions_from_mask(&self.decoder_mask, 1);
        let bias = causal_bias(&self.decoder_mask, 1, &self.device)?;
        let (logits, present) = network.decode(
            &decoder_input,
            &positions,
            &bias,
            &encoder_states,
            &encoder_bias,
            self.past.as_deref(),
        )?;
        let logits = gather_logits(model.group().as_ref(), &logits, model.tp_embeddings())?;

        let selection = select_tokens(self.requests, &logits, model.tokenizer().as_ref())?;
        if selection.survivors.is_empty() {
            return Ok((selection.emitted, None));
        }

        let keep = &selection.keep;
        let mut decoder_mask = pick(self.decoder_mask, keep);
        for row in decoder_mask.iter_mut() {
            row.push(1);
        }
        let past = present
            .iter()
            .map(|(k, v)| Ok((select_rows(k, keep, 0)?, select_rows(v, keep, 0)?)))
            .collect::<Result<LayerCache>>()?;

        let next = Self {
            id: self.id,
            encoder_ids: pick(self.encoder_ids, keep),
            encoder_mask: pick(self.encoder_mask, keep),
            encoder_states: Some(select_rows(&encoder_states, keep, 0)?),
            decoder_ids: selection.survivors.iter().map(RequestState::last_token).collect(),
            requests: selection.survivors,
            decoder_mask,
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
        self.encoder_states.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::{context, request, wire_batch};
    use candle_core::DType;

    fn prefilled(id: u64, requests: Vec<proto::Request>, decoded: usize) -> Seq2SeqLmBatch {
        let mut batch = Seq2SeqLmBatch::from_pb(&wire_batch(id, requests), &context()).unwrap();
        let rows = batch.requests.len();
        let encoder_len = width(&batch.encoder_mask);
        batch.encoder_states = Some(Tensor::ones((rows, encoder_len, 8), DType::F32, &Device::Cpu).unwrap());
        let cache = Tensor::ones((rows, 2, decoded, 4), DType::F32, &Device::Cpu).unwrap();
        batch.past = Some(vec![(cache.clone(), cache)]);
        batch.decoder_mask = vec![vec![1; decoded + 1]; rows];
        batch
    }

    #[test]
    fn test_from_pb_layout() {
        let batch = Seq2SeqLmBatch::from_pb(
            &wire_batch(4, vec![request(1, "how are you"), request(2, "hello")]),
            &context(),
        )
        .unwrap();

        assert_eq!(batch.encoder_mask(), &[vec![1, 1, 1], vec![0, 0, 1]]);
        assert_eq!(batch.decoder_ids(), &[0, 0]);
        assert_eq!(batch.decoder_mask(), &[vec![1], vec![1]]);
        assert!(!batch.is_prefilled());
    }

    #[test]
    fn test_concatenate_pads_encoder_and_decoder() {
        let a = prefilled(1, vec![request(1, "hello")], 1);
        let b = prefilled(2, vec![request(2, "how are you")], 3);

        let merged = Seq2SeqLmBatch::concatenate(vec![a, b]).unwrap();
        assert_eq!(merged.to_pb().request_ids(), vec![1, 2]);
        assert_eq!(merged.encoder_mask(), &[vec![0, 0, 1], vec![1, 1, 1]]);
        assert_eq!(merged.decoder_mask(), &[vec![0, 0, 1, 1], vec![1, 1, 1, 1]]);
        assert_eq!(merged.encoder_states.as_ref().unwrap().dims(), &[2, 3, 8]);
        assert_eq!(merged.past.as_ref().unwrap()[0].0.dims(), &[2, 2, 3, 4]);

        let filtered = merged.filter(&[1]).unwrap();
        assert_eq!(filtered.encoder_mask(), &[vec![1]]);
        assert_eq!(filtered.decoder_mask(), &[vec![1, 1]]);
        assert_eq!(filtered.encoder_states.as_ref().unwrap().dims(), &[1, 1, 8]);
        assert_eq!(filtered.past.as_ref().unwrap()[0].0.dims(), &[1, 2, 1, 4]);
    }

    #[test]
    fn test_concatenate_rejects_mixed_phases() {
        let a = prefilled(1, vec![request(1, "hello")], 1);
        let b = Seq2SeqLmBatch::from_pb(&wire_batch(2, vec![request(2, "world")]), &context()).unwrap();
        assert!(matches!(
            Seq2SeqLmBatch::concatenate(vec![a, b]),
            Err(ShardgenError::BatchProtocol(_))
        ));
    }
}
