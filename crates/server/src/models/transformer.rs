//! Reference transformer stacks
//!
//! A decoder-only stack for causal models (padded and packed inputs) and an
//! encoder-decoder stack for seq2seq models. Parameter names follow the
//! `transformer.*` / `encoder.*` / `decoder.*` layout.

use super::config::ModelConfig;
use super::layers::{Block, LayerContext, LayerNorm, Linear, ParallelEmbedding, Rotary};
use crate::loader::{ParameterStore, PartitionRole};
use crate::models::layers::declare_layer_norm;
use crate::tensor::ops::rotary_tables;
use candle_core::{DType, Device, Tensor};
use shardgen_common::Result;
use std::sync::Arc;

/// Per-layer key/value cache
pub type LayerCache = Vec<(Tensor, Tensor)>;

fn embedding_role(tp_embeddings: bool) -> PartitionRole {
    if tp_embeddings {
        PartitionRole::EmbeddingParallel
    } else {
        PartitionRole::Replicated
    }
}

fn padded_rotary(positions: &[u32], batch: usize, seq: usize, head_dim: usize, device: &Device) -> Result<Rotary> {
    let (cos, sin) = rotary_tables(positions, head_dim, device)?;
    Ok(Rotary {
        cos: cos.reshape((batch, seq, head_dim))?.unsqueeze(1)?,
        sin: sin.reshape((batch, seq, head_dim))?.unsqueeze(1)?,
    })
}

fn packed_rotary(positions: &[u32], head_dim: usize, device: &Device) -> Result<Rotary> {
    let (cos, sin) = rotary_tables(positions, head_dim, device)?;
    Ok(Rotary {
        cos: cos.unsqueeze(1)?,
        sin: sin.unsqueeze(1)?,
    })
}

fn load_embedding(ctx: &LayerContext<'_>, name: &str, tp_embeddings: bool) -> Result<ParallelEmbedding> {
    let group = tp_embeddings.then(|| Arc::clone(ctx.group));
    ParallelEmbedding::new(ctx.params.get(name)?, group)
}

fn load_head(
    ctx: &LayerContext<'_>,
    config: &ModelConfig,
    name: &str,
    embedding: &ParallelEmbedding,
) -> Result<Linear> {
    if config.tie_word_embeddings {
        Ok(Linear::new(embedding.weight().clone(), None))
    } else {
        Ok(Linear::new(ctx.params.get(name)?, None))
    }
}

/// Decoder-only stack
#[derive(Debug, Clone)]
pub struct CausalTransformer {
    embed_in: ParallelEmbedding,
    layers: Vec<Block>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    head_dim: usize,
}

impl CausalTransformer {
    /// Declare every parameter of the stack
    pub fn declare(store: &mut ParameterStore, config: &ModelConfig, tp_embeddings: bool) -> Result<()> {
        let (vocab, hidden) = (config.vocab_size, config.hidden_size);
        let role = embedding_role(tp_embeddings);

        store.declare("transformer.embed_in.weight", &[vocab, hidden], role)?;
        for layer in 0..config.num_hidden_layers {
            Block::declare(
                store,
                &format!("transformer.layers.{}", layer),
                hidden,
                config.intermediate(),
                false,
            )?;
        }
        declare_layer_norm(store, "transformer.final_layer_norm", hidden)?;
        if !config.tie_word_embeddings {
            store.declare("embed_out.weight", &[vocab, hidden], role)?;
        }
        Ok(())
    }

    /// Rebuild the stack from loaded parameters
    pub fn load(ctx: &LayerContext<'_>, config: &ModelConfig, tp_embeddings: bool) -> Result<Self> {
        let embed_in = load_embedding(ctx, "transformer.embed_in.weight", tp_embeddings)?;
        let layers = (0..config.num_hidden_layers)
            .map(|layer| Block::load(ctx, &format!("transformer.layers.{}", layer), false))
            .collect::<Result<Vec<_>>>()?;
        let embed_out = load_head(ctx, config, "embed_out.weight", &embed_in)?;

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm: ctx.layer_norm("transformer.final_layer_norm")?,
            embed_out,
            head_dim: ctx.head_dim,
        })
    }

    /// Number of blocks
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.final_layer_norm.forward(hidden)?;
        Ok(self.embed_out.forward(&normed)?.to_dtype(DType::F32)?)
    }

    /// Padded forward over `input_ids` `[batch, seq]`
    ///
    /// Returns last-position logits `[batch, local_vocab]` and the updated
    /// per-layer cache `[batch, heads, past_len + seq, head_dim]`.
    pub fn forward_padded(
        &self,
        input_ids: &Tensor,
        positions: &[u32],
        bias: &Tensor,
        past: Option<&[(Tensor, Tensor)]>,
    ) -> Result<(Tensor, LayerCache)> {
        let (batch, seq) = input_ids.dims2()?;
        let rotary = padded_rotary(positions, batch, seq, self.head_dim, input_ids.device())?;

        let mut hidden = self.embed_in.forward(input_ids)?;
        let mut present = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate() {
            let layer_past = past.map(|p| &p[index]);
            let (next, cache) = layer.forward_padded(&hidden, &rotary, bias, layer_past, None)?;
            hidden = next;
            present.push(cache);
        }

        let last = hidden.narrow(1, seq - 1, 1)?.squeeze(1)?;
        Ok((self.logits(&last)?, present))
    }

    /// Packed forward over `input_ids` `[tokens]`
    ///
    /// `past` and the returned cache are indexed by sequence, then layer.
    /// Returns the logits of each sequence's last token `[sequences, local_vocab]`.
    pub fn forward_packed(
        &self,
        input_ids: &Tensor,
        positions: &[u32],
        cu_seqlens: &[usize],
        past: Option<&[LayerCache]>,
    ) -> Result<(Tensor, Vec<LayerCache>)> {
        let device = input_ids.device();
        let rotary = packed_rotary(positions, self.head_dim, device)?;
        let sequences = cu_seqlens.len().saturating_sub(1);

        let mut hidden = self.embed_in.forward(input_ids)?;
        let mut present: Vec<LayerCache> = (0..sequences)
            .map(|_| Vec::with_capacity(self.layers.len()))
            .collect();
        for (index, layer) in self.layers.iter().enumerate() {
            let layer_past = past.map(|p| p.iter().map(|sequence| &sequence[index]).collect());
            let (next, caches) = layer.forward_packed(&hidden, &rotary, cu_seqlens, layer_past)?;
            hidden = next;
            for (sequence, cache) in present.iter_mut().zip(caches) {
                sequence.push(cache);
            }
        }

        let last: Vec<u32> = cu_seqlens[1..].iter().map(|&end| (end - 1) as u32).collect();
        let last = Tensor::from_vec(last, sequences, device)?;
        let last = hidden.index_select(&last, 0)?;
        Ok((self.logits(&last)?, present))
    }
}

/// Encoder-decoder stack
#[derive(Debug, Clone)]
pub struct Seq2SeqTransformer {
    shared: ParallelEmbedding,
    encoder: Vec<Block>,
    encoder_final_layer_norm: LayerNorm,
    decoder: Vec<Block>,
    decoder_final_layer_norm: LayerNorm,
    lm_head: Linear,
    head_dim: usize,
}

impl Seq2SeqTransformer {
    /// Declare every parameter of the stack
    pub fn declare(store: &mut ParameterStore, config: &ModelConfig, tp_embeddings: bool) -> Result<()> {
        let (vocab, hidden, intermediate) = (config.vocab_size, config.hidden_size, config.intermediate());
        let role = embedding_role(tp_embeddings);

        store.declare("shared.weight", &[vocab, hidden], role)?;
        for layer in 0..config.num_hidden_layers {
            Block::declare(store, &format!("encoder.layers.{}", layer), hidden, intermediate, false)?;
        }
        declare_layer_norm(store, "encoder.final_layer_norm", hidden)?;
        for layer in 0..config.decoder_layers() {
            Block::declare(store, &format!("decoder.layers.{}", layer), hidden, intermediate, true)?;
        }
        declare_layer_norm(store, "decoder.final_layer_norm", hidden)?;
        if !config.tie_word_embeddings {
            store.declare("lm_head.weight", &[vocab, hidden], role)?;
        }
        Ok(())
    }

    /// Rebuild the stack from loaded parameters
    pub fn load(ctx: &LayerContext<'_>, config: &ModelConfig, tp_embeddings: bool) -> Result<Self> {
        let shared = load_embedding(ctx, "shared.weight", tp_embeddings)?;
        let encoder = (0..config.num_hidden_layers)
            .map(|layer| Block::load(ctx, &format!("encoder.layers.{}", layer), false))
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..config.decoder_layers())
            .map(|layer| Block::load(ctx, &format!("decoder.layers.{}", layer), true))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = load_head(ctx, config, "lm_head.weight", &shared)?;

        Ok(Self {
            shared,
            encoder,
            encoder_final_layer_norm: ctx.layer_norm("encoder.final_layer_norm")?,
            decoder,
            decoder_final_layer_norm: ctx.layer_norm("decoder.final_layer_norm")?,
            lm_head,
            head_dim: ctx.head_dim,
        })
    }

    /// Encode left-padded `input_ids` `[batch, enc_len]`
    ///
    /// `bias` is the padding bias `[batch, 1, 1, enc_len]`.
    pub fn encode(&self, input_ids: &Tensor, positions: &[u32], bias: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let rotary = padded_rotary(positions, batch, seq, self.head_dim, input_ids.device())?;

        let mut hidden = self.shared.forward(input_ids)?;
        for layer in &self.encoder {
            hidden = layer.forward_padded(&hidden, &rotary, bias, None, None)?.0;
        }
        self.encoder_final_layer_norm.forward(&hidden)
    }

    /// One decoder pass over `input_ids` `[batch, seq]`
    ///
    /// Returns last-position logits `[batch, local_vocab]` and the updated
    /// decoder self-attention cache.
    pub fn decode(
        &self,
        input_ids: &Tensor,
        positions: &[u32],
        bias: &Tensor,
        encoder_states: &Tensor,
        encoder_bias: &Tensor,
        past: Option<&[(Tensor, Tensor)]>,
    ) -> Result<(Tensor, LayerCache)> {
        let (batch, seq) = input_ids.dims2()?;
        let rotary = padded_rotary(positions, batch, seq, self.head_dim, input_ids.device())?;

        let mut hidden = self.shared.forward(input_ids)?;
        let mut present = Vec::with_capacity(self.decoder.len());
        for (index, layer) in self.decoder.iter().enumerate() {
            let layer_past = past.map(|p| &p[index]);
            let (next, cache) = layer.forward_padded(
                &hidden,
                &rotary,
                bias,
                layer_past,
                Some((encoder_states, encoder_bias)),
            )?;
            hidden = next;
            present.push(cache);
        }

        let last = hidden.narrow(1, seq - 1, 1)?.squeeze(1)?;
        let normed = self.decoder_final_layer_norm.forward(&last)?;
        Ok((self.lm_head.forward(&normed)?.to_dtype(DType::F32)?, present))
    }
}
