//! Tensor-parallel building blocks
//!
//! Every layer knows how to declare its parameters (full logical shapes plus
//! partition role) and how to rebuild itself from the loaded rank-local
//! shards. Layers that produce partial results on each rank reduce them
//! themselves.

use crate::distributed::ProcessGroup;
use crate::loader::{ParameterStore, Parameters, PartitionRole};
use crate::tensor::ops::{apply_rotary, layer_norm, softmax_last_dim};
use crate::tensor::{dequantize_int8, quantize_int8};
use candle_core::{DType, Device, Tensor, D};
use shardgen_common::Result;
use std::sync::Arc;

/// Declare `{prefix}.weight` `[out, in]` and `{prefix}.bias` `[out]`
pub fn declare_linear(
    store: &mut ParameterStore,
    prefix: &str,
    out_features: usize,
    in_features: usize,
    role: PartitionRole,
) -> Result<()> {
    store.declare(format!("{}.weight", prefix), &[out_features, in_features], role)?;
    store.declare(format!("{}.bias", prefix), &[out_features], role)
}

/// Declare `{prefix}.weight` and `{prefix}.bias`, both `[hidden]`
pub fn declare_layer_norm(store: &mut ParameterStore, prefix: &str, hidden: usize) -> Result<()> {
    store.declare(format!("{}.weight", prefix), &[hidden], PartitionRole::Replicated)?;
    store.declare(format!("{}.bias", prefix), &[hidden], PartitionRole::Replicated)
}

/// Shared inputs for rebuilding layers from loaded parameters
pub struct LayerContext<'a> {
    pub params: &'a Parameters,
    pub group: &'a Arc<dyn ProcessGroup>,
    pub quantize: bool,
    /// Attention heads held by this rank
    pub local_heads: usize,
    pub head_dim: usize,
    pub layer_norm_eps: f64,
}

impl<'a> LayerContext<'a> {
    pub fn linear(&self, prefix: &str) -> Result<Linear> {
        let weight = self.params.get(&format!("{}.weight", prefix))?;
        let bias = self.params.get(&format!("{}.bias", prefix))?;
        if self.quantize {
            Linear::quantized(&weight, Some(bias))
        } else {
            Ok(Linear::new(weight, Some(bias)))
        }
    }

    fn row_linear(&self, prefix: &str) -> Result<RowLinear> {
        Ok(RowLinear {
            linear: self.linear(prefix)?,
            group: Arc::clone(self.group),
        })
    }

    pub fn layer_norm(&self, prefix: &str) -> Result<LayerNorm> {
        Ok(LayerNorm {
            weight: self.params.get(&format!("{}.weight", prefix))?,
            bias: self.params.get(&format!("{}.bias", prefix))?,
            eps: self.layer_norm_eps,
        })
    }
}

/// Linear weight storage
#[derive(Debug, Clone)]
enum LinearWeight {
    Dense(Tensor),
    /// Weight-only int8 with per-tensor scale and zero point
    Int8 {
        data: Vec<i8>,
        scale: f32,
        zero_point: i32,
        shape: (usize, usize),
        dtype: DType,
        device: Device,
    },
}

/// `y = x W^T + b`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: LinearWeight,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight: LinearWeight::Dense(weight),
            bias,
        }
    }

    /// Store the weight as int8, dequantizing on every forward
    pub fn quantized(weight: &Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (rows, cols) = weight.dims2()?;
        let values = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let (data, scale, zero_point) = quantize_int8(&values);

        Ok(Self {
            weight: LinearWeight::Int8 {
                data,
                scale,
                zero_point,
                shape: (rows, cols),
                dtype: weight.dtype(),
                device: weight.device().clone(),
            },
            bias,
        })
    }

    fn weight(&self) -> Result<Tensor> {
        match &self.weight {
            LinearWeight::Dense(weight) => Ok(weight.clone()),
            LinearWeight::Int8 {
                data,
                scale,
                zero_point,
                shape,
                dtype,
                device,
            } => {
                let values = dequantize_int8(data, *scale, *zero_point);
                Ok(Tensor::from_vec(values, *shape, device)?.to_dtype(*dtype)?)
            }
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.weight()?;
        let weight = match x.dims() {
            [batch, _, _] => weight.broadcast_left(*batch)?.t()?,
            _ => weight.t()?,
        };
        let y = x.matmul(&weight)?;
        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(bias)?),
            None => Ok(y),
        }
    }
}

/// Linear layer whose input dimension is split across ranks
///
/// Each rank computes a partial product; the all-reduce sums them. Only
/// rank 0 holds the real bias, so it is counted exactly once.
#[derive(Debug, Clone)]
pub struct RowLinear {
    linear: Linear,
    group: Arc<dyn ProcessGroup>,
}

impl RowLinear {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let partial = self.linear.forward(x)?;
        self.group.all_reduce_sum(&partial)
    }
}

/// Layer normalization with affine parameters
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

/// Token embedding, optionally split over the vocabulary
#[derive(Debug, Clone)]
pub struct ParallelEmbedding {
    weight: Tensor,
    /// First vocabulary id held by this rank
    offset: u32,
    /// Present when the vocabulary is split
    group: Option<Arc<dyn ProcessGroup>>,
}

impl ParallelEmbedding {
    pub fn new(weight: Tensor, group: Option<Arc<dyn ProcessGroup>>) -> Result<Self> {
        let local_vocab = weight.dim(0)?;
        let offset = group
            .as_ref()
            .map(|g| (g.rank() * local_vocab) as u32)
            .unwrap_or(0);
        Ok(Self {
            weight,
            offset,
            group,
        })
    }

    /// Local embedding table
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let mut shape = ids.dims().to_vec();
        shape.push(self.weight.dim(1)?);
        let flat = ids.flatten_all()?;

        let group = match &self.group {
            Some(group) => group,
            None => return Ok(self.weight.index_select(&flat, 0)?.reshape(shape)?),
        };

        // Ids owned by other ranks look up row 0 and are masked out
        let local_vocab = self.weight.dim(0)? as u32;
        let ids = flat.to_vec1::<u32>()?;
        let (local, mask): (Vec<u32>, Vec<f32>) = ids
            .iter()
            .map(|&id| {
                if id >= self.offset && id < self.offset + local_vocab {
                    (id - self.offset, 1.0)
                } else {
                    (0, 0.0)
                }
            })
            .unzip();

        let device = self.weight.device();
        let count = local.len();
        let local = Tensor::from_vec(local, count, device)?;
        let mask = Tensor::from_vec(mask, (count, 1), device)?.to_dtype(self.weight.dtype())?;

        let partial = self.weight.index_select(&local, 0)?.broadcast_mul(&mask)?;
        Ok(group.all_reduce_sum(&partial)?.reshape(shape)?)
    }
}

/// Cosine and sine tables broadcastable against `[.., heads, seq, head_dim]`
/// (padded) or `[tokens, heads, head_dim]` (packed) queries
#[derive(Debug, Clone)]
pub struct Rotary {
    pub cos: Tensor,
    pub sin: Tensor,
}

fn attend(q: &Tensor, k: &Tensor, v: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let head_dim = q.dim(D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let scores = (q.matmul(&k.t()?)? * scale)?;
    let scores = scores.to_dtype(DType::F32)?.broadcast_add(bias)?;
    let probs = softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
    Ok(probs.matmul(v)?)
}

/// Self-attention with a fused, head-major `query_key_value` projection
#[derive(Debug, Clone)]
pub struct SelfAttention {
    query_key_value: Linear,
    dense: RowLinear,
    local_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn declare(store: &mut ParameterStore, prefix: &str, hidden: usize) -> Result<()> {
        declare_linear(
            store,
            &format!("{}.query_key_value", prefix),
            3 * hidden,
            hidden,
            PartitionRole::ColumnParallel,
        )?;
        declare_linear(store, &format!("{}.dense", prefix), hidden, hidden, PartitionRole::RowParallel)
    }

    pub fn load(ctx: &LayerContext<'_>, prefix: &str) -> Result<Self> {
        Ok(Self {
            query_key_value: ctx.linear(&format!("{}.query_key_value", prefix))?,
            dense: ctx.row_linear(&format!("{}.dense", prefix))?,
            local_heads: ctx.local_heads,
            head_dim: ctx.head_dim,
        })
    }

    /// Padded inputs `[batch, seq, hidden]`
    ///
    /// `past` holds `[batch, heads, past_len, head_dim]` keys and values;
    /// `bias` is `[batch, 1, seq, past_len + seq]`.
    pub fn forward_padded(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        bias: &Tensor,
        past: Option<&(Tensor, Tensor)>,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (batch, seq, _) = x.dims3()?;
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((batch, seq, self.local_heads, 3, self.head_dim))?;

        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv.narrow(3, i, 1)?.squeeze(3)?.transpose(1, 2)?.contiguous()?)
        };
        let q = apply_rotary(&split(0)?, &rotary.cos, &rotary.sin)?;
        let mut k = apply_rotary(&split(1)?, &rotary.cos, &rotary.sin)?;
        let mut v = split(2)?;

        if let Some((past_k, past_v)) = past {
            k = Tensor::cat(&[past_k, &k], 2)?;
            v = Tensor::cat(&[past_v, &v], 2)?;
        }

        let context = attend(&q, &k, &v, bias)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.local_heads * self.head_dim))?;
        Ok((self.dense.forward(&context)?, (k, v)))
    }

    /// Packed inputs `[tokens, hidden]`, sequences delimited by `cu_seqlens`
    ///
    /// Each sequence attends only to itself; `past` holds one
    /// `[heads, past_len, head_dim]` key/value pair per sequence.
    pub fn forward_packed(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        cu_seqlens: &[usize],
        past: Option<Vec<&(Tensor, Tensor)>>,
    ) -> Result<(Tensor, Vec<(Tensor, Tensor)>)> {
        let tokens = x.dim(0)?;
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((tokens, self.local_heads, 3, self.head_dim))?;

        let split = |i: usize| -> Result<Tensor> { Ok(qkv.narrow(2, i, 1)?.squeeze(2)?) };
        let q = apply_rotary(&split(0)?, &rotary.cos, &rotary.sin)?;
        let k = apply_rotary(&split(1)?, &rotary.cos, &rotary.sin)?;
        let v = split(2)?;

        let mut outputs = Vec::with_capacity(cu_seqlens.len().saturating_sub(1));
        let mut present = Vec::with_capacity(outputs.capacity());
        for (i, bounds) in cu_seqlens.windows(2).enumerate() {
            let (start, len) = (bounds[0], bounds[1] - bounds[0]);
            let heads_first = |t: &Tensor| -> Result<Tensor> {
                Ok(t.narrow(0, start, len)?.transpose(0, 1)?.contiguous()?)
            };

            let q_i = heads_first(&q)?;
            let mut k_i = heads_first(&k)?;
            let mut v_i = heads_first(&v)?;
            if let Some(past) = &past {
                let (past_k, past_v) = past[i];
                k_i = Tensor::cat(&[past_k, &k_i], 1)?;
                v_i = Tensor::cat(&[past_v, &v_i], 1)?;
            }

            let kv_len = k_i.dim(1)?;
            let bias = crate::tensor::ops::causal_bias(&[vec![1; kv_len]], len, x.device())?.squeeze(0)?;
            let context = attend(&q_i, &k_i, &v_i, &bias)?.transpose(0, 1)?;
            outputs.push(context);
            present.push((k_i, v_i));
        }

        let context = Tensor::cat(&outputs, 0)?.reshape((tokens, self.local_heads * self.head_dim))?;
        Ok((self.dense.forward(&context)?, present))
    }
}

/// Decoder attention over encoder states
#[derive(Debug, Clone)]
pub struct CrossAttention {
    query: Linear,
    key_value: Linear,
    dense: RowLinear,
    local_heads: usize,
    head_dim: usize,
}

impl CrossAttention {
    pub fn declare(store: &mut ParameterStore, prefix: &str, hidden: usize) -> Result<()> {
        declare_linear(store, &format!("{}.query", prefix), hidden, hidden, PartitionRole::ColumnParallel)?;
        declare_linear(
            store,
            &format!("{}.key_value", prefix),
            2 * hidden,
            hidden,
            PartitionRole::ColumnParallel,
        )?;
        declare_linear(store, &format!("{}.dense", prefix), hidden, hidden, PartitionRole::RowParallel)
    }

    pub fn load(ctx: &LayerContext<'_>, prefix: &str) -> Result<Self> {
        Ok(Self {
            query: ctx.linear(&format!("{}.query", prefix))?,
            key_value: ctx.linear(&format!("{}.key_value", prefix))?,
            dense: ctx.row_linear(&format!("{}.dense", prefix))?,
            local_heads: ctx.local_heads,
            head_dim: ctx.head_dim,
        })
    }

    /// `x` is `[batch, seq, hidden]`, `encoder` is `[batch, enc_len, hidden]`
    pub fn forward(&self, x: &Tensor, encoder: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let enc_len = encoder.dim(1)?;

        let q = self
            .query
            .forward(x)?
            .reshape((batch, seq, self.local_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let kv = self
            .key_value
            .forward(encoder)?
            .reshape((batch, enc_len, self.local_heads, 2, self.head_dim))?;
        let k = kv.narrow(3, 0, 1)?.squeeze(3)?.transpose(1, 2)?.contiguous()?;
        let v = kv.narrow(3, 1, 1)?.squeeze(3)?.transpose(1, 2)?.contiguous()?;

        let context = attend(&q, &k, &v, bias)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.local_heads * self.head_dim))?;
        self.dense.forward(&context)
    }
}

/// Two-layer GELU MLP
#[derive(Debug, Clone)]
pub struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: RowLinear,
}

impl Mlp {
    pub fn declare(store: &mut ParameterStore, prefix: &str, hidden: usize, intermediate: usize) -> Result<()> {
        declare_linear(
            store,
            &format!("{}.dense_h_to_4h", prefix),
            intermediate,
            hidden,
            PartitionRole::ColumnParallel,
        )?;
        declare_linear(
            store,
            &format!("{}.dense_4h_to_h", prefix),
            hidden,
            intermediate,
            PartitionRole::RowParallel,
        )
    }

    pub fn load(ctx: &LayerContext<'_>, prefix: &str) -> Result<Self> {
        Ok(Self {
            dense_h_to_4h: ctx.linear(&format!("{}.dense_h_to_4h", prefix))?,
            dense_4h_to_h: ctx.row_linear(&format!("{}.dense_4h_to_h", prefix))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.dense_h_to_4h.forward(x)?.gelu_erf()?;
        self.dense_4h_to_h.forward(&hidden)
    }
}

/// Pre-layer-norm transformer block, optionally with cross-attention
#[derive(Debug, Clone)]
pub struct Block {
    input_layernorm: LayerNorm,
    attention: SelfAttention,
    cross: Option<(LayerNorm, CrossAttention)>,
    post_attention_layernorm: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn declare(
        store: &mut ParameterStore,
        prefix: &str,
        hidden: usize,
        intermediate: usize,
        cross: bool,
    ) -> Result<()> {
        declare_layer_norm(store, &format!("{}.input_layernorm", prefix), hidden)?;
        SelfAttention::declare(store, &format!("{}.attention", prefix), hidden)?;
        if cross {
            declare_layer_norm(store, &format!("{}.cross_attention_layernorm", prefix), hidden)?;
            CrossAttention::declare(store, &format!("{}.cross_attention", prefix), hidden)?;
        }
        declare_layer_norm(store, &format!("{}.post_attention_layernorm", prefix), hidden)?;
        Mlp::declare(store, &format!("{}.mlp", prefix), hidden, intermediate)
    }

    pub fn load(ctx: &LayerContext<'_>, prefix: &str, cross: bool) -> Result<Self> {
        let cross = if cross {
            Some((
                ctx.layer_norm(&format!("{}.cross_attention_layernorm", prefix))?,
                CrossAttention::load(ctx, &format!("{}.cross_attention", prefix))?,
            ))
        } else {
            None
        };

        Ok(Self {
            input_layernorm: ctx.layer_norm(&format!("{}.input_layernorm", prefix))?,
            attention: SelfAttention::load(ctx, &format!("{}.attention", prefix))?,
            cross,
            post_attention_layernorm: ctx.layer_norm(&format!("{}.post_attention_layernorm", prefix))?,
            mlp: Mlp::load(ctx, &format!("{}.mlp", prefix))?,
        })
    }

    /// Padded forward; `encoder` is `(states, bias)` for decoder blocks
    pub fn forward_padded(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        bias: &Tensor,
        past: Option<&(Tensor, Tensor)>,
        encoder: Option<(&Tensor, &Tensor)>,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (attended, present) =
            self.attention
                .forward_padded(&self.input_layernorm.forward(x)?, rotary, bias, past)?;
        let mut x = (x + attended)?;

        if let (Some((norm, cross)), Some((states, cross_bias))) = (&self.cross, encoder) {
            x = (&x + cross.forward(&norm.forward(&x)?, states, cross_bias)?)?;
        }

        let out = (&x + self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?)?;
        Ok((out, present))
    }

    /// Packed forward, decoder-only
    pub fn forward_packed(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        cu_seqlens: &[usize],
        past: Option<Vec<&(Tensor, Tensor)>>,
    ) -> Result<(Tensor, Vec<(Tensor, Tensor)>)> {
        let (attended, present) = self.attention.forward_packed(
            &self.input_layernorm.forward(x)?,
            rotary,
            cu_seqlens,
            past,
        )?;
        let x = (x + attended)?;
        let out = (&x + self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?)?;
        Ok((out, present))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalProcessGroup, ShardSpec};

    #[test]
    fn test_linear_forward() {
        let weight = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, 0.0, -1.0], &Device::Cpu).unwrap();
        let linear = Linear::new(weight, Some(bias));

        let x = Tensor::new(&[[[1.0f32, 2.0]]], &Device::Cpu).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3]);
        assert_eq!(y.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![1.5, 4.0, 2.0]);
    }

    #[test]
    fn test_quantized_linear_close_to_dense() {
        let weight = Tensor::new(&[[0.5f32, -0.25], [1.0, 0.75]], &Device::Cpu).unwrap();
        let x = Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap();

        let dense = Linear::new(weight.clone(), None).forward(&x).unwrap();
        let quantized = Linear::quantized(&weight, None).unwrap().forward(&x).unwrap();
        let diff = (dense - quantized).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 0.02);
    }

    #[test]
    fn test_split_embedding_matches_full() {
        let table = Tensor::arange(0f32, 12f32, &Device::Cpu).unwrap().reshape((4, 3)).unwrap();
        let ids = Tensor::new(&[[3u32, 0, 2]], &Device::Cpu).unwrap();
        let full = ParallelEmbedding::new(table.clone(), None)
            .unwrap()
            .forward(&ids)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let groups = LocalProcessGroup::new_group(2);
        let results: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    let table = table.clone();
                    let ids = ids.clone();
                    s.spawn(move || {
                        let spec: ShardSpec = group.spec();
                        let local = table.narrow(0, spec.rank * 2, 2).unwrap();
                        let group: Arc<dyn ProcessGroup> = Arc::new(group);
                        let embedding = ParallelEmbedding::new(local, Some(group)).unwrap();
                        let out = embedding.forward(&ids).unwrap();
                        assert_eq!(out.dims(), &[1, 3, 3]);
                        out.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for result in results {
            assert_eq!(result, full);
        }
    }
}
