//! Tensor operations shared by the model layers
//!
//! Kernels are candle's; this module composes them into the handful of
//! numerically careful operations the layers need (normalization, rotary
//! embeddings, masking) plus the int8 weight quantization helpers.

use candle_core::{DType, Device, Tensor, D};
use rayon::prelude::*;
use shardgen_common::{Result, ShardgenError};

/// Large negative bias used for masked attention scores
const MASK_VALUE: f32 = -1e9;

/// Base of the rotary frequency schedule
const ROTARY_BASE: f64 = 10_000.0;

/// Log-softmax along the last axis, computed in f32
pub fn log_softmax_last_dim(tensor: &Tensor) -> Result<Tensor> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let max = tensor.max_keepdim(D::Minus1)?;
    let shifted = tensor.broadcast_sub(&max)?;
    let log_sum = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(shifted.broadcast_sub(&log_sum)?)
}

/// Softmax along the last axis
pub fn softmax_last_dim(tensor: &Tensor) -> Result<Tensor> {
    let dtype = tensor.dtype();
    Ok(log_softmax_last_dim(tensor)?.exp()?.to_dtype(dtype)?)
}

/// Layer normalization over the last axis
pub fn layer_norm(tensor: &Tensor, gamma: &Tensor, beta: &Tensor, epsilon: f64) -> Result<Tensor> {
    let dtype = tensor.dtype();
    let x = tensor.to_dtype(DType::F32)?;

    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let std = variance.affine(1.0, epsilon)?.sqrt()?;

    let normalized = centered.broadcast_div(&std)?.to_dtype(dtype)?;
    Ok(normalized.broadcast_mul(gamma)?.broadcast_add(beta)?)
}

/// Cosine and sine tables for rotary embeddings
///
/// `positions` holds absolute positions of any shape; the tables get one
/// extra trailing axis of size `head_dim`.
pub fn rotary_tables(positions: &[u32], head_dim: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    if head_dim % 2 != 0 {
        return Err(ShardgenError::config(format!(
            "rotary embeddings need an even head dimension, got {}",
            head_dim
        )));
    }

    let half = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| (1.0 / ROTARY_BASE.powf(2.0 * i as f64 / head_dim as f64)) as f32)
        .collect();

    let mut angles = Vec::with_capacity(positions.len() * head_dim);
    for &position in positions {
        let row: Vec<f32> = inv_freq.iter().map(|f| position as f32 * f).collect();
        angles.extend_from_slice(&row);
        angles.extend_from_slice(&row);
    }

    let angles = Tensor::from_vec(angles, (positions.len(), head_dim), device)?;
    Ok((angles.cos()?, angles.sin()?))
}

/// Apply rotary embeddings; `cos`/`sin` must broadcast against `x`
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let half = x.dim(D::Minus1)? / 2;

    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

    let out = x.broadcast_mul(cos)?.broadcast_add(&rotated.broadcast_mul(sin)?)?;
    Ok(out.to_dtype(dtype)?)
}

/// Additive attention bias `[batch, 1, q_len, kv_len]`
///
/// A key is visible when its mask entry is 1 and it is not in the future of
/// the query. Queries are the last `q_len` positions of the key axis.
pub fn causal_bias(attention_mask: &[Vec<u32>], q_len: usize, device: &Device) -> Result<Tensor> {
    let batch = attention_mask.len();
    let kv_len = attention_mask.first().map(|m| m.len()).unwrap_or(0);
    if q_len > kv_len {
        return Err(ShardgenError::internal(format!(
            "{} queries against {} keys",
            q_len, kv_len
        )));
    }
    let offset = kv_len - q_len;

    let mut bias = Vec::with_capacity(batch * q_len * kv_len);
    for mask in attention_mask {
        for i in 0..q_len {
            for (j, &visible) in mask.iter().enumerate() {
                let allowed = visible == 1 && j <= offset + i;
                bias.push(if allowed { 0.0 } else { MASK_VALUE });
            }
        }
    }

    Ok(Tensor::from_vec(bias, (batch, 1, q_len, kv_len), device)?)
}

/// Additive padding bias `[batch, 1, 1, kv_len]` for non-causal attention
pub fn padding_bias(attention_mask: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let batch = attention_mask.len();
    let kv_len = attention_mask.first().map(|m| m.len()).unwrap_or(0);
    let bias: Vec<f32> = attention_mask
        .iter()
        .flat_map(|m| m.iter().map(|&v| if v == 1 { 0.0 } else { MASK_VALUE }))
        .collect();
    Ok(Tensor::from_vec(bias, (batch, 1, 1, kv_len), device)?)
}

/// Left-pad `tensor` with zeros along `dim` up to `target`
pub fn pad_left(tensor: &Tensor, dim: usize, target: usize) -> Result<Tensor> {
    let current = tensor.dim(dim)?;
    if current == target {
        return Ok(tensor.clone());
    }
    if current > target {
        return Err(ShardgenError::internal(format!(
            "cannot pad axis of length {} down to {}",
            current, target
        )));
    }

    let mut shape = tensor.dims().to_vec();
    shape[dim] = target - current;
    let zeros = Tensor::zeros(shape, tensor.dtype(), tensor.device())?;
    Ok(Tensor::cat(&[&zeros, tensor], dim)?)
}

/// Quantize f32 tensor to int8
///
/// Returns (quantized data, scale, zero_point)
pub fn quantize_int8(data: &[f32]) -> (Vec<i8>, f32, i32) {
    let min = data.par_iter().cloned().reduce(|| f32::INFINITY, f32::min);
    let max = data.par_iter().cloned().reduce(|| f32::NEG_INFINITY, f32::max);

    // A constant tensor still needs a usable scale
    let range = max - min;
    let scale = if range > 0.0 { range / 255.0 } else { 1.0 };
    let zero_point = if range > 0.0 {
        (-min / scale).round() as i32 - 128
    } else {
        -(min.round() as i32)
    };

    let quantized: Vec<i8> = data
        .par_iter()
        .map(|&x| {
            let q = (x / scale + zero_point as f32).round() as i32;
            q.clamp(-128, 127) as i8
        })
        .collect();

    (quantized, scale, zero_point)
}

/// Dequantize int8 tensor to f32
pub fn dequantize_int8(data: &[i8], scale: f32, zero_point: i32) -> Vec<f32> {
    data.par_iter()
        .map(|&x| ((x as i32 - zero_point) as f32) * scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax() {
        let t = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let result = softmax_last_dim(&t).unwrap().to_vec1::<f32>().unwrap();

        let sum: f32 = result.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result[0] < result[1]);
        assert!(result[1] < result[2]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let t = Tensor::new(&[[0.5f32, -1.0, 2.0]], &Device::Cpu).unwrap();
        let log_probs = log_softmax_last_dim(&t).unwrap().exp().unwrap();
        let probs = softmax_last_dim(&t).unwrap();
        let diff = (log_probs - probs).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_layer_norm() {
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let gamma = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let beta = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();

        let y = layer_norm(&x, &gamma, &beta, 1e-5).unwrap().to_vec2::<f32>().unwrap();
        let mean: f32 = y[0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(y[0][0] < 0.0 && y[0][3] > 0.0);
    }

    #[test]
    fn test_rotary_position_zero_is_identity() {
        let (cos, sin) = rotary_tables(&[0], 4, &Device::Cpu).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let y = apply_rotary(&x, &cos, &sin).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_causal_bias_respects_padding() {
        let mask = vec![vec![0, 1, 1], vec![1, 1, 1]];
        let bias = causal_bias(&mask, 2, &Device::Cpu).unwrap();
        assert_eq!(bias.dims(), &[2, 1, 2, 3]);

        let rows = bias.squeeze(1).unwrap().to_vec3::<f32>().unwrap();
        // Padded key is never visible
        assert_eq!(rows[0][1][0], MASK_VALUE);
        // First query cannot see the last key
        assert_eq!(rows[1][0][2], MASK_VALUE);
        assert_eq!(rows[1][1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pad_left() {
        let t = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let padded = pad_left(&t, 1, 4).unwrap();
        assert_eq!(padded.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0, 1.0, 2.0]]);
        assert!(pad_left(&t, 1, 1).is_err());
    }

    #[test]
    fn test_quantization() {
        let data = vec![-1.0f32, 0.0, 1.0, 2.0];

        let (quantized, scale, zero_point) = quantize_int8(&data);
        let dequantized = dequantize_int8(&quantized, scale, zero_point);

        for (orig, deq) in data.iter().zip(dequantized.iter()) {
            assert!((orig - deq).abs() < 0.01);
        }
    }
}
