//! Tensor storage and operations
//!
//! Weight files are read through [`safetensors`]; everything else works on
//! candle tensors.

pub mod ops;
pub mod safetensors;

pub use ops::{dequantize_int8, quantize_int8};
pub use safetensors::{SafeTensorBuffer, TensorDType, TensorSlice};
