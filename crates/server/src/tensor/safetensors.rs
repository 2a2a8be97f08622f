//! SafeTensor format support with memory-mapped files
//!
//! This module provides sliced access to model weights stored in SafeTensor
//! format. Files are memory-mapped; a [`TensorSlice`] reads only the bytes of
//! the block it is asked for and copies them into a fresh, contiguous tensor.

use candle_core::{Device, Tensor};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use shardgen_common::{Result, ShardgenError};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Key reserved for free-form metadata in the header
const METADATA_KEY: &str = "__metadata__";

/// Data type for SafeTensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    U8,
    BOOL,
}

impl TensorDType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            TensorDType::F64 | TensorDType::I64 => 8,
            TensorDType::F32 | TensorDType::I32 => 4,
            TensorDType::F16 | TensorDType::BF16 => 2,
            TensorDType::U8 | TensorDType::BOOL => 1,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F64" => Some(TensorDType::F64),
            "F32" => Some(TensorDType::F32),
            "F16" => Some(TensorDType::F16),
            "BF16" => Some(TensorDType::BF16),
            "I64" => Some(TensorDType::I64),
            "I32" => Some(TensorDType::I32),
            "U8" => Some(TensorDType::U8),
            "BOOL" => Some(TensorDType::BOOL),
            _ => None,
        }
    }

    /// Whether values can be loaded as model parameters
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            TensorDType::F64 | TensorDType::F32 | TensorDType::F16 | TensorDType::BF16
        )
    }
}

/// Information about a single tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor dtype
    pub dtype: String,

    /// Tensor shape
    pub shape: Vec<usize>,

    /// Data offsets (start, end) in bytes, relative to the end of the header
    pub data_offsets: Vec<usize>,
}

impl TensorInfo {
    /// Get the dtype
    pub fn get_dtype(&self) -> Option<TensorDType> {
        TensorDType::parse(&self.dtype)
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// SafeTensor metadata header
#[derive(Debug, Clone, Default)]
pub struct SafeTensorHeader {
    /// Map of tensor name to tensor info
    pub tensors: BTreeMap<String, TensorInfo>,

    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl SafeTensorHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
        let mut header = SafeTensorHeader::default();

        for (name, value) in raw {
            if name == METADATA_KEY {
                header.metadata = serde_json::from_value(value)?;
            } else {
                header.tensors.insert(name, serde_json::from_value(value)?);
            }
        }

        Ok(header)
    }
}

/// Memory-mapped SafeTensor buffer
///
/// The memory is mapped directly from the file; only the pages backing the
/// slices that are actually read get loaded by the OS.
pub struct SafeTensorBuffer {
    /// Source path, for error messages
    path: PathBuf,

    /// Memory-mapped file
    mmap: Mmap,

    /// Parsed header
    header: SafeTensorHeader,

    /// Offset of the first data byte
    data_start: usize,
}

impl SafeTensorBuffer {
    /// Open a SafeTensor file with memory mapping
    ///
    /// Every tensor's offsets are checked against its dtype, shape and the
    /// file length before any slice is handed out.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| {
            ShardgenError::weight_file(format!("Failed to open file {}: {}", path.display(), e))
        })?;

        // SAFETY: weight files are treated as read-only for the lifetime of the process.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                ShardgenError::weight_file(format!("Failed to mmap file {}: {}", path.display(), e))
            })?
        };

        // First 8 bytes are the little-endian header length
        if mmap.len() < 8 {
            return Err(ShardgenError::weight_file(format!(
                "{}: file too small to contain header",
                path.display()
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;

        let data_start = 8usize
            .checked_add(header_len)
            .filter(|end| *end <= mmap.len())
            .ok_or_else(|| {
                ShardgenError::weight_file(format!(
                    "{}: header length exceeds file size",
                    path.display()
                ))
            })?;

        let header = SafeTensorHeader::parse(&mmap[8..data_start]).map_err(|e| {
            ShardgenError::weight_file(format!("{}: invalid header: {}", path.display(), e))
        })?;

        let data_len = mmap.len() - data_start;
        for (name, info) in &header.tensors {
            let dtype = info.get_dtype().ok_or_else(|| {
                ShardgenError::weight_file(format!("{}: unknown dtype {}", name, info.dtype))
            })?;
            let (begin, end) = match info.data_offsets.as_slice() {
                [begin, end] => (*begin, *end),
                _ => {
                    return Err(ShardgenError::weight_file(format!(
                        "{}: malformed data offsets",
                        name
                    )))
                }
            };
            if begin > end || end > data_len || end - begin != info.numel() * dtype.size() {
                return Err(ShardgenError::weight_file(format!(
                    "{}: data offsets {:?} do not match shape {:?} ({})",
                    name, info.data_offsets, info.shape, info.dtype
                )));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            data_start,
        })
    }

    /// Get the header
    pub fn header(&self) -> &SafeTensorHeader {
        &self.header
    }

    /// Source path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get tensor names, in lexicographic order
    pub fn tensor_names(&self) -> impl Iterator<Item = &String> {
        self.header.tensors.keys()
    }

    /// Get a sliceable view of a tensor without reading its data
    pub fn get_slice(&self, name: &str) -> Option<TensorSlice<'_>> {
        let info = self.header.tensors.get(name)?;
        let dtype = info.get_dtype()?;
        let begin = self.data_start + info.data_offsets[0];
        let end = self.data_start + info.data_offsets[1];

        Some(TensorSlice {
            name: self.header.tensors.get_key_value(name)?.0.as_str(),
            data: &self.mmap[begin..end],
            shape: info.shape.clone(),
            dtype,
        })
    }
}

/// Sliceable view into a memory-mapped tensor
///
/// Nothing is read until [`TensorSlice::narrow`] or [`TensorSlice::full`]
/// is called, and then only the requested block.
#[derive(Debug)]
pub struct TensorSlice<'a> {
    name: &'a str,
    data: &'a [u8],
    shape: Vec<usize>,
    dtype: TensorDType,
}

impl<'a> TensorSlice<'a> {
    /// Tensor name
    pub fn name(&self) -> &str {
        self.name
    }

    /// Get the tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the tensor dtype
    pub fn dtype(&self) -> TensorDType {
        self.dtype
    }

    /// Read the whole tensor
    pub fn full(&self, device: &Device) -> Result<Tensor> {
        let mut values = Vec::with_capacity(self.shape.iter().product());
        self.decode_into(self.data, &mut values)?;
        Ok(Tensor::from_vec(values, self.shape.clone(), device)?)
    }

    /// Read `len` entries starting at `start` along dimension `dim`
    pub fn narrow(&self, dim: usize, start: usize, len: usize, device: &Device) -> Result<Tensor> {
        if dim >= self.shape.len() {
            return Err(ShardgenError::shape_mismatch(
                self.name,
                &[dim + 1],
                &self.shape,
            ));
        }
        let dim_size = self.shape[dim];
        if start + len > dim_size {
            let mut requested = self.shape.clone();
            requested[dim] = start + len;
            return Err(ShardgenError::shape_mismatch(self.name, &requested, &self.shape));
        }

        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        let elem = self.dtype.size();

        let mut values = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let first = (o * dim_size + start) * inner * elem;
            let last = (o * dim_size + start + len) * inner * elem;
            self.decode_into(&self.data[first..last], &mut values)?;
        }

        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Tensor::from_vec(values, shape, device)?)
    }

    fn decode_into(&self, bytes: &[u8], out: &mut Vec<f32>) -> Result<()> {
        match self.dtype {
            TensorDType::F32 => out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ),
            TensorDType::F16 => out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32()),
            ),
            TensorDType::BF16 => out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32()),
            ),
            TensorDType::F64 => out.extend(bytes.chunks_exact(8).map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw) as f32
            })),
            other => {
                return Err(ShardgenError::weight_file(format!(
                    "{}: dtype {:?} cannot be loaded as a parameter",
                    self.name, other
                )))
            }
        }
        Ok(())
    }
}
