//! Sharded weight loading
//!
//! Loading is a two-phase protocol. A model first declares every parameter it
//! needs in a [`ParameterStore`] (name, full logical shape, partition role).
//! [`load_weights`] then walks the weight files and fills each placeholder
//! exactly once with this rank's shard, decided by [`partition_for`].

use crate::distributed::{ProcessGroup, ShardSpec};
use crate::tensor::{SafeTensorBuffer, TensorSlice};
use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use shardgen_common::{Result, ShardgenError};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// How a parameter is distributed across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// Output dimension split across ranks
    ColumnParallel,
    /// Input dimension split across ranks; output is summed by an all-reduce
    RowParallel,
    /// Vocabulary split across ranks
    EmbeddingParallel,
    /// Every rank holds the whole tensor
    Replicated,
}

/// This rank's share of one tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// The whole tensor
    Full,
    /// A contiguous block of dimension 0
    Dim0(Range<usize>),
    /// A contiguous block of dimension 1
    Dim1(Range<usize>),
    /// A zero tensor of the full shape
    Zeros,
}

impl Partition {
    /// Shape of the local shard of a tensor of shape `full`
    pub fn local_shape(&self, full: &[usize]) -> Vec<usize> {
        let mut shape = full.to_vec();
        match self {
            Partition::Dim0(range) => shape[0] = range.len(),
            Partition::Dim1(range) => shape[1] = range.len(),
            Partition::Full | Partition::Zeros => {}
        }
        shape
    }

    /// Read this shard from `slice` into fresh storage on `device`
    pub fn apply(&self, slice: &TensorSlice<'_>, device: &Device) -> Result<Tensor> {
        match self {
            Partition::Full => slice.full(device),
            Partition::Dim0(range) => slice.narrow(0, range.start, range.len(), device),
            Partition::Dim1(range) => slice.narrow(1, range.start, range.len(), device),
            Partition::Zeros => Ok(Tensor::zeros(slice.shape(), DType::F32, device)?),
        }
    }
}

fn block(name: &str, shape: &[usize], dim: usize, spec: ShardSpec) -> Result<Range<usize>> {
    let size = *shape.get(dim).ok_or_else(|| {
        ShardgenError::weight_file(format!(
            "{}: cannot split dimension {} of a tensor with shape {:?}",
            name, dim, shape
        ))
    })?;
    if size % spec.world_size != 0 {
        return Err(ShardgenError::weight_file(format!(
            "{}: dimension {} of size {} is not divisible by world size {}",
            name, dim, size, spec.world_size
        )));
    }

    let block_size = size / spec.world_size;
    let start = spec.rank * block_size;
    Ok(start..start + block_size)
}

/// Decide which part of tensor `name` this rank loads
///
/// Pure function of its inputs, so every rank reaches the same decision for
/// the same tensor without communicating.
pub fn partition_for(
    name: &str,
    role: PartitionRole,
    shape: &[usize],
    spec: ShardSpec,
) -> Result<Partition> {
    if !spec.is_sharded() {
        return Ok(Partition::Full);
    }

    let is_bias = name.ends_with(".bias");
    match role {
        PartitionRole::Replicated => Ok(Partition::Full),
        PartitionRole::ColumnParallel | PartitionRole::EmbeddingParallel => {
            Ok(Partition::Dim0(block(name, shape, 0, spec)?))
        }
        // The bias is added once, on rank 0, before the sum over ranks
        PartitionRole::RowParallel if is_bias => Ok(if spec.is_master() {
            Partition::Full
        } else {
            Partition::Zeros
        }),
        PartitionRole::RowParallel => Ok(Partition::Dim1(block(name, shape, 1, spec)?)),
    }
}

#[derive(Debug)]
struct Placeholder {
    role: PartitionRole,
    local_shape: Vec<usize>,
    value: Option<Tensor>,
}

/// Placeholder store filled by the loader
#[derive(Debug)]
pub struct ParameterStore {
    spec: ShardSpec,
    device: Device,
    dtype: DType,
    placeholders: BTreeMap<String, Placeholder>,
    buffers: HashMap<String, Tensor>,
}

impl ParameterStore {
    /// Create an empty store for one rank
    pub fn new(spec: ShardSpec, device: Device, dtype: DType) -> Self {
        Self {
            spec,
            device,
            dtype,
            placeholders: BTreeMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Rank and world size the store is loaded for
    pub fn spec(&self) -> ShardSpec {
        self.spec
    }

    /// Target device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Declare a parameter by its full (unsharded) shape
    pub fn declare(&mut self, name: impl Into<String>, shape: &[usize], role: PartitionRole) -> Result<()> {
        let name = name.into();
        let local_shape = partition_for(&name, role, shape, self.spec)?.local_shape(shape);
        if self.placeholders.contains_key(&name) {
            return Err(ShardgenError::internal(format!(
                "parameter {} declared twice",
                name
            )));
        }
        self.placeholders.insert(
            name,
            Placeholder {
                role,
                local_shape,
                value: None,
            },
        );
        Ok(())
    }

    /// Role a declared parameter was given
    pub fn role(&self, name: &str) -> Option<PartitionRole> {
        self.placeholders.get(name).map(|p| p.role)
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.placeholders.len()
    }

    /// Whether nothing has been declared
    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty()
    }

    /// Fill a declared placeholder with its local shard
    pub fn fill(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let dtype = self.dtype;
        let placeholder = self
            .placeholders
            .get_mut(name)
            .ok_or_else(|| ShardgenError::internal(format!("parameter {} was not declared", name)))?;

        if placeholder.value.is_some() {
            return Err(ShardgenError::DuplicateParameter(name.to_string()));
        }
        if tensor.dims() != placeholder.local_shape.as_slice() {
            return Err(ShardgenError::shape_mismatch(
                name,
                &placeholder.local_shape,
                tensor.dims(),
            ));
        }

        placeholder.value = Some(tensor.to_dtype(dtype)?.contiguous()?);
        Ok(())
    }

    /// Keep a file tensor that no placeholder asked for
    pub fn add_buffer(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let tensor = tensor.to_dtype(self.dtype)?;
        if self.buffers.insert(name.to_string(), tensor).is_some() {
            return Err(ShardgenError::DuplicateParameter(name.to_string()));
        }
        Ok(())
    }

    /// Close the store; every placeholder must have been filled
    pub fn finish(self) -> Result<Parameters> {
        let mut tensors = HashMap::with_capacity(self.placeholders.len());
        for (name, placeholder) in self.placeholders {
            let value = placeholder
                .value
                .ok_or_else(|| ShardgenError::MissingParameter(name.clone()))?;
            tensors.insert(name, value);
        }

        Ok(Parameters {
            tensors,
            buffers: self.buffers,
        })
    }
}

/// Loaded rank-local parameters
#[derive(Debug, Default)]
pub struct Parameters {
    tensors: HashMap<String, Tensor>,
    buffers: HashMap<String, Tensor>,
}

impl Parameters {
    /// Get a declared parameter
    pub fn get(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ShardgenError::MissingParameter(name.to_string()))
    }

    /// Get a file tensor that was not declared
    pub fn buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers.get(name)
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether there are no parameters
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

enum Loaded {
    Parameter(String, Tensor),
    Buffer(String, Tensor),
    Skipped,
}

fn load_file(store: &ParameterStore, buffer: &SafeTensorBuffer) -> Result<Vec<Loaded>> {
    let names: Vec<&String> = buffer.tensor_names().collect();

    names
        .par_iter()
        .map(|name| {
            let slice = buffer
                .get_slice(name)
                .ok_or_else(|| ShardgenError::weight_file(format!("{}: unreadable tensor", name)))?;

            match store.role(name) {
                Some(role) => {
                    let partition = partition_for(name, role, slice.shape(), store.spec())?;
                    let tensor = partition.apply(&slice, store.device())?;
                    Ok(Loaded::Parameter(name.to_string(), tensor))
                }
                None if !slice.dtype().is_float() => {
                    debug!(tensor = %name, dtype = ?slice.dtype(), "Skipping non-float buffer");
                    Ok(Loaded::Skipped)
                }
                None => Ok(Loaded::Buffer(name.to_string(), slice.full(store.device())?)),
            }
        })
        .collect()
}

/// Fill `store` from `files` on this rank
///
/// Files are processed in order; tensors within a file are sliced in
/// parallel. A barrier brackets the whole phase so that no rank starts
/// serving before every rank has loaded.
pub fn load_weights(store: &mut ParameterStore, files: &[PathBuf], group: &dyn ProcessGroup) -> Result<()> {
    let started = Instant::now();
    group.barrier()?;

    let mut parameters = 0;
    let mut buffers = 0;
    for path in files {
        let buffer = SafeTensorBuffer::open(path)?;
        let loaded = load_file(store, &buffer)?;
        debug!(file = %path.display(), tensors = loaded.len(), "Loaded weight file");

        for item in loaded {
            match item {
                Loaded::Parameter(name, tensor) => {
                    store.fill(&name, tensor)?;
                    parameters += 1;
                }
                Loaded::Buffer(name, tensor) => {
                    store.add_buffer(&name, tensor)?;
                    buffers += 1;
                }
                Loaded::Skipped => {}
            }
        }
    }

    group.barrier()?;
    if group.is_master() {
        info!(
            files = files.len(),
            parameters,
            buffers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Weights loaded on all ranks"
        );
    }
    Ok(())
}

/// Directory holding `config.json`, the tokenizer and the weight files
///
/// `model_id` is either a local directory or a hub id resolved through the
/// Hugging Face cache (`models--org--name/snapshots/<commit>`).
pub fn resolve_model_dir(model_id: &str, revision: Option<&str>) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }

    let cache = hub_cache_dir().ok_or_else(|| {
        ShardgenError::weight_file(format!(
            "{} is not a directory and no Hugging Face cache was found",
            model_id
        ))
    })?;
    let repo = cache.join(format!("models--{}", model_id.replace('/', "--")));
    let revision = revision.unwrap_or("main");

    // Branch and tag names resolve to a commit through refs/
    let commit = match std::fs::read_to_string(repo.join("refs").join(revision)) {
        Ok(commit) => commit.trim().to_string(),
        Err(_) => revision.to_string(),
    };

    let snapshot = repo.join("snapshots").join(&commit);
    if !snapshot.is_dir() {
        return Err(ShardgenError::weight_file(format!(
            "{} at revision {} is not in the cache ({})",
            model_id,
            revision,
            snapshot.display()
        )));
    }
    Ok(snapshot)
}

fn hub_cache_dir() -> Option<PathBuf> {
    if let Ok(cache) = std::env::var("HUGGINGFACE_HUB_CACHE") {
        return Some(PathBuf::from(cache));
    }
    if let Ok(home) = std::env::var("HF_HOME") {
        return Some(PathBuf::from(home).join("hub"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".cache").join("huggingface").join("hub"))
}

/// Safetensors files in `dir`, in path order
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(ShardgenError::weight_file(format!(
            "no .safetensors files in {}",
            dir.display()
        )));
    }
    Ok(files)
}
