//! Process group bootstrap and collectives
//!
//! A fixed group of `world_size` ranks, with rank 0 as master. Transports
//! implement one primitive, [`ProcessGroup::all_gather_bytes`]; every other
//! collective is built on top of it. All collectives are blocking and must be
//! called by every rank in the same order.

pub mod local;
pub mod tcp;

pub use local::LocalProcessGroup;
pub use tcp::TcpProcessGroup;

use candle_core::{DType, Device, Tensor};
use prost::Message;
use shardgen_common::config::DistributedConfig;
use shardgen_common::{Result, ShardgenError};
use shardgen_proto::TensorFrame;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Position of this process within the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: usize,
}

impl ShardSpec {
    /// Create a new shard spec
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ShardgenError::config(format!(
                "rank {} is outside world of size {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Single-process group
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Whether this is rank 0
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Whether more than one rank holds parameters
    pub fn is_sharded(&self) -> bool {
        self.world_size > 1
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.world_size)
    }
}

/// Blocking collective communication between ranks
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// This rank
    fn rank(&self) -> usize;

    /// Number of ranks
    fn world_size(&self) -> usize;

    /// How long a collective waits for the slowest rank
    fn timeout(&self) -> Duration;

    /// Every rank contributes `payload` and receives all payloads in rank order
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Rank and world size
    fn spec(&self) -> ShardSpec {
        ShardSpec {
            rank: self.rank(),
            world_size: self.world_size(),
        }
    }

    /// Whether this is rank 0
    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank reaches this point
    fn barrier(&self) -> Result<()> {
        self.all_gather_bytes(Vec::new()).map(|_| ())
    }

    /// Concatenate every rank's tensor along `dim`, in rank order
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        if self.world_size() == 1 {
            return Ok(tensor.clone());
        }

        let parts = self.exchange_tensors(tensor)?;
        let expected = tensor.dims();
        for part in &parts {
            if part.dims() != expected {
                return Err(ShardgenError::shape_mismatch("all_gather", expected, part.dims()));
            }
        }

        let gathered = Tensor::cat(&parts, dim)?;
        Ok(gathered.to_dtype(tensor.dtype())?)
    }

    /// Element-wise sum of every rank's tensor
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size() == 1 {
            return Ok(tensor.clone());
        }

        let parts = self.exchange_tensors(tensor)?;
        let mut sum = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
        for part in &parts {
            if part.dims() != tensor.dims() {
                return Err(ShardgenError::shape_mismatch(
                    "all_reduce_sum",
                    tensor.dims(),
                    part.dims(),
                ));
            }
            sum = (sum + part)?;
        }
        Ok(sum.to_dtype(tensor.dtype())?)
    }

    /// Deliver `root`'s payload to every rank
    ///
    /// Non-root ranks may pass an empty payload.
    fn broadcast_bytes(&self, root: usize, payload: Vec<u8>) -> Result<Vec<u8>> {
        if root >= self.world_size() {
            return Err(ShardgenError::collective(format!(
                "broadcast root {} outside world of size {}",
                root,
                self.world_size()
            )));
        }
        if self.world_size() == 1 {
            return Ok(payload);
        }

        let payload = if self.rank() == root { payload } else { Vec::new() };
        let mut payloads = self.all_gather_bytes(payload)?;
        if payloads.len() != self.world_size() {
            return Err(ShardgenError::desync(format!(
                "expected {} payloads, received {}",
                self.world_size(),
                payloads.len()
            )));
        }
        Ok(payloads.swap_remove(root))
    }

    #[doc(hidden)]
    fn exchange_tensors(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        let payload = encode_tensor(tensor)?;
        self.all_gather_bytes(payload)?
            .iter()
            .map(|bytes| decode_tensor(bytes, tensor.device()))
            .collect()
    }
}

/// Encode a tensor as a [`TensorFrame`]
pub fn encode_tensor(tensor: &Tensor) -> Result<Vec<u8>> {
    let frame = TensorFrame {
        shape: tensor.dims().iter().map(|&d| d as u64).collect(),
        data: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
    };
    Ok(frame.encode_to_vec())
}

/// Decode a [`TensorFrame`] into an f32 tensor on `device`
pub fn decode_tensor(bytes: &[u8], device: &Device) -> Result<Tensor> {
    let frame = TensorFrame::decode(bytes)?;
    let shape: Vec<usize> = frame.shape.iter().map(|&d| d as usize).collect();
    Ok(Tensor::from_vec(frame.data, shape, device)?)
}

/// Establish the process group described by `config`
///
/// A world of one needs no transport; larger worlds rendezvous over TCP at
/// `master_addr:master_port`.
pub fn initialize_distributed(config: &DistributedConfig) -> Result<Arc<dyn ProcessGroup>> {
    let spec = ShardSpec::new(config.rank, config.world_size)?;

    let group: Arc<dyn ProcessGroup> = if spec.is_sharded() {
        Arc::new(TcpProcessGroup::connect(config)?)
    } else {
        Arc::new(LocalProcessGroup::single())
    };

    info!(
        rank = spec.rank,
        world_size = spec.world_size,
        "Process group initialized"
    );
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_spec() {
        assert!(ShardSpec::new(2, 2).is_err());
        assert!(ShardSpec::new(0, 0).is_err());

        let spec = ShardSpec::new(1, 4).unwrap();
        assert!(!spec.is_master());
        assert!(spec.is_sharded());
        assert_eq!(spec.to_string(), "rank 1/4");
        assert!(!ShardSpec::single().is_sharded());
    }

    #[test]
    fn test_tensor_frame_round_trip() {
        let tensor = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let bytes = encode_tensor(&tensor).unwrap();
        let decoded = decode_tensor(&bytes, &Device::Cpu).unwrap();
        assert_eq!(decoded.to_vec2::<f32>().unwrap(), tensor.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_single_rank_collectives_are_identity() {
        let group = LocalProcessGroup::single();
        let tensor = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();

        group.barrier().unwrap();
        let gathered = group.all_gather(&tensor, 0).unwrap();
        assert_eq!(gathered.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(group.broadcast_bytes(0, vec![9]).unwrap(), vec![9]);
    }
}
