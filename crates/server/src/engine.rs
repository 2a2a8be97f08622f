//! Shard engine
//!
//! Owns the model and the batches between steps. On a sharded group rank 0
//! drives: every command is broadcast as a [`StepCommand`] before it runs,
//! and the other ranks replay it from [`Engine::serve_followers`], so every
//! rank issues the same collectives in the same order.

use crate::batch::{Batch, BatchContext};
use crate::models::Model;
use crate::orchestrator::{generate_step, FailedRequest};
use prost::Message;
use shardgen_common::{Result, ShardgenError};
use shardgen_proto::{self as proto, GeneratedText, Intermediate, StepCommand, StepKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Everything one command produced
#[derive(Debug, Default)]
pub struct Generations {
    pub intermediates: Vec<Intermediate>,
    pub generated_texts: Vec<GeneratedText>,
    /// Requests dropped by an error of their own; co-batched requests go on
    pub failed: Vec<FailedRequest>,
    /// Wire identity of the surviving batch, if any request is still running
    pub batch: Option<proto::Batch>,
}

pub struct Engine {
    model: Model,
    ctx: BatchContext,
    cache: HashMap<u64, Batch>,
}

impl Engine {
    pub fn new(model: Model) -> Self {
        let ctx = BatchContext::for_model(&model);
        Self {
            model,
            ctx,
            cache: HashMap::new(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Ids of the batches held between steps
    pub fn cached_batches(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.cache.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Build a batch from `batch` and run its first step
    pub fn prefill(&mut self, batch: proto::Batch) -> Result<Generations> {
        self.replicate(StepKind::Prefill, vec![batch.clone()])?;
        self.run_prefill(&batch)
    }

    /// Advance cached batches by one token
    ///
    /// Each wire batch names a cached batch and the requests to keep. More
    /// than one batch is merged before the step.
    pub fn decode(&mut self, batches: Vec<proto::Batch>) -> Result<Generations> {
        self.replicate(StepKind::Decode, batches.clone())?;
        self.run_decode(&batches)
    }

    /// Drop a cached batch on every rank
    pub fn clear(&mut self, batch_id: u64) -> Result<()> {
        let batch = proto::Batch {
            id: batch_id,
            ..Default::default()
        };
        self.replicate(StepKind::Clear, vec![batch])?;
        self.run_clear(&[batch_id]);
        Ok(())
    }

    /// Tell idle followers that rank 0 is alive
    pub fn keepalive(&mut self) -> Result<()> {
        self.replicate(StepKind::Keepalive, Vec::new())
    }

    /// How often an idle rank 0 broadcasts a keepalive
    pub fn keepalive_interval(&self) -> Duration {
        (self.model.group().timeout() / 3).max(Duration::from_millis(10))
    }

    /// Release every follower and drop all cached state
    pub fn shutdown(&mut self) -> Result<()> {
        self.replicate(StepKind::Shutdown, Vec::new())?;
        self.cache.clear();
        Ok(())
    }

    /// Replay rank 0's commands until it shuts down
    pub fn serve_followers(&mut self) -> Result<()> {
        info!(rank = self.model.group().rank(), "Following rank 0");
        while self.follow_next()? {}
        Ok(())
    }

    /// Wait for rank 0's next command and replay it
    ///
    /// Returns `false` once rank 0 has shut down. Non-fatal step errors are
    /// logged and the follower keeps going.
    pub fn follow_next(&mut self) -> Result<bool> {
        let group = Arc::clone(self.model.group());
        if group.is_master() {
            return Err(ShardgenError::internal("rank 0 drives the engine and cannot follow"));
        }

        let bytes = group.broadcast_bytes(0, Vec::new())?;
        let command = StepCommand::decode(bytes.as_slice())?;
        let result = match command.kind() {
            StepKind::Prefill => match command.batches.first() {
                Some(batch) => self.run_prefill(batch),
                None => Err(ShardgenError::batch_protocol("prefill command without a batch")),
            },
            StepKind::Decode => self.run_decode(&command.batches),
            StepKind::Clear => {
                let ids: Vec<u64> = command.batches.iter().map(|batch| batch.id).collect();
                self.run_clear(&ids);
                Ok(Generations::default())
            }
            StepKind::Keepalive => {
                trace!(rank = group.rank(), "Keepalive");
                Ok(Generations::default())
            }
            StepKind::Shutdown => {
                info!(rank = group.rank(), "Shutdown received");
                self.cache.clear();
                return Ok(false);
            }
        };

        if let Err(err) = result {
            if err.is_fatal() {
                error!(rank = group.rank(), error = %err, "Fatal error while following");
                return Err(err);
            }
            warn!(rank = group.rank(), error = %err, "Step failed");
        }
        Ok(true)
    }

    fn replicate(&self, kind: StepKind, batches: Vec<proto::Batch>) -> Result<()> {
        let group = self.model.group();
        if group.world_size() == 1 {
            return Ok(());
        }
        if !group.is_master() {
            return Err(ShardgenError::internal("only rank 0 issues commands"));
        }

        let mut command = StepCommand { kind: 0, batches };
        command.set_kind(kind);
        group.broadcast_bytes(0, command.encode_to_vec())?;
        Ok(())
    }

    fn run_clear(&mut self, batch_ids: &[u64]) {
        for batch_id in batch_ids {
            if self.cache.remove(batch_id).is_some() {
                debug!(batch_id, "Cleared batch");
            }
        }
    }

    fn run_prefill(&mut self, wire: &proto::Batch) -> Result<Generations> {
        if self.cache.contains_key(&wire.id) {
            return Err(ShardgenError::batch_protocol(format!("batch {} is already cached", wire.id)));
        }
        let batch = Batch::from_pb(self.model.kind(), wire, &self.ctx)?;
        debug!(batch_id = wire.id, size = batch.len(), "Prefill");
        self.step(batch)
    }

    fn run_decode(&mut self, wires: &[proto::Batch]) -> Result<Generations> {
        if wires.is_empty() {
            return Err(ShardgenError::batch_protocol("decode without batches"));
        }

        // Every named batch leaves the cache; on failure none come back
        let mut batches = Vec::with_capacity(wires.len());
        let mut missing = None;
        for wire in wires {
            match self.cache.remove(&wire.id) {
                Some(batch) => batches.push((batch, wire)),
                None => missing = missing.or(Some(wire.id)),
            }
        }
        if let Some(id) = missing {
            return Err(ShardgenError::batch_protocol(format!("batch {} is not cached", id)));
        }

        let batches = batches
            .into_iter()
            .map(|(batch, wire)| {
                if wire.requests.len() < batch.len() {
                    batch.filter(&wire.request_ids())
                } else {
                    Ok(batch)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let batch = if batches.len() > 1 {
            Batch::concatenate(batches)?
        } else {
            batches
                .into_iter()
                .next()
                .ok_or_else(|| ShardgenError::batch_protocol("decode without batches"))?
        };
        debug!(batch_id = batch.id(), size = batch.len(), "Decode");
        self.step(batch)
    }

    fn step(&mut self, batch: Batch) -> Result<Generations> {
        let output = generate_step(&self.model, batch)?;
        let wire = output.batch.map(|batch| {
            let wire = batch.to_pb();
            self.cache.insert(batch.id(), batch);
            wire
        });

        Ok(Generations {
            intermediates: output.intermediates,
            generated_texts: output.generated_texts,
            failed: output.failed,
            batch: wire,
        })
    }
}
