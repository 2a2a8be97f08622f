//! In-process process group
//!
//! Ranks run as threads of one process and meet at a shared rendezvous.
//! Used for single-rank deployments and to exercise sharded code paths in
//! tests without sockets.

use super::ProcessGroup;
use parking_lot::{Condvar, Mutex};
use shardgen_common::{Result, ShardgenError, METRICS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default bound on how long a rank waits for its peers
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Round {
    /// Completed collectives
    generation: u64,

    /// Contributions for the current collective
    slots: Vec<Option<Vec<u8>>>,

    /// Ranks that contributed to the current collective
    arrived: usize,

    /// Result of the last completed collective
    result: Arc<Vec<Vec<u8>>>,
}

#[derive(Debug)]
struct Rendezvous {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    completed: Condvar,
}

/// Process group whose ranks are threads sharing a rendezvous
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    rendezvous: Arc<Rendezvous>,
}

impl LocalProcessGroup {
    /// Create the handles for every rank of a new group
    pub fn new_group(world_size: usize) -> Vec<LocalProcessGroup> {
        Self::with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    /// Create a group whose collectives give up after `timeout`
    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<LocalProcessGroup> {
        let world_size = world_size.max(1);
        let rendezvous = Arc::new(Rendezvous {
            world_size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                slots: vec![None; world_size],
                arrived: 0,
                result: Arc::new(Vec::new()),
            }),
            completed: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalProcessGroup {
                rank,
                rendezvous: Arc::clone(&rendezvous),
            })
            .collect()
    }

    /// Group of one
    pub fn single() -> LocalProcessGroup {
        let mut group = Self::new_group(1);
        group.swap_remove(0)
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size
    }

    fn timeout(&self) -> Duration {
        self.rendezvous.timeout
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        METRICS.shard.collectives_total.inc();
        let rendezvous = &self.rendezvous;
        if rendezvous.world_size == 1 {
            return Ok(vec![payload]);
        }

        let mut round = rendezvous.round.lock();
        let generation = round.generation;

        if round.slots[self.rank].is_some() {
            return Err(ShardgenError::desync(format!(
                "rank {} entered collective {} twice",
                self.rank, generation
            )));
        }
        round.slots[self.rank] = Some(payload);
        round.arrived += 1;

        if round.arrived == rendezvous.world_size {
            let payloads: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            round.result = Arc::new(payloads);
            round.arrived = 0;
            round.generation += 1;
            rendezvous.completed.notify_all();

            trace!(rank = self.rank, generation, "Collective completed");
            return Ok(round.result.as_ref().clone());
        }

        let deadline = Instant::now() + rendezvous.timeout;
        while round.generation == generation {
            let timed_out = rendezvous
                .completed
                .wait_until(&mut round, deadline)
                .timed_out();
            if timed_out && round.generation == generation {
                return Err(ShardgenError::desync(format!(
                    "rank {} timed out after {:?} waiting for {} of {} ranks at collective {}",
                    self.rank,
                    rendezvous.timeout,
                    rendezvous.world_size - round.arrived,
                    rendezvous.world_size,
                    generation
                )));
            }
        }

        Ok(round.result.as_ref().clone())
    }
}
