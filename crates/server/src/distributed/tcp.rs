//! TCP process group
//!
//! Star topology: rank 0 listens on `master_addr:master_port`, every other
//! rank connects to it. A collective is one round trip: each peer sends its
//! [`CollectiveFrame`], rank 0 answers with the [`GatheredFrame`]. Frames are
//! prost messages behind a `u32` length prefix, and carry the collective's
//! sequence number so that ranks drifting apart are detected instead of
//! exchanging mismatched data.

use super::ProcessGroup;
use parking_lot::Mutex;
use prost::Message;
use shardgen_common::config::DistributedConfig;
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto::{CollectiveFrame, GatheredFrame};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, trace};

/// Largest frame accepted from a peer
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Pause between connection attempts to rank 0
const CONNECT_RETRY: Duration = Duration::from_millis(200);

enum Links {
    /// Rank 0: one stream per peer, indexed by `rank - 1`
    Root(Vec<TcpStream>),
    /// Other ranks: the stream to rank 0
    Peer(TcpStream),
}

struct State {
    links: Links,
    sequence: u64,
}

/// Process group over TCP
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    runtime: Runtime,
    state: Mutex<State>,
}

impl fmt::Debug for TcpProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TcpProcessGroup {
    /// Rendezvous with the other ranks
    ///
    /// Blocks until every rank has joined or the configured timeout expires.
    pub fn connect(config: &DistributedConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let address = format!("{}:{}", config.master_addr, config.master_port);
        let timeout = config.timeout();
        let rank = config.rank;
        let world_size = config.world_size;

        let links = runtime.block_on(async {
            let rendezvous = async {
                if rank == 0 {
                    accept_peers(&address, world_size).await
                } else {
                    connect_to_root(&address, rank).await
                }
            };
            tokio::time::timeout(timeout, rendezvous).await.map_err(|_| {
                ShardgenError::desync(format!(
                    "rank {} could not rendezvous at {} within {:?}",
                    rank, address, timeout
                ))
            })?
        })?;

        info!(rank, world_size, %address, "Joined TCP process group");

        Ok(Self {
            rank,
            world_size,
            timeout,
            runtime,
            state: Mutex::new(State { links, sequence: 0 }),
        })
    }
}

async fn accept_peers(address: &str, world_size: usize) -> Result<Links> {
    let listener = TcpListener::bind(address).await?;
    debug!(%address, "Waiting for {} peers", world_size - 1);

    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < world_size - 1 {
        let (mut stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let hello: CollectiveFrame = read_frame(&mut stream).await?;
        let rank = hello.rank as usize;
        if rank == 0 || rank >= world_size {
            return Err(ShardgenError::collective(format!(
                "peer {} announced rank {} outside world of size {}",
                peer, rank, world_size
            )));
        }
        if slots[rank - 1].is_some() {
            return Err(ShardgenError::collective(format!(
                "rank {} joined twice (second from {})",
                rank, peer
            )));
        }

        debug!(rank, %peer, "Peer joined");
        slots[rank - 1] = Some(stream);
        joined += 1;
    }

    Ok(Links::Root(slots.into_iter().flatten().collect()))
}

async fn connect_to_root(address: &str, rank: usize) -> Result<Links> {
    let started = Instant::now();
    let mut stream = loop {
        match TcpStream::connect(address).await {
            Ok(stream) => break stream,
            Err(e) => {
                trace!(rank, %address, error = %e, elapsed = ?started.elapsed(), "Rank 0 not reachable yet");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    };
    stream.set_nodelay(true)?;

    let hello = CollectiveFrame {
        sequence: 0,
        rank: rank as u32,
        payload: Vec::new(),
    };
    write_frame(&mut stream, &hello).await?;
    Ok(Links::Peer(stream))
}

async fn write_frame<M: Message>(stream: &mut TcpStream, message: &M) -> Result<()> {
    let bytes = message.encode_to_vec();
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<M: Message + Default>(stream: &mut TcpStream) -> Result<M> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ShardgenError::collective(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;
    Ok(M::decode(bytes.as_slice())?)
}

impl TcpProcessGroup {
    async fn gather_at_root(
        peers: &mut [TcpStream],
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>> {
        let mut payloads = Vec::with_capacity(peers.len() + 1);
        payloads.push(payload);

        for (index, stream) in peers.iter_mut().enumerate() {
            let rank = index + 1;
            let frame: CollectiveFrame = read_frame(stream).await?;
            if frame.sequence != sequence || frame.rank as usize != rank {
                return Err(ShardgenError::desync(format!(
                    "rank 0 at collective {} received collective {} from rank {} (expected rank {})",
                    sequence, frame.sequence, frame.rank, rank
                )));
            }
            payloads.push(frame.payload);
        }

        let reply = GatheredFrame {
            sequence,
            payloads,
        };
        for stream in peers.iter_mut() {
            write_frame(stream, &reply).await?;
        }
        Ok(reply.payloads)
    }

    async fn gather_at_peer(
        stream: &mut TcpStream,
        rank: usize,
        world_size: usize,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>> {
        let frame = CollectiveFrame {
            sequence,
            rank: rank as u32,
            payload,
        };
        write_frame(stream, &frame).await?;

        let reply: GatheredFrame = read_frame(stream).await?;
        if reply.sequence != sequence || reply.payloads.len() != world_size {
            return Err(ShardgenError::desync(format!(
                "rank {} at collective {} received collective {} with {} payloads",
                rank,
                sequence,
                reply.sequence,
                reply.payloads.len()
            )));
        }
        Ok(reply.payloads)
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        METRICS.shard.collectives_total.inc();

        let mut state = self.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        let (rank, world_size, timeout) = (self.rank, self.world_size, self.timeout);

        let exchange = async {
            match &mut state.links {
                Links::Root(peers) => Self::gather_at_root(peers, sequence, payload).await,
                Links::Peer(stream) => {
                    Self::gather_at_peer(stream, rank, world_size, sequence, payload).await
                }
            }
        };

        self.runtime.block_on(async {
            tokio::time::timeout(timeout, exchange).await.map_err(|_| {
                ShardgenError::desync(format!(
                    "rank {} timed out after {:?} at collective {}",
                    rank, timeout, sequence
                ))
            })?
        })
    }
}
