//! Continuous batching scheduler
//!
//! Requests enter a bounded queue from async callers. A dedicated thread
//! owns the [`Engine`]: it prefills a batch from the queue, then decodes it
//! step by step, onboarding newly prefilled batches between steps while the
//! running batch is small. Responses flow back per request on unbounded
//! channels, so a slow client never blocks the batch.

use crate::batch::RequestStatus;
use crate::engine::{Engine, Generations};
use crate::generation::{is_sampling, validate_parameters};
use crate::tokenizer::Tokenizer;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use shardgen_common::config::BatchingConfig;
use shardgen_common::{Result, ShardgenError, METRICS};
use shardgen_proto::{
    self as proto, GeneratedText, Intermediate, NextTokenChooserParameters, Request, StoppingCriteriaParameters,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// One streamed event of a request
#[derive(Debug, Clone)]
pub enum InferStreamResponse {
    /// A token that did not finish the request
    Token(Intermediate),
    /// The final record; nothing follows it
    End(GeneratedText),
}

/// A fully generated request
#[derive(Debug, Clone)]
pub struct InferResponse {
    pub tokens: Vec<Intermediate>,
    pub generated_text: GeneratedText,
}

type ResponseSender = mpsc::UnboundedSender<Result<InferStreamResponse>>;

/// A queued or running request
#[derive(Debug)]
struct Entry {
    request: Request,
    response_tx: ResponseSender,
    queued_at: Instant,
    status: RequestStatus,
    _permit: OwnedSemaphorePermit,
}

/// Front of the batching loop
pub struct Infer {
    sender: Option<Sender<Entry>>,
    tokenizer: Arc<dyn Tokenizer>,
    limit: Arc<Semaphore>,
    next_id: AtomicU64,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Infer {
    /// Start the batching loop on its own thread
    pub fn new(engine: Engine, config: BatchingConfig) -> Result<Self> {
        let tokenizer = Arc::clone(engine.model().tokenizer());
        let (sender, receiver) = channel::bounded(config.max_queue_size);
        let limit = Arc::new(Semaphore::new(config.max_concurrent_requests));

        let handle = std::thread::Builder::new()
            .name("shardgen-batching".to_string())
            .spawn(move || batching_task(engine, receiver, config))?;

        Ok(Self {
            sender: Some(sender),
            tokenizer,
            limit,
            next_id: AtomicU64::new(0),
            handle: Some(handle),
        })
    }

    /// Queue a request and stream its tokens
    ///
    /// A sampled request without a seed gets one here, so every rank samples
    /// the same tokens and the seed is reported back with the result.
    pub fn generate_stream(
        &self,
        inputs: impl Into<String>,
        mut parameters: NextTokenChooserParameters,
        stopping_parameters: StoppingCriteriaParameters,
    ) -> Result<UnboundedReceiverStream<Result<InferStreamResponse>>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        validate_parameters(id, &parameters, &stopping_parameters)?;

        let inputs = inputs.into();
        let input_length = self.tokenizer.encode(&inputs)?.len();
        if input_length == 0 {
            return Err(ShardgenError::invalid_request(id, "prompt encodes to no tokens"));
        }

        if is_sampling(&parameters) && parameters.seed.is_none() {
            parameters.seed = Some(rand::random());
        }

        let permit = Arc::clone(&self.limit)
            .try_acquire_owned()
            .map_err(|_| ShardgenError::queue_full("too many concurrent requests"))?;

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let entry = Entry {
            request: Request {
                id,
                inputs,
                input_length: input_length as u32,
                parameters: Some(parameters),
                stopping_parameters: Some(stopping_parameters),
            },
            response_tx,
            queued_at: Instant::now(),
            status: RequestStatus::Queued,
            _permit: permit,
        };

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ShardgenError::internal("batching loop is shut down"))?;
        match sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(ShardgenError::queue_full("request queue is full")),
            Err(TrySendError::Disconnected(_)) => {
                return Err(ShardgenError::internal("batching loop has stopped"))
            }
        }

        METRICS.inference.requests_total.inc();
        METRICS.inference.queue_depth.inc();
        debug!(request_id = id, input_length, "Request queued");
        Ok(UnboundedReceiverStream::new(response_rx))
    }

    /// Queue a request and wait for its completion
    pub async fn generate(
        &self,
        inputs: impl Into<String>,
        parameters: NextTokenChooserParameters,
        stopping_parameters: StoppingCriteriaParameters,
    ) -> Result<InferResponse> {
        let mut stream = self.generate_stream(inputs, parameters, stopping_parameters)?;

        let mut tokens = Vec::new();
        while let Some(response) = stream.next().await {
            match response? {
                InferStreamResponse::Token(token) => tokens.push(token),
                InferStreamResponse::End(generated_text) => {
                    return Ok(InferResponse { tokens, generated_text })
                }
            }
        }
        Err(ShardgenError::IncompleteGeneration)
    }

    /// Stop accepting requests, drain the loop and release the followers
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        drop(self.sender.take());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ShardgenError::internal("batching thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for Infer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(error = %err, "Batching loop ended with an error");
        }
    }
}

/// The batching loop
///
/// Runs until every sender is dropped, then shuts the engine down.
fn batching_task(mut engine: Engine, receiver: Receiver<Entry>, config: BatchingConfig) -> Result<()> {
    let max_batch_size = config.max_batch_size.max(1);
    let limit_min_batch_size = max_batch_size / 2;
    let mut entries: HashMap<u64, Entry> = HashMap::new();
    let mut next_batch_id = 0u64;
    let keepalive = engine.keepalive_interval();
    info!(max_batch_size, max_waiting_tokens = config.max_waiting_tokens, "Batching loop started");

    let result = 'batching: loop {
        let first = match receiver.recv_timeout(keepalive) {
            Ok(entry) => entry,
            Err(RecvTimeoutError::Timeout) => match engine.keepalive() {
                Ok(()) => continue,
                Err(err) => break Err(err),
            },
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        };
        let Some(batch) = take_batch(&receiver, &mut entries, Some(first), max_batch_size, &mut next_batch_id)
        else {
            continue;
        };

        let mut cached = match prefill(&mut engine, batch, &mut entries) {
            Ok(cached) => cached,
            Err(err) => break Err(err),
        };
        let mut waiting_tokens = 1;

        while let Some(batch) = cached.take() {
            let running = batch.requests.len();
            let mut batches = vec![batch];

            // Onboard new requests while the running batch is small
            if running <= limit_min_batch_size {
                let min_size = if waiting_tokens >= config.max_waiting_tokens {
                    1
                } else {
                    limit_min_batch_size.max(1)
                };
                if receiver.len() >= min_size {
                    let new_batch = take_batch(
                        &receiver,
                        &mut entries,
                        None,
                        max_batch_size - running,
                        &mut next_batch_id,
                    );
                    if let Some(new_batch) = new_batch {
                        match prefill(&mut engine, new_batch, &mut entries) {
                            Ok(Some(new_cached)) => batches.push(new_cached),
                            Ok(None) => {}
                            Err(err) => break 'batching Err(err),
                        }
                        waiting_tokens = 1;
                    }
                }
            }

            let mut running = Vec::with_capacity(batches.len());
            for batch in batches {
                match drop_aborted(&mut engine, batch, &mut entries) {
                    Ok(Some(batch)) => running.push(batch),
                    Ok(None) => {}
                    Err(err) => break 'batching Err(err),
                }
            }
            if running.is_empty() {
                continue;
            }

            cached = match decode(&mut engine, running, &mut entries) {
                Ok(cached) => cached,
                Err(err) => break 'batching Err(err),
            };
            waiting_tokens += 1;
        }
    };

    if let Err(err) = &result {
        error!(error = %err, "Batching loop stopped");
        fail_all(&mut entries, err);
    }
    engine.shutdown()?;
    info!("Batching loop stopped");
    result
}

/// Build a wire batch from `first` and whatever else is queued
fn take_batch(
    receiver: &Receiver<Entry>,
    entries: &mut HashMap<u64, Entry>,
    first: Option<Entry>,
    max_size: usize,
    next_batch_id: &mut u64,
) -> Option<proto::Batch> {
    let mut requests = Vec::new();
    let mut candidates = first.into_iter().chain(std::iter::from_fn(|| receiver.try_recv().ok()));

    while requests.len() < max_size {
        let Some(mut entry) = candidates.next() else {
            break;
        };
        METRICS.inference.queue_depth.dec();

        if entry.response_tx.is_closed() {
            abort(entry);
            continue;
        }
        entry.status = RequestStatus::Prefilling;
        requests.push(entry.request.clone());
        entries.insert(entry.request.id, entry);
    }

    if requests.is_empty() {
        return None;
    }
    let id = *next_batch_id;
    *next_batch_id += 1;
    Some(proto::Batch {
        id,
        size: requests.len() as u32,
        requests,
    })
}

fn prefill(
    engine: &mut Engine,
    batch: proto::Batch,
    entries: &mut HashMap<u64, Entry>,
) -> Result<Option<proto::Batch>> {
    let request_ids = batch.request_ids();
    debug!(batch_id = batch.id, size = request_ids.len(), "Prefilling batch");
    match engine.prefill(batch) {
        Ok(generations) => Ok(send_generations(generations, entries)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(error = %err, "Prefill failed");
            fail_requests(entries, &request_ids, &err);
            Ok(None)
        }
    }
}

fn decode(
    engine: &mut Engine,
    batches: Vec<proto::Batch>,
    entries: &mut HashMap<u64, Entry>,
) -> Result<Option<proto::Batch>> {
    let request_ids: Vec<u64> = batches.iter().flat_map(|b| b.request_ids()).collect();
    match engine.decode(batches) {
        Ok(generations) => Ok(send_generations(generations, entries)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(error = %err, "Decode failed");
            fail_requests(entries, &request_ids, &err);
            Ok(None)
        }
    }
}

/// Remove requests whose clients went away; `None` when none remain
fn drop_aborted(
    engine: &mut Engine,
    mut batch: proto::Batch,
    entries: &mut HashMap<u64, Entry>,
) -> Result<Option<proto::Batch>> {
    batch.requests.retain(|request| {
        let open = entries
            .get(&request.id)
            .is_some_and(|entry| !entry.response_tx.is_closed());
        if !open {
            if let Some(entry) = entries.remove(&request.id) {
                abort(entry);
            }
        }
        open
    });
    batch.size = batch.requests.len() as u32;

    if batch.requests.is_empty() {
        engine.clear(batch.id)?;
        Ok(None)
    } else {
        Ok(Some(batch))
    }
}

fn send_generations(generations: Generations, entries: &mut HashMap<u64, Entry>) -> Option<proto::Batch> {
    for token in generations.intermediates {
        if let Some(entry) = entries.get_mut(&token.request_id) {
            entry.status = RequestStatus::Decoding;
            // A closed receiver is dropped before the next decode
            let _ = entry.response_tx.send(Ok(InferStreamResponse::Token(token)));
        }
    }

    for generated_text in generations.generated_texts {
        let id = generated_text.request.as_ref().map(|r| r.id);
        if let Some(entry) = id.and_then(|id| entries.remove(&id)) {
            METRICS.inference.requests_success.inc();
            METRICS
                .inference
                .request_duration
                .observe(entry.queued_at.elapsed().as_secs_f64());
            let _ = entry.response_tx.send(Ok(InferStreamResponse::End(generated_text)));
        }
    }

    for failed in generations.failed {
        if let Some(entry) = entries.remove(&failed.request_id) {
            METRICS.inference.requests_failed.inc();
            let _ = entry.response_tx.send(Err(failed.error));
        }
    }

    generations.batch
}

fn abort(mut entry: Entry) {
    entry.status = RequestStatus::Aborted;
    METRICS.inference.requests_aborted.inc();
    debug!(request_id = entry.request.id, status = ?entry.status, "Request dropped");
}

fn fail_requests(entries: &mut HashMap<u64, Entry>, request_ids: &[u64], err: &ShardgenError) {
    for id in request_ids {
        if let Some(entry) = entries.remove(id) {
            METRICS.inference.requests_failed.inc();
            let _ = entry
                .response_tx
                .send(Err(ShardgenError::internal(format!("generation failed: {}", err))));
        }
    }
}

fn fail_all(entries: &mut HashMap<u64, Entry>, err: &ShardgenError) {
    let ids: Vec<u64> = entries.keys().copied().collect();
    fail_requests(entries, &ids, err);
}
