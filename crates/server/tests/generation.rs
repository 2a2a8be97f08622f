//! End-to-end generation over a tiny random checkpoint written to a tempdir

use candle_core::{DType, Device, Tensor};
use shardgen_common::config::{BatchingConfig, ModelSettings};
use shardgen_common::ShardgenError;
use shardgen_proto::{Batch, GeneratedText, NextTokenChooserParameters, Request, StoppingCriteriaParameters};
use shardgen_server::distributed::LocalProcessGroup;
use shardgen_server::{get_model, Capability, Engine, Infer, Model, ModelVariant, ProcessGroup};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const VOCAB: [&str; 16] = [
    "<unk>", "hello", "world", "how", "are", "you", "the", "a", "cat", "dog", "sat", "on", "mat", "and", "ran",
    "far",
];
const HIDDEN: usize = 8;
const INTERMEDIATE: usize = 16;

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 0.5, shape, &Device::Cpu).unwrap()
}

fn linear(tensors: &mut HashMap<String, Tensor>, prefix: &str, out_features: usize, in_features: usize) {
    tensors.insert(format!("{}.weight", prefix), randn(&[out_features, in_features]));
    tensors.insert(format!("{}.bias", prefix), randn(&[out_features]));
}

fn layer_norm(tensors: &mut HashMap<String, Tensor>, prefix: &str) {
    tensors.insert(
        format!("{}.weight", prefix),
        Tensor::ones(HIDDEN, DType::F32, &Device::Cpu).unwrap(),
    );
    tensors.insert(format!("{}.bias", prefix), randn(&[HIDDEN]));
}

fn block(tensors: &mut HashMap<String, Tensor>, prefix: &str, cross: bool) {
    layer_norm(tensors, &format!("{}.input_layernorm", prefix));
    linear(tensors, &format!("{}.attention.query_key_value", prefix), 3 * HIDDEN, HIDDEN);
    linear(tensors, &format!("{}.attention.dense", prefix), HIDDEN, HIDDEN);
    if cross {
        layer_norm(tensors, &format!("{}.cross_attention_layernorm", prefix));
        linear(tensors, &format!("{}.cross_attention.query", prefix), HIDDEN, HIDDEN);
        linear(tensors, &format!("{}.cross_attention.key_value", prefix), 2 * HIDDEN, HIDDEN);
        linear(tensors, &format!("{}.cross_attention.dense", prefix), HIDDEN, HIDDEN);
    }
    layer_norm(tensors, &format!("{}.post_attention_layernorm", prefix));
    linear(tensors, &format!("{}.mlp.dense_h_to_4h", prefix), INTERMEDIATE, HIDDEN);
    linear(tensors, &format!("{}.mlp.dense_4h_to_h", prefix), HIDDEN, INTERMEDIATE);
}

fn write_config(dir: &Path, model_type: &str, vocab_size: usize, eos_token_id: Option<u32>) {
    let config = serde_json::json!({
        "model_type": model_type,
        "vocab_size": vocab_size,
        "hidden_size": HIDDEN,
        "num_attention_heads": 2,
        "num_hidden_layers": 1,
        "intermediate_size": INTERMEDIATE,
        "eos_token_id": eos_token_id,
        "pad_token_id": 0,
        "decoder_start_token_id": 0,
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

fn write_tokenizer(dir: &Path, vocab_size: usize) {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB[..vocab_size]
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), serde_json::json!(id)))
        .collect();
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
}

/// Decoder-only checkpoint
fn causal_checkpoint() -> TempDir {
    causal_checkpoint_with_vocab(VOCAB.len())
}

/// Decoder-only checkpoint over the first `vocab_size` words
fn causal_checkpoint_with_vocab(vocab_size: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut tensors = HashMap::new();
    tensors.insert("transformer.embed_in.weight".to_string(), randn(&[vocab_size, HIDDEN]));
    block(&mut tensors, "transformer.layers.0", false);
    layer_norm(&mut tensors, "transformer.final_layer_norm");
    tensors.insert("embed_out.weight".to_string(), randn(&[vocab_size, HIDDEN]));
    candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

    write_config(dir.path(), "gpt_neox", vocab_size, None);
    write_tokenizer(dir.path(), vocab_size);
    dir
}

/// Encoder-decoder checkpoint
fn seq2seq_checkpoint() -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut tensors = HashMap::new();
    tensors.insert("shared.weight".to_string(), randn(&[VOCAB.len(), HIDDEN]));
    block(&mut tensors, "encoder.layers.0", false);
    layer_norm(&mut tensors, "encoder.final_layer_norm");
    block(&mut tensors, "decoder.layers.0", true);
    layer_norm(&mut tensors, "decoder.final_layer_norm");
    tensors.insert("lm_head.weight".to_string(), randn(&[VOCAB.len(), HIDDEN]));
    candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

    write_config(dir.path(), "t5", VOCAB.len(), None);
    write_tokenizer(dir.path(), VOCAB.len());
    dir
}

fn settings(dir: &Path, sharded: bool, quantize: bool) -> ModelSettings {
    ModelSettings {
        model_id: dir.to_string_lossy().into_owned(),
        revision: None,
        sharded,
        quantize,
        allow_reduced_precision: false,
    }
}

fn load(dir: &Path, capability: Capability) -> Model {
    get_model(&settings(dir, false, false), capability, Arc::new(LocalProcessGroup::single())).unwrap()
}

fn request(id: u64, inputs: &str, max_new_tokens: u32) -> Request {
    Request {
        id,
        inputs: inputs.to_string(),
        input_length: inputs.split_whitespace().count() as u32,
        parameters: Some(greedy()),
        stopping_parameters: Some(stopping(max_new_tokens)),
    }
}

fn greedy() -> NextTokenChooserParameters {
    NextTokenChooserParameters {
        temperature: 1.0,
        top_k: 0,
        top_p: 1.0,
        do_sample: false,
        seed: None,
    }
}

fn stopping(max_new_tokens: u32) -> StoppingCriteriaParameters {
    StoppingCriteriaParameters {
        max_new_tokens,
        stop_sequences: vec![],
    }
}

fn batch(id: u64, requests: Vec<Request>) -> Batch {
    Batch {
        id,
        size: requests.len() as u32,
        requests,
    }
}

fn sampled(seed: Option<u64>) -> NextTokenChooserParameters {
    NextTokenChooserParameters {
        do_sample: true,
        seed,
        ..greedy()
    }
}

/// Load `dir` sharded over `groups`; rank 0 runs `drive`, the others follow
///
/// `drive` owns the engine and must release the followers.
fn with_followers<T, F>(dir: &Path, capability: Capability, groups: Vec<LocalProcessGroup>, drive: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Engine) -> T + Send + 'static,
{
    let mut drive = Some(drive);
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            let settings = settings(dir, true, false);
            let drive = if group.is_master() { drive.take() } else { None };
            thread::spawn(move || {
                let model = get_model(&settings, capability, Arc::new(group)).unwrap();
                let mut engine = Engine::new(model);
                match drive {
                    Some(drive) => Some(drive(engine)),
                    None => {
                        engine.serve_followers().unwrap();
                        None
                    }
                }
            })
        })
        .collect();

    let results: Vec<Option<T>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.into_iter().flatten().next().unwrap()
}

/// Prefill, then decode until every request finished
fn run_to_completion(engine: &mut Engine, wire: Batch) -> HashMap<u64, GeneratedText> {
    let mut finished = HashMap::new();
    let mut generations = engine.prefill(wire).unwrap();
    loop {
        for generated in generations.generated_texts.drain(..) {
            finished.insert(generated.request.as_ref().unwrap().id, generated);
        }
        match generations.batch.take() {
            Some(next) => generations = engine.decode(vec![next]).unwrap(),
            None => return finished,
        }
    }
}

#[test]
fn test_generation_terminates_with_length() {
    let dir = causal_checkpoint();
    let model = load(dir.path(), Capability::Standard);
    assert_eq!(model.variant(), ModelVariant::CausalLm);

    let mut engine = Engine::new(model);
    let generations = engine
        .prefill(batch(0, vec![request(1, "hello world", 3), request(2, "the cat sat", 3)]))
        .unwrap();
    assert_eq!(generations.intermediates.len(), 2);
    assert_eq!(generations.batch.as_ref().unwrap().request_ids(), vec![1, 2]);
    assert_eq!(engine.cached_batches(), vec![0]);

    let finished = run_to_completion(&mut engine, batch(5, vec![request(3, "hello", 3)]));
    let generated = &finished[&3];
    assert_eq!(generated.generated_tokens, 3);
    assert_eq!(generated.token_ids.len(), 3);
    assert_eq!(generated.logprobs.len(), 3);
    assert_eq!(generated.finish_reason, "length");
    assert!(generated.logprobs.iter().all(|&lp| lp <= 0.0));
}

#[test]
fn test_step_terminates_on_stop_token() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let first = run_to_completion(&mut engine, batch(0, vec![request(1, "how are you", 1)]));
    let stop_token = first[&1].token_ids[0];

    // The same prompt now ends on its first token
    write_config(dir.path(), "gpt_neox", VOCAB.len(), Some(stop_token));
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let finished = run_to_completion(&mut engine, batch(0, vec![request(1, "how are you", 8)]));
    assert_eq!(finished[&1].finish_reason, "stop");
    assert_eq!(finished[&1].generated_tokens, 1);
}

#[test]
fn test_padding_invariance() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));

    let alone = run_to_completion(&mut engine, batch(0, vec![request(1, "cat", 4)]));
    let batched = run_to_completion(
        &mut engine,
        batch(1, vec![request(1, "cat", 4), request(2, "the dog ran far and sat on a mat", 4)]),
    );
    assert_eq!(alone[&1].token_ids, batched[&1].token_ids);
}

#[test]
fn test_concatenate_between_steps() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let reference = run_to_completion(
        &mut engine,
        batch(0, vec![request(1, "hello world", 4), request(2, "the cat", 4)]),
    );

    let first = engine.prefill(batch(10, vec![request(1, "hello world", 4)])).unwrap();
    let first = engine.decode(vec![first.batch.unwrap()]).unwrap();
    let second = engine.prefill(batch(11, vec![request(2, "the cat", 4)])).unwrap();

    let merged_wire = vec![first.batch.unwrap(), second.batch.unwrap()];
    let mut generations = engine.decode(merged_wire).unwrap();
    assert_eq!(generations.batch.as_ref().unwrap().request_ids(), vec![1, 2]);
    assert_eq!(engine.cached_batches(), vec![10]);

    let mut finished = HashMap::new();
    loop {
        for generated in generations.generated_texts.drain(..) {
            finished.insert(generated.request.as_ref().unwrap().id, generated);
        }
        match generations.batch.take() {
            Some(next) => generations = engine.decode(vec![next]).unwrap(),
            None => break,
        }
    }
    assert_eq!(finished[&1].token_ids, reference[&1].token_ids);
    assert_eq!(finished[&2].token_ids, reference[&2].token_ids);
}

#[test]
fn test_concatenate_rejects_duplicate_ids() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));

    let a = engine.prefill(batch(1, vec![request(7, "hello", 4)])).unwrap().batch.unwrap();
    let b = engine.prefill(batch(2, vec![request(7, "world", 4)])).unwrap().batch.unwrap();
    let err = engine.decode(vec![a, b]).unwrap_err();
    assert!(matches!(err, ShardgenError::DuplicateRequestId(7)));
    assert!(engine.cached_batches().is_empty());
}

#[test]
fn test_decode_filters_dropped_requests() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));

    let mut wire = engine
        .prefill(batch(0, vec![request(1, "hello", 4), request(2, "the dog ran", 4)]))
        .unwrap()
        .batch
        .unwrap();
    wire.requests.retain(|r| r.id == 2);
    wire.size = 1;

    let generations = engine.decode(vec![wire]).unwrap();
    assert_eq!(generations.intermediates.len(), 1);
    assert_eq!(generations.intermediates[0].request_id, 2);
    assert_eq!(generations.batch.unwrap().request_ids(), vec![2]);
}

#[test]
fn test_packed_matches_padded() {
    let dir = causal_checkpoint();
    let requests = vec![request(1, "hello world", 4), request(2, "the cat sat on a mat", 4)];

    let mut padded = Engine::new(load(dir.path(), Capability::Standard));
    let padded = run_to_completion(&mut padded, batch(0, requests.clone()));

    let model = load(dir.path(), Capability::FlashOptimized);
    assert_eq!(model.variant(), ModelVariant::FlashNeoX);
    let mut packed = Engine::new(model);
    let packed = run_to_completion(&mut packed, batch(0, requests));

    for id in [1, 2] {
        assert_eq!(padded[&id].token_ids, packed[&id].token_ids);
    }
}

fn assert_same_generation(sharded: &HashMap<u64, GeneratedText>, reference: &HashMap<u64, GeneratedText>) {
    assert_eq!(sharded.len(), reference.len());
    for (id, expected) in reference {
        assert_eq!(sharded[id].token_ids, expected.token_ids);
        for (a, b) in sharded[id].logprobs.iter().zip(&expected.logprobs) {
            assert!((a - b).abs() < 1e-4, "logprob {} vs {}", a, b);
        }
    }
}

#[test]
fn test_sharded_matches_unsharded() {
    let dir = causal_checkpoint();
    let requests = vec![request(1, "hello world", 4), request(2, "the dog ran", 4)];

    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let reference = run_to_completion(&mut engine, batch(0, requests.clone()));

    let sharded = with_followers(dir.path(), Capability::Standard, LocalProcessGroup::new_group(2), |mut engine| {
        assert_eq!(engine.model().variant(), ModelVariant::GptNeoxSharded);
        assert!(engine.model().tp_embeddings());
        let finished = run_to_completion(&mut engine, batch(0, requests));
        engine.shutdown().unwrap();
        finished
    });
    assert_same_generation(&sharded, &reference);
}

#[test]
fn test_sharded_uneven_vocab_replicates_head() {
    // 15 rows cannot be split over two ranks
    let dir = causal_checkpoint_with_vocab(15);
    let requests = vec![request(1, "hello world", 4), request(2, "the dog ran", 4)];

    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let reference = run_to_completion(&mut engine, batch(0, requests.clone()));

    let sharded = with_followers(dir.path(), Capability::Standard, LocalProcessGroup::new_group(2), |mut engine| {
        assert_eq!(engine.model().variant(), ModelVariant::GptNeoxSharded);
        assert!(!engine.model().tp_embeddings());
        let finished = run_to_completion(&mut engine, batch(0, requests));
        engine.shutdown().unwrap();
        finished
    });
    assert_same_generation(&sharded, &reference);
}

#[test]
fn test_sharded_flash_matches_unsharded() {
    let dir = causal_checkpoint();
    let requests = vec![request(1, "hello world", 4), request(2, "the cat sat on a mat", 4)];

    let mut engine = Engine::new(load(dir.path(), Capability::FlashOptimized));
    let reference = run_to_completion(&mut engine, batch(0, requests.clone()));

    let sharded = with_followers(
        dir.path(),
        Capability::FlashOptimized,
        LocalProcessGroup::new_group(2),
        |mut engine| {
            assert_eq!(engine.model().variant(), ModelVariant::FlashNeoXSharded);
            assert!(engine.model().tp_embeddings());
            let finished = run_to_completion(&mut engine, batch(0, requests));
            engine.shutdown().unwrap();
            finished
        },
    );
    assert_same_generation(&sharded, &reference);
}

#[test]
fn test_sharded_seq2seq_matches_unsharded() {
    let dir = seq2seq_checkpoint();
    let requests = vec![request(1, "hello", 3), request(2, "the cat sat on the mat", 3)];

    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let reference = run_to_completion(&mut engine, batch(0, requests.clone()));

    let sharded = with_followers(dir.path(), Capability::Standard, LocalProcessGroup::new_group(2), |mut engine| {
        assert_eq!(engine.model().variant(), ModelVariant::T5Sharded);
        let finished = run_to_completion(&mut engine, batch(0, requests));
        engine.shutdown().unwrap();
        finished
    });
    assert_same_generation(&sharded, &reference);
}

#[test]
fn test_clear_reaches_followers() {
    let dir = causal_checkpoint();
    let handles: Vec<_> = LocalProcessGroup::new_group(2)
        .into_iter()
        .map(|group| {
            let settings = settings(dir.path(), true, false);
            thread::spawn(move || {
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let model = get_model(&settings, Capability::Standard, Arc::clone(&group)).unwrap();
                let mut engine = Engine::new(model);
                let mut cached = Vec::new();

                if group.is_master() {
                    engine.prefill(batch(0, vec![request(1, "hello", 4)])).unwrap();
                    engine.prefill(batch(1, vec![request(2, "the cat", 4)])).unwrap();
                    cached.push(engine.cached_batches());
                    engine.clear(0).unwrap();
                    cached.push(engine.cached_batches());
                    engine.shutdown().unwrap();
                } else {
                    assert!(engine.follow_next().unwrap());
                    assert!(engine.follow_next().unwrap());
                    cached.push(engine.cached_batches());
                    assert!(engine.follow_next().unwrap());
                    cached.push(engine.cached_batches());
                    assert!(!engine.follow_next().unwrap());
                }
                cached
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![vec![0, 1], vec![1]]);
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

#[test]
fn test_idle_leader_keeps_followers() {
    let dir = causal_checkpoint();
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let reference = run_to_completion(&mut engine, batch(0, vec![request(0, "hello world", 3)]));

    let groups = LocalProcessGroup::with_timeout(2, Duration::from_millis(300));
    let generated = with_followers(dir.path(), Capability::Standard, groups, |engine| {
        assert!(engine.keepalive_interval() < Duration::from_millis(300));
        let infer = Infer::new(engine, BatchingConfig::default()).unwrap();

        // Idle well past the collective timeout before the first request
        thread::sleep(Duration::from_millis(800));
        let response = block_on(infer.generate("hello world", greedy(), stopping(3))).unwrap();
        infer.shutdown().unwrap();
        response.generated_text
    });
    assert_eq!(generated.token_ids, reference[&0].token_ids);
}

#[test]
fn test_sharded_sampling_shares_seed() {
    let dir = causal_checkpoint();
    let generated = with_followers(dir.path(), Capability::Standard, LocalProcessGroup::new_group(2), |engine| {
        let infer = Infer::new(engine, BatchingConfig::default()).unwrap();
        let response = block_on(infer.generate("the dog ran", sampled(None), stopping(6))).unwrap();
        infer.shutdown().unwrap();
        response.generated_text
    });
    let seed = generated.seed.expect("sampled request reports its seed");

    let mut replay = request(0, "the dog ran", 6);
    replay.parameters = Some(sampled(Some(seed)));
    let mut engine = Engine::new(load(dir.path(), Capability::Standard));
    let single = run_to_completion(&mut engine, batch(0, vec![replay]));
    assert_eq!(generated.token_ids, single[&0].token_ids);
}

#[test]
fn test_quantized_model_generates() {
    let dir = causal_checkpoint();
    let model = get_model(
        &settings(dir.path(), false, true),
        Capability::Standard,
        Arc::new(LocalProcessGroup::single()),
    )
    .unwrap();
    let mut engine = Engine::new(model);
    let finished = run_to_completion(&mut engine, batch(0, vec![request(1, "hello", 2)]));
    assert_eq!(finished[&1].generated_tokens, 2);
}

#[test]
fn test_seq2seq_generation() {
    let dir = seq2seq_checkpoint();
    let model = load(dir.path(), Capability::Standard);
    assert_eq!(model.variant(), ModelVariant::Seq2SeqLm);
    let mut engine = Engine::new(model);

    let alone = run_to_completion(&mut engine, batch(0, vec![request(1, "hello", 3)]));
    assert_eq!(alone[&1].finish_reason, "length");
    assert_eq!(alone[&1].generated_tokens, 3);

    let batched = run_to_completion(
        &mut engine,
        batch(1, vec![request(2, "the cat sat on the mat", 3), request(1, "hello", 3)]),
    );
    assert_eq!(batched[&1].token_ids, alone[&1].token_ids);
}

#[test]
fn test_unsharded_variant_rejects_group() {
    let dir = causal_checkpoint();
    let handles: Vec<_> = LocalProcessGroup::new_group(2)
        .into_iter()
        .map(|group| {
            let settings = settings(dir.path(), false, false);
            thread::spawn(move || get_model(&settings, Capability::Standard, Arc::new(group)).map(|_| ()))
        })
        .collect();
    for handle in handles {
        assert!(matches!(handle.join().unwrap(), Err(ShardgenError::Config(_))));
    }
}

#[tokio::test]
async fn test_infer_generate() {
    let dir = causal_checkpoint();
    let engine = Engine::new(load(dir.path(), Capability::Standard));
    let infer = Infer::new(engine, BatchingConfig::default()).unwrap();

    let (a, b) = tokio::join!(
        infer.generate("hello world", greedy(), stopping(3)),
        infer.generate("the cat sat", greedy(), stopping(5)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.generated_text.generated_tokens, 3);
    assert_eq!(a.tokens.len(), 2);
    assert_eq!(b.generated_text.generated_tokens, 5);
    assert_eq!(b.tokens.len(), 4);

    let invalid = NextTokenChooserParameters {
        temperature: 0.0,
        ..greedy()
    };
    assert!(matches!(
        infer.generate("hello", invalid, stopping(3)).await,
        Err(ShardgenError::InvalidRequest { .. })
    ));
    infer.shutdown().unwrap();
}

#[tokio::test]
async fn test_infer_backpressure() {
    let dir = causal_checkpoint();
    let engine = Engine::new(load(dir.path(), Capability::Standard));
    let config = BatchingConfig {
        max_concurrent_requests: 1,
        ..BatchingConfig::default()
    };
    let infer = Infer::new(engine, config).unwrap();

    let running = infer.generate_stream("hello", greedy(), stopping(200)).unwrap();
    assert!(matches!(
        infer.generate_stream("world", greedy(), stopping(1)),
        Err(ShardgenError::QueueFull(_))
    ));

    drop(running);
    infer.shutdown().unwrap();
}
