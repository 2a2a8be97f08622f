//! Batch concatenation benchmarks
//!
//! Measures the cost of merging running batches, which sits on the decode
//! path every time new requests are onboarded.

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use shardgen_common::config::ModelSettings;
use shardgen_proto::{Batch as WireBatch, NextTokenChooserParameters, Request, StoppingCriteriaParameters};
use shardgen_server::distributed::LocalProcessGroup;
use shardgen_server::{get_model, Batch, BatchContext, Capability, Model};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const WORDS: [&str; 8] = ["<unk>", "the", "cat", "sat", "on", "a", "mat", "today"];
const HIDDEN: usize = 64;
const LAYERS: usize = 2;

fn insert_linear(tensors: &mut HashMap<String, Tensor>, prefix: &str, out_features: usize, in_features: usize) {
    let weight = Tensor::randn(0f32, 0.1, (out_features, in_features), &Device::Cpu).unwrap();
    let bias = Tensor::zeros(out_features, DType::F32, &Device::Cpu).unwrap();
    tensors.insert(format!("{}.weight", prefix), weight);
    tensors.insert(format!("{}.bias", prefix), bias);
}

fn insert_norm(tensors: &mut HashMap<String, Tensor>, prefix: &str) {
    tensors.insert(format!("{}.weight", prefix), Tensor::ones(HIDDEN, DType::F32, &Device::Cpu).unwrap());
    tensors.insert(format!("{}.bias", prefix), Tensor::zeros(HIDDEN, DType::F32, &Device::Cpu).unwrap());
}

fn write_model(dir: &Path) {
    let mut tensors = HashMap::new();
    tensors.insert(
        "transformer.embed_in.weight".to_string(),
        Tensor::randn(0f32, 0.1, (WORDS.len(), HIDDEN), &Device::Cpu).unwrap(),
    );
    for layer in 0..LAYERS {
        let prefix = format!("transformer.layers.{}", layer);
        insert_norm(&mut tensors, &format!("{}.input_layernorm", prefix));
        insert_linear(&mut tensors, &format!("{}.attention.query_key_value", prefix), 3 * HIDDEN, HIDDEN);
        insert_linear(&mut tensors, &format!("{}.attention.dense", prefix), HIDDEN, HIDDEN);
        insert_norm(&mut tensors, &format!("{}.post_attention_layernorm", prefix));
        insert_linear(&mut tensors, &format!("{}.mlp.dense_h_to_4h", prefix), 4 * HIDDEN, HIDDEN);
        insert_linear(&mut tensors, &format!("{}.mlp.dense_4h_to_h", prefix), HIDDEN, 4 * HIDDEN);
    }
    insert_norm(&mut tensors, "transformer.final_layer_norm");
    tensors.insert(
        "embed_out.weight".to_string(),
        Tensor::randn(0f32, 0.1, (WORDS.len(), HIDDEN), &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();

    let config = serde_json::json!({
        "model_type": "gpt_neox",
        "vocab_size": WORDS.len(),
        "hidden_size": HIDDEN,
        "num_attention_heads": 4,
        "num_hidden_layers": LAYERS,
        "intermediate_size": 4 * HIDDEN,
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let vocab: serde_json::Map<String, serde_json::Value> = WORDS
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

fn create_test_model(dir: &TempDir) -> Model {
    write_model(dir.path());
    let settings = ModelSettings {
        model_id: dir.path().to_string_lossy().into_owned(),
        revision: None,
        sharded: false,
        quantize: false,
        allow_reduced_precision: false,
    };
    get_model(&settings, Capability::Standard, Arc::new(LocalProcessGroup::single())).unwrap()
}

/// A wire batch of `size` prompts whose lengths cycle through 1..=6 words
fn wire_batch(batch_id: u64, first_request: u64, size: usize) -> WireBatch {
    let requests: Vec<Request> = (0..size)
        .map(|i| {
            let length = i % 6 + 1;
            let inputs = WORDS[1..=length].join(" ");
            Request {
                id: first_request + i as u64,
                inputs,
                input_length: length as u32,
                parameters: Some(NextTokenChooserParameters {
                    temperature: 1.0,
                    top_k: 0,
                    top_p: 1.0,
                    do_sample: false,
                    seed: None,
                }),
                stopping_parameters: Some(StoppingCriteriaParameters {
                    max_new_tokens: 64,
                    stop_sequences: vec![],
                }),
            }
        })
        .collect();
    WireBatch {
        id: batch_id,
        size: requests.len() as u32,
        requests,
    }
}

fn benchmark_concatenate_queued(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let model = create_test_model(&dir);
    let ctx = BatchContext::for_model(&model);
    let mut group = c.benchmark_group("concatenate_queued");

    for size in [1usize, 8, 32].iter() {
        let left = wire_batch(0, 0, *size);
        let right = wire_batch(1, *size as u64, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter_batched(
                || {
                    vec![
                        Batch::from_pb(model.kind(), &left, &ctx).unwrap(),
                        Batch::from_pb(model.kind(), &right, &ctx).unwrap(),
                    ]
                },
                |batches| black_box(Batch::concatenate(batches).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_concatenate_prefilled(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let model = create_test_model(&dir);
    let ctx = BatchContext::for_model(&model);
    let mut group = c.benchmark_group("concatenate_prefilled");
    group.sample_size(20);

    let prefill = |wire: &WireBatch| {
        let batch = Batch::from_pb(model.kind(), wire, &ctx).unwrap();
        batch.generate_step(&model).unwrap().batch.unwrap()
    };

    for size in [1usize, 8, 32].iter() {
        let left = wire_batch(0, 0, *size);
        let right = wire_batch(1, *size as u64, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter_batched(
                || vec![prefill(&left), prefill(&right)],
                |batches| black_box(Batch::concatenate(batches).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_concatenate_queued, benchmark_concatenate_prefilled);
criterion_main!(benches);
