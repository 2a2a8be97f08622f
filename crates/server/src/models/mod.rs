//! Models served by a shard
//!
//! [`get_model`] resolves the weights, selects a variant, declares the
//! variant's parameters, loads this rank's partition of them and returns a
//! [`Model`] ready for generation steps.

pub mod config;
pub mod layers;
pub mod transformer;
pub mod variant;

pub use config::ModelConfig;
pub use transformer::{CausalTransformer, LayerCache, Seq2SeqTransformer};
pub use variant::{select_variant, Capability, ModelKind, ModelVariant};

use crate::distributed::{ProcessGroup, ShardSpec};
use crate::loader::{load_weights, resolve_model_dir, weight_files, ParameterStore};
use crate::tokenizer::{HfTokenizer, Tokenizer};
use candle_core::{DType, Device};
use layers::LayerContext;
use shardgen_common::config::ModelSettings;
use shardgen_common::{Result, ShardgenError};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Process-wide numeric settings, fixed at start
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub device: Device,
    pub dtype: DType,
    pub quantize: bool,
}

impl RuntimeOptions {
    /// Pick the device for `rank` and the working precision
    ///
    /// Accelerators run in bf16 when reduced precision is allowed; the CPU
    /// always runs in f32.
    pub fn resolve(rank: usize, settings: &ModelSettings) -> Result<Self> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(rank)?
        } else {
            Device::Cpu
        };
        let dtype = if device.is_cuda() && settings.allow_reduced_precision {
            DType::BF16
        } else {
            DType::F32
        };
        Ok(Self {
            device,
            dtype,
            quantize: settings.quantize,
        })
    }

    /// f32 on the CPU
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            quantize: false,
        }
    }
}

/// Loaded network
#[derive(Debug, Clone)]
pub enum Architecture {
    Causal(CausalTransformer),
    Seq2Seq(Seq2SeqTransformer),
}

/// A loaded model on one rank
#[derive(Debug, Clone)]
pub struct Model {
    variant: ModelVariant,
    config: ModelConfig,
    architecture: Architecture,
    tokenizer: Arc<dyn Tokenizer>,
    group: Arc<dyn ProcessGroup>,
    options: RuntimeOptions,
    tp_embeddings: bool,
}

impl Model {
    /// Declare, load and assemble `variant` from the weights in `model_dir`
    pub fn load(
        variant: ModelVariant,
        config: ModelConfig,
        model_dir: &Path,
        tokenizer: Arc<dyn Tokenizer>,
        group: Arc<dyn ProcessGroup>,
        options: RuntimeOptions,
    ) -> Result<Self> {
        let world_size = group.world_size();
        if variant.is_sharded() {
            config.validate_sharding(world_size)?;
        } else if world_size > 1 {
            return Err(ShardgenError::config(format!(
                "{} is not sharded but the process group has {} ranks",
                variant, world_size
            )));
        }

        let tp_embeddings = variant.is_sharded() && config.splits_vocab(world_size);
        let spec = ShardSpec::new(group.rank(), world_size)?;
        let mut store = ParameterStore::new(spec, options.device.clone(), options.dtype);
        match variant.kind() {
            ModelKind::Seq2Seq => Seq2SeqTransformer::declare(&mut store, &config, tp_embeddings)?,
            ModelKind::Causal | ModelKind::FlashCausal => {
                CausalTransformer::declare(&mut store, &config, tp_embeddings)?
            }
        }

        let files = weight_files(model_dir)?;
        load_weights(&mut store, &files, group.as_ref())?;
        let params = store.finish()?;

        let ctx = LayerContext {
            params: &params,
            group: &group,
            quantize: options.quantize,
            local_heads: config.num_attention_heads / world_size,
            head_dim: config.head_dim(),
            layer_norm_eps: config.layer_norm_eps,
        };
        let architecture = match variant.kind() {
            ModelKind::Seq2Seq => Architecture::Seq2Seq(Seq2SeqTransformer::load(&ctx, &config, tp_embeddings)?),
            ModelKind::Causal | ModelKind::FlashCausal => {
                Architecture::Causal(CausalTransformer::load(&ctx, &config, tp_embeddings)?)
            }
        };

        Ok(Self {
            variant,
            config,
            architecture,
            tokenizer,
            group,
            options,
            tp_embeddings,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn kind(&self) -> ModelKind {
        self.variant.kind()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn device(&self) -> &Device {
        &self.options.device
    }

    /// Whether the output head is split along the vocabulary
    pub fn tp_embeddings(&self) -> bool {
        self.tp_embeddings
    }

    /// Decoder-only network
    pub fn causal(&self) -> Result<&CausalTransformer> {
        match &self.architecture {
            Architecture::Causal(network) => Ok(network),
            Architecture::Seq2Seq(_) => Err(ShardgenError::batch_protocol(format!(
                "{} is an encoder-decoder model",
                self.variant
            ))),
        }
    }

    /// Encoder-decoder network
    pub fn seq2seq(&self) -> Result<&Seq2SeqTransformer> {
        match &self.architecture {
            Architecture::Seq2Seq(network) => Ok(network),
            Architecture::Causal(_) => Err(ShardgenError::batch_protocol(format!(
                "{} is a decoder-only model",
                self.variant
            ))),
        }
    }
}

/// Build the model described by `settings` on this rank
pub fn get_model(settings: &ModelSettings, capability: Capability, group: Arc<dyn ProcessGroup>) -> Result<Model> {
    let model_dir = resolve_model_dir(&settings.model_id, settings.revision.as_deref())?;
    let config = ModelConfig::from_dir(&model_dir)?;

    let variant = select_variant(
        &settings.model_id,
        settings.sharded,
        settings.quantize,
        capability,
        || Ok(config.model_type.clone()),
    )?;

    let tokenizer: Arc<dyn Tokenizer> = Arc::new(HfTokenizer::from_file(model_dir.join("tokenizer.json"))?);
    let options = RuntimeOptions::resolve(group.rank(), settings)?;
    if group.is_master() {
        info!(
            model_id = %settings.model_id,
            %variant,
            world_size = group.world_size(),
            dtype = ?options.dtype,
            "Loading model"
        );
    }

    Model::load(variant, config, &model_dir, tokenizer, group, options)
}
