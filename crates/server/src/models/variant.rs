//! Model variant selection
//!
//! A closed registry mapping `(model_id, model_type, sharded, quantize,
//! capability)` to one concrete variant. Anything outside the registry is an
//! explicit `Unsupported` error.

use shardgen_common::{Result, ShardgenError};
use std::fmt;
use tracing::warn;

/// Attention implementation available to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Standard,
    FlashOptimized,
}

impl Capability {
    /// Resolve once at process start
    ///
    /// Flash variants are used when `FLASH_ATTENTION=1` and an accelerator
    /// is present. Asking for them without one degrades to `Standard`.
    pub fn probe() -> Self {
        let requested = std::env::var("FLASH_ATTENTION")
            .map(|value| value.trim() == "1")
            .unwrap_or(false);
        Self::resolve(requested, candle_core::utils::cuda_is_available())
    }

    /// Decide from explicit inputs
    pub fn resolve(requested: bool, accelerator: bool) -> Self {
        match (requested, accelerator) {
            (true, true) => Capability::FlashOptimized,
            (true, false) => {
                warn!("FLASH_ATTENTION=1 but no accelerator is available, using standard attention");
                Capability::Standard
            }
            (false, _) => Capability::Standard,
        }
    }

    fn is_flash(&self) -> bool {
        matches!(self, Capability::FlashOptimized)
    }
}

/// Batch representation a variant consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Left-padded decoder-only batches
    Causal,
    /// Packed decoder-only batches
    FlashCausal,
    /// Encoder-decoder batches
    Seq2Seq,
}

/// Concrete model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    Galactica,
    GalacticaSharded,
    SantaCoder,
    FlashSantacoder,
    Bloom,
    BloomSharded,
    CausalLm,
    GptNeoxSharded,
    FlashNeoX,
    FlashNeoXSharded,
    Seq2SeqLm,
    T5Sharded,
}

impl ModelVariant {
    /// Batch kind this variant consumes
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelVariant::FlashSantacoder | ModelVariant::FlashNeoX | ModelVariant::FlashNeoXSharded => {
                ModelKind::FlashCausal
            }
            ModelVariant::Seq2SeqLm | ModelVariant::T5Sharded => ModelKind::Seq2Seq,
            _ => ModelKind::Causal,
        }
    }

    /// Whether parameters are split across ranks
    pub fn is_sharded(&self) -> bool {
        matches!(
            self,
            ModelVariant::GalacticaSharded
                | ModelVariant::BloomSharded
                | ModelVariant::GptNeoxSharded
                | ModelVariant::FlashNeoXSharded
                | ModelVariant::T5Sharded
        )
    }

    /// Whether this is a flash-attention variant
    pub fn is_flash(&self) -> bool {
        self.kind() == ModelKind::FlashCausal
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decoder-only families served by the generic causal variant
const GENERIC_CAUSAL_TYPES: &[&str] = &[
    "gpt2",
    "gpt_neo",
    "gptj",
    "gpt_bigcode",
    "codegen",
    "opt",
    "llama",
    "bloom",
    "gpt_neox",
];

/// Encoder-decoder families served by the generic seq2seq variant
const GENERIC_SEQ2SEQ_TYPES: &[&str] = &[
    "t5",
    "mt5",
    "bart",
    "mbart",
    "marian",
    "pegasus",
    "blenderbot",
    "led",
];

/// Select the variant for a model
///
/// `model_type` is only consulted when the id is not special-cased, so ids
/// like galactica or santacoder never need their configuration read.
pub fn select_variant<F>(
    model_id: &str,
    sharded: bool,
    quantize: bool,
    capability: Capability,
    model_type: F,
) -> Result<ModelVariant>
where
    F: FnOnce() -> Result<String>,
{
    let variant = select_family(model_id, sharded, capability, model_type)?;

    if quantize && variant.is_flash() {
        return Err(ShardgenError::unsupported(format!(
            "{} does not support quantization",
            variant
        )));
    }
    Ok(variant)
}

fn select_family<F>(model_id: &str, sharded: bool, capability: Capability, model_type: F) -> Result<ModelVariant>
where
    F: FnOnce() -> Result<String>,
{
    if model_id.contains("facebook/galactica") {
        return Ok(if sharded {
            ModelVariant::GalacticaSharded
        } else {
            ModelVariant::Galactica
        });
    }

    if model_id.contains("santacoder") {
        if sharded {
            return Err(ShardgenError::unsupported("sharded is not supported for SantaCoder"));
        }
        return Ok(if capability.is_flash() {
            ModelVariant::FlashSantacoder
        } else {
            ModelVariant::SantaCoder
        });
    }

    let model_type = model_type()?;
    match (model_type.as_str(), sharded, capability.is_flash()) {
        ("bloom", true, _) => return Ok(ModelVariant::BloomSharded),
        ("bloom", false, _) => return Ok(ModelVariant::Bloom),
        ("gpt_neox", true, true) => return Ok(ModelVariant::FlashNeoXSharded),
        ("gpt_neox", true, false) => return Ok(ModelVariant::GptNeoxSharded),
        ("gpt_neox", false, true) => return Ok(ModelVariant::FlashNeoX),
        ("gpt_neox", false, false) => return Ok(ModelVariant::CausalLm),
        ("t5", true, _) => return Ok(ModelVariant::T5Sharded),
        ("t5", false, _) => return Ok(ModelVariant::Seq2SeqLm),
        _ => {}
    }

    if sharded {
        return Err(ShardgenError::unsupported(format!(
            "sharded is not supported for model type {}",
            model_type
        )));
    }

    if GENERIC_CAUSAL_TYPES.contains(&model_type.as_str()) {
        Ok(ModelVariant::CausalLm)
    } else if GENERIC_SEQ2SEQ_TYPES.contains(&model_type.as_str()) {
        Ok(ModelVariant::Seq2SeqLm)
    } else {
        Err(ShardgenError::unsupported(format!(
            "Unsupported model type {}",
            model_type
        )))
    }
}
