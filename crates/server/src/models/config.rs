//! Model hyper-parameters read from `config.json`

use serde::{Deserialize, Serialize};
use shardgen_common::{Result, ShardgenError};
use std::path::Path;

fn default_layer_norm_eps() -> f64 {
    1e-5
}

/// Architecture hyper-parameters
///
/// Field aliases cover the spellings used by the supported families.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Declared family, e.g. `gpt_neox`, `bloom`, `t5`
    #[serde(default)]
    pub model_type: String,

    pub vocab_size: usize,

    #[serde(alias = "n_embd", alias = "n_embed", alias = "d_model")]
    pub hidden_size: usize,

    #[serde(alias = "n_head", alias = "num_heads")]
    pub num_attention_heads: usize,

    #[serde(alias = "n_layer", alias = "num_layers")]
    pub num_hidden_layers: usize,

    /// Decoder depth for encoder-decoder models; defaults to the encoder's
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,

    #[serde(default, alias = "n_inner", alias = "d_ff")]
    pub intermediate_size: Option<usize>,

    #[serde(default = "default_layer_norm_eps", alias = "layer_norm_epsilon")]
    pub layer_norm_eps: f64,

    #[serde(default)]
    pub eos_token_id: Option<u32>,

    #[serde(default)]
    pub pad_token_id: Option<u32>,

    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,

    /// Output projection shares the input embedding
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl ModelConfig {
    /// Read `config.json` from a model directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ShardgenError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ModelConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Basic consistency checks
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(ShardgenError::config(
                "vocab_size, hidden_size and num_attention_heads must be positive",
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ShardgenError::config(format!(
                "hidden_size {} is not divisible by {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ShardgenError::config(format!(
                "head dimension {} must be even",
                self.head_dim()
            )));
        }
        Ok(())
    }

    /// Checks required to split this model over `world_size` ranks
    pub fn validate_sharding(&self, world_size: usize) -> Result<()> {
        if self.num_attention_heads % world_size != 0 {
            return Err(ShardgenError::config(format!(
                "{} attention heads cannot be split over {} ranks",
                self.num_attention_heads, world_size
            )));
        }
        if self.intermediate() % world_size != 0 {
            return Err(ShardgenError::config(format!(
                "intermediate size {} cannot be split over {} ranks",
                self.intermediate(),
                world_size
            )));
        }
        Ok(())
    }

    /// Size of one attention head
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// MLP inner size
    pub fn intermediate(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    /// Decoder depth
    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_hidden_layers)
    }

    /// Padding token, falling back to the stop token and then to 0
    pub fn pad_token(&self) -> u32 {
        self.pad_token_id.or(self.eos_token_id).unwrap_or(0)
    }

    /// First decoder input of encoder-decoder models
    pub fn decoder_start_token(&self) -> u32 {
        self.decoder_start_token_id.unwrap_or_else(|| self.pad_token())
    }

    /// Whether the vocabulary can be split evenly over `world_size` ranks
    pub fn splits_vocab(&self, world_size: usize) -> bool {
        world_size > 1 && self.vocab_size % world_size == 0
    }
}
