//! Tokenizer boundary
//!
//! Batches only need to turn prompts into ids and ids back into text. The
//! production implementation wraps a Hugging Face `tokenizer.json`.

use shardgen_common::{Result, ShardgenError};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Text to token ids and back
pub trait Tokenizer: Send + Sync + fmt::Debug {
    /// Encode a prompt without adding special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Id of a token, if it is in the vocabulary
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

/// Tokenizer backed by the `tokenizers` crate
#[derive(Clone)]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .finish()
    }
}

impl HfTokenizer {
    /// Load `tokenizer.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ShardgenError::tokenizer(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded tokenizer from {:?}", path);
        Ok(Self { inner })
    }

    /// Build from the contents of a `tokenizer.json`
    pub fn from_json(json: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_str(json)
            .map_err(|e| ShardgenError::tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ShardgenError::tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ShardgenError::tokenizer(e.to_string()))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}
