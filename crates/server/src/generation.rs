//! Token selection and stopping rules

use crate::tensor::ops::log_softmax_last_dim;
use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};
use shardgen_common::{Result, ShardgenError};
use shardgen_proto::{NextTokenChooserParameters, StoppingCriteriaParameters};
use std::fmt;

/// Why a request stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The stop token was produced
    Stop,
    /// `max_new_tokens` was reached
    Length,
    /// The output ends with one of the stop sequences
    StopSequence,
}

impl FinishReason {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::StopSequence => "stop_sequence",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check sampling parameters before a request enters a batch
pub fn validate_parameters(
    id: u64,
    parameters: &NextTokenChooserParameters,
    stopping: &StoppingCriteriaParameters,
) -> Result<()> {
    if !(parameters.temperature > 0.0) || !parameters.temperature.is_finite() {
        return Err(ShardgenError::invalid_request(
            id,
            format!("temperature must be strictly positive, got {}", parameters.temperature),
        ));
    }
    if !(parameters.top_p > 0.0 && parameters.top_p <= 1.0) {
        return Err(ShardgenError::invalid_request(
            id,
            format!("top_p must be in (0, 1], got {}", parameters.top_p),
        ));
    }
    if stopping.max_new_tokens == 0 {
        return Err(ShardgenError::invalid_request(id, "max_new_tokens must be positive"));
    }
    Ok(())
}

/// Whether `parameters` sample rather than pick the most likely token
pub fn is_sampling(parameters: &NextTokenChooserParameters) -> bool {
    parameters.do_sample || parameters.temperature != 1.0 || parameters.top_k > 0 || parameters.top_p < 1.0
}

/// Picks the next token of one request
pub struct NextTokenChooser {
    processor: LogitsProcessor,
    seed: Option<u64>,
}

impl fmt::Debug for NextTokenChooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextTokenChooser").field("seed", &self.seed).finish()
    }
}

impl NextTokenChooser {
    /// Build from wire parameters
    ///
    /// Greedy unless sampling is requested or a warper is set. Sampling
    /// without an explicit seed draws a random one, which is reported back
    /// with the generated text.
    pub fn from_pb(parameters: &NextTokenChooserParameters) -> Self {
        let temperature = parameters.temperature as f64;
        let top_k = parameters.top_k as usize;
        let top_p = parameters.top_p as f64;

        if !is_sampling(parameters) {
            return Self {
                processor: LogitsProcessor::from_sampling(0, Sampling::ArgMax),
                seed: None,
            };
        }

        let sampling = match (top_k > 0, top_p < 1.0) {
            (true, true) => Sampling::TopKThenTopP {
                k: top_k,
                p: top_p,
                temperature,
            },
            (true, false) => Sampling::TopK { k: top_k, temperature },
            (false, true) => Sampling::TopP { p: top_p, temperature },
            (false, false) => Sampling::All { temperature },
        };
        let seed = parameters.seed.unwrap_or_else(rand::random);

        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            seed: Some(seed),
        }
    }

    /// Seed used for sampling, if sampling
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Choose a token from one row of logits `[vocab]`
    ///
    /// Returns the token id and its log-probability under the full,
    /// unwarped distribution.
    pub fn choose(&mut self, logits: &Tensor) -> Result<(u32, f32)> {
        let token = self.processor.sample(logits)?;
        let logprob = log_softmax_last_dim(logits)?
            .get(token as usize)?
            .to_scalar::<f32>()?;
        Ok((token, logprob))
    }
}

/// Decides when a request is finished
#[derive(Debug, Clone)]
pub struct StoppingCriteria {
    stop_token_id: Option<u32>,
    max_new_tokens: u32,
    stop_sequences: Vec<String>,
    generated: u32,
}

impl StoppingCriteria {
    /// Build from wire parameters and the model's stop token
    pub fn from_pb(parameters: &StoppingCriteriaParameters, stop_token_id: Option<u32>) -> Self {
        Self {
            stop_token_id,
            max_new_tokens: parameters.max_new_tokens,
            stop_sequences: parameters
                .stop_sequences
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            generated: 0,
        }
    }

    /// Tokens generated so far
    pub fn generated(&self) -> u32 {
        self.generated
    }

    /// Record a generated token; returns why generation stops, if it does
    ///
    /// `output_text` is the decoded output including `token_id`.
    pub fn check(&mut self, token_id: u32, output_text: &str) -> Option<FinishReason> {
        self.generated += 1;

        if self.stop_token_id == Some(token_id) {
            return Some(FinishReason::Stop);
        }
        if self
            .stop_sequences
            .iter()
            .any(|sequence| output_text.ends_with(sequence.as_str()))
        {
            return Some(FinishReason::StopSequence);
        }
        if self.generated >= self.max_new_tokens {
            return Some(FinishReason::Length);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn greedy() -> NextTokenChooserParameters {
        NextTokenChooserParameters {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            do_sample: false,
            seed: None,
        }
    }

    #[test]
    fn test_greedy_choice() {
        let mut chooser = NextTokenChooser::from_pb(&greedy());
        assert_eq!(chooser.seed(), None);

        let logits = Tensor::new(&[0.1f32, 3.0, -1.0, 0.5], &Device::Cpu).unwrap();
        let (token, logprob) = chooser.choose(&logits).unwrap();
        assert_eq!(token, 1);
        assert!(logprob < 0.0 && logprob > -1.0);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let parameters = NextTokenChooserParameters {
            do_sample: true,
            seed: Some(42),
            top_k: 3,
            ..greedy()
        };
        let logits = Tensor::new(&[1.0f32, 1.1, 0.9, 1.05, -5.0], &Device::Cpu).unwrap();

        let mut first = NextTokenChooser::from_pb(&parameters);
        let mut second = NextTokenChooser::from_pb(&parameters);
        for _ in 0..8 {
            let a = first.choose(&logits).unwrap().0;
            let b = second.choose(&logits).unwrap().0;
            assert_eq!(a, b);
            assert_ne!(a, 4);
        }
        assert_eq!(first.seed(), Some(42));
    }

    #[test]
    fn test_is_sampling() {
        assert!(!is_sampling(&greedy()));
        assert!(is_sampling(&NextTokenChooserParameters {
            do_sample: true,
            ..greedy()
        }));
        assert!(is_sampling(&NextTokenChooserParameters { top_k: 5, ..greedy() }));
        assert!(is_sampling(&NextTokenChooserParameters {
            temperature: 0.7,
            ..greedy()
        }));
    }

    #[test]
    fn test_random_seed_is_reported() {
        let parameters = NextTokenChooserParameters {
            do_sample: true,
            ..greedy()
        };
        assert!(NextTokenChooser::from_pb(&parameters).seed().is_some());
    }

    #[test]
    fn test_validation() {
        let stopping = StoppingCriteriaParameters {
            max_new_tokens: 4,
            stop_sequences: vec![],
        };
        assert!(validate_parameters(1, &greedy(), &stopping).is_ok());

        let cold = NextTokenChooserParameters {
            temperature: 0.0,
            ..greedy()
        };
        assert!(matches!(
            validate_parameters(1, &cold, &stopping),
            Err(ShardgenError::InvalidRequest { id: 1, .. })
        ));

        let wide = NextTokenChooserParameters {
            top_p: 1.5,
            ..greedy()
        };
        assert!(validate_parameters(1, &wide, &stopping).is_err());

        let none = StoppingCriteriaParameters {
            max_new_tokens: 0,
            stop_sequences: vec![],
        };
        assert!(validate_parameters(1, &greedy(), &none).is_err());
    }

    #[test]
    fn test_stopping_order() {
        let parameters = StoppingCriteriaParameters {
            max_new_tokens: 3,
            stop_sequences: vec!["world".to_string()],
        };

        let mut criteria = StoppingCriteria::from_pb(&parameters, Some(0));
        assert_eq!(criteria.check(5, "hello"), None);
        assert_eq!(criteria.check(6, "hello world"), Some(FinishReason::StopSequence));

        let mut criteria = StoppingCriteria::from_pb(&parameters, Some(0));
        assert_eq!(criteria.check(0, ""), Some(FinishReason::Stop));

        let mut criteria = StoppingCriteria::from_pb(&parameters, None);
        assert_eq!(criteria.check(1, "a"), None);
        assert_eq!(criteria.check(1, "a a"), None);
        assert_eq!(criteria.check(1, "a a a"), Some(FinishReason::Length));
        assert_eq!(criteria.generated(), 3);
    }

    #[test]
    fn test_finish_reason_strings() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::Length.as_str(), "length");
        assert_eq!(
            serde_json::to_string(&FinishReason::StopSequence).unwrap(),
            "\"stop_sequence\""
        );
    }
}
