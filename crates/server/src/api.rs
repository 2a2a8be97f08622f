//! JSON request surface of the server binary

use serde::{Deserialize, Serialize};
use shardgen_proto::{NextTokenChooserParameters, StoppingCriteriaParameters};

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_new_tokens() -> u32 {
    20
}

/// One line of input: `{"inputs": "...", "parameters": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub inputs: String,
    #[serde(default)]
    pub parameters: GenerateParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerateParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
            do_sample: false,
            seed: None,
            max_new_tokens: default_max_new_tokens(),
            stop: Vec::new(),
        }
    }
}

impl GenerateParameters {
    /// Wire parameters for the scheduler
    pub fn into_pb(self) -> (NextTokenChooserParameters, StoppingCriteriaParameters) {
        (
            NextTokenChooserParameters {
                temperature: self.temperature,
                top_k: self.top_k,
                top_p: self.top_p,
                do_sample: self.do_sample,
                seed: self.seed,
            },
            StoppingCriteriaParameters {
                max_new_tokens: self.max_new_tokens,
                stop_sequences: self.stop,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request: GenerateRequest = serde_json::from_str(r#"{"inputs": "hello"}"#).unwrap();
        let (chooser, stopping) = request.parameters.into_pb();
        assert_eq!(chooser.temperature, 1.0);
        assert!(!chooser.do_sample);
        assert_eq!(stopping.max_new_tokens, 20);
    }

    #[test]
    fn test_explicit_parameters() {
        let request: GenerateRequest = serde_json::from_str(
            r#"{"inputs": "hi", "parameters": {"do_sample": true, "seed": 7, "top_k": 5, "stop": ["\n"]}}"#,
        )
        .unwrap();
        let (chooser, stopping) = request.parameters.into_pb();
        assert_eq!(chooser.seed, Some(7));
        assert_eq!(chooser.top_k, 5);
        assert_eq!(stopping.stop_sequences, vec!["\n".to_string()]);
    }
}
