//! Generation configuration settings

use serde::{Deserialize, Serialize};

const CLINICAL_SYSTEM_PROMPT: &str = "You are MedGemma, a specialized clinical AI assistant. \
Your goal is to provide precise, evidence-based medical information to healthcare professionals. \
Structure your responses clearly using clinical terminology. \
Always clarify that your analysis is for decision support and requires validation by a qualified clinician.";

/// Configuration for text generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for sampling (0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-p nucleus sampling threshold, applied only when sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repetition penalty, applied only when sampling
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Stop sequences passed to the runtime
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,

    /// System prompt prepended when a request does not bring its own
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    0.3
}

fn default_top_p() -> f32 {
    0.95
}

fn default_repetition_penalty() -> f32 {
    1.05
}

fn default_stop_sequences() -> Vec<String> {
    vec!["<end_of_turn>".to_string(), "<eos>".to_string()]
}

fn default_system_prompt() -> String {
    CLINICAL_SYSTEM_PROMPT.to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            stop_sequences: default_stop_sequences(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl GenerationConfig {
    /// Copy of these defaults with per-request overrides applied
    pub fn with_request(&self, max_tokens: Option<usize>, temperature: Option<f32>) -> Self {
        Self {
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            temperature: temperature.unwrap_or(self.temperature),
            ..self.clone()
        }
    }

    /// Check if greedy decoding should be used
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}
