//! Configuration system for medserver
//!
//! Everything is optional in the YAML file; missing sections fall back to
//! the defaults the CLI documents. Command-line flags are layered on top
//! by `cli::serve`.

mod admission;
mod engine;
mod generation;
mod server;

pub use admission::AdmissionConfig;
pub use engine::{EngineConfig, HighPerformanceConfig, RuntimeLauncher};
pub use generation::GenerationConfig;
pub use server::{RequestLimits, ServerConfig};

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level medserver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedServerConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub limits: RequestLimits,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl MedServerConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Fill the HuggingFace token from the environment when not configured
    pub fn resolve_hf_token(&mut self) {
        if self.engine.hf_token.is_none() {
            self.engine.hf_token = std::env::var("HF_TOKEN")
                .or_else(|_| std::env::var("HUGGING_FACE_HUB_TOKEN"))
                .ok()
                .filter(|t| !t.is_empty());
        }
    }
}
