//! Engine and runtime configuration settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::system::ComputeCapability;

/// How to reach (and optionally start) an external inference runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLauncher {
    /// Base URL of the runtime's HTTP API
    pub endpoint: String,

    /// Executable to spawn. When absent, an already running runtime at
    /// `endpoint` is attached to instead.
    #[serde(default)]
    pub program: Option<String>,

    /// Leading arguments (e.g. `["-m", "sglang.launch_server"]`)
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra arguments appended after the generated ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Command whose zero exit status proves the runtime is installed
    #[serde(default)]
    pub probe: Vec<String>,

    /// Model id handed to this runtime instead of the registry id
    #[serde(default)]
    pub model: Option<String>,

    /// How long to wait for the runtime to report healthy
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout() -> u64 {
    900
}

impl RuntimeLauncher {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    fn sglang() -> Self {
        Self {
            endpoint: "http://127.0.0.1:30000".to_string(),
            program: Some("python3".to_string()),
            args: vec!["-m".to_string(), "sglang.launch_server".to_string()],
            extra_args: Vec::new(),
            probe: vec![
                "python3".to_string(),
                "-c".to_string(),
                "import sglang".to_string(),
            ],
            model: None,
            startup_timeout_secs: default_startup_timeout(),
        }
    }

    fn llama_cpp() -> Self {
        Self {
            endpoint: "http://127.0.0.1:30001".to_string(),
            program: Some("llama-server".to_string()),
            args: Vec::new(),
            extra_args: Vec::new(),
            probe: Vec::new(),
            model: None,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// Eligibility rules and runtime for the high-performance backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighPerformanceConfig {
    /// Host OS families the runtime supports (values of `std::env::consts::OS`)
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,

    /// Minimum GPU compute capability (Ampere = 8.0)
    #[serde(default = "default_min_compute_capability")]
    pub min_compute_capability: ComputeCapability,

    #[serde(default = "RuntimeLauncher::sglang")]
    pub runtime: RuntimeLauncher,
}

fn default_platforms() -> Vec<String> {
    vec!["linux".to_string()]
}

fn default_min_compute_capability() -> ComputeCapability {
    ComputeCapability::new(8, 0)
}

impl Default for HighPerformanceConfig {
    fn default() -> Self {
        Self {
            platforms: default_platforms(),
            min_compute_capability: default_min_compute_capability(),
            runtime: RuntimeLauncher::sglang(),
        }
    }
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Registry key of the model to serve
    #[serde(default = "default_model")]
    pub model: String,

    /// Skip the high-performance backend even when eligible
    #[serde(default)]
    pub force_portable: bool,

    /// Ask the runtime for 4-bit quantized weights
    #[serde(default)]
    pub quantize: bool,

    /// Maximum context length in tokens
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Fraction of GPU memory the runtime may reserve
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,

    /// HuggingFace token for gated models
    #[serde(default)]
    pub hf_token: Option<String>,

    /// How long a cancelled stream waits for its worker to stop
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Buffered chunks between a generation worker and its consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub high_performance: HighPerformanceConfig,

    #[serde(default = "RuntimeLauncher::llama_cpp")]
    pub portable: RuntimeLauncher,
}

fn default_model() -> String {
    "4".to_string()
}

fn default_max_model_len() -> usize {
    8192
}

fn default_gpu_memory_utilization() -> f32 {
    0.90
}

fn default_grace_period() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            force_portable: false,
            quantize: false,
            max_model_len: default_max_model_len(),
            gpu_memory_utilization: default_gpu_memory_utilization(),
            hf_token: None,
            grace_period_secs: default_grace_period(),
            channel_capacity: default_channel_capacity(),
            high_performance: HighPerformanceConfig::default(),
            portable: RuntimeLauncher::llama_cpp(),
        }
    }
}

impl EngineConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
