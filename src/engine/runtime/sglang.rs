//! SGLang runtime (high-performance tier)

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::{check_installed, check_status, read_sse, Payload, RuntimeProcess};
use crate::config::{EngineConfig, GenerationConfig, RuntimeLauncher};
use crate::engine::backend::{
    Backend, BackendKind, BackendLoader, BackendRequest, ChunkSink, Eligibility, OutputMode,
};
use crate::error::{BackendError, LoadError};
use crate::model::ModelDescriptor;
use crate::system::{ComputeCapability, HostFacts};

/// Gemma 3 image token as SGLang expects it inline
pub const IMAGE_PLACEHOLDER: &str = "<start_of_image>";

pub struct SglangLoader {
    launcher: RuntimeLauncher,
    platforms: Vec<String>,
    min_compute_capability: ComputeCapability,
    quantize: bool,
    max_model_len: usize,
    gpu_memory_utilization: f32,
    hf_token: Option<String>,
}

impl SglangLoader {
    pub fn new(config: &EngineConfig) -> Self {
        let hp = &config.high_performance;
        Self {
            launcher: hp.runtime.clone(),
            platforms: hp.platforms.clone(),
            min_compute_capability: hp.min_compute_capability,
            quantize: config.quantize,
            max_model_len: config.max_model_len,
            gpu_memory_utilization: config.gpu_memory_utilization,
            hf_token: config.hf_token.clone(),
        }
    }

    fn launch_args(&self, model_id: &str, endpoint: &reqwest::Url) -> Vec<String> {
        let mut args = vec![
            "--model-path".to_string(),
            model_id.to_string(),
            "--host".to_string(),
            endpoint.host_str().unwrap_or("127.0.0.1").to_string(),
            "--port".to_string(),
            endpoint.port_or_known_default().unwrap_or(30000).to_string(),
            "--mem-fraction-static".to_string(),
            self.gpu_memory_utilization.to_string(),
            "--context-length".to_string(),
            self.max_model_len.to_string(),
        ];
        if self.quantize {
            args.push("--quantization".to_string());
            args.push("bitsandbytes".to_string());
        }
        args
    }
}

#[async_trait]
impl BackendLoader for SglangLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::HighPerformance
    }

    fn eligibility(&self, host: &HostFacts) -> Eligibility {
        if !self.platforms.iter().any(|p| p == &host.platform) {
            return Eligibility::Ineligible(format!(
                "high-performance runtime is not supported on {}",
                host.platform
            ));
        }
        match host.compute_capability() {
            None => {
                return Eligibility::Ineligible(
                    "no CUDA GPU with a known compute capability detected".to_string(),
                )
            }
            Some(cc) if cc < self.min_compute_capability => {
                return Eligibility::Ineligible(format!(
                    "GPU compute capability {cc} is below the required {}",
                    self.min_compute_capability
                ))
            }
            Some(_) => {}
        }
        match check_installed(&self.launcher) {
            Ok(()) => Eligibility::Eligible,
            Err(reason) => Eligibility::Ineligible(reason),
        }
    }

    async fn load(&self, model: &ModelDescriptor) -> Result<Arc<dyn Backend>, LoadError> {
        let model_id = self
            .launcher
            .model
            .as_deref()
            .unwrap_or(model.backend_model_id);
        let endpoint = reqwest::Url::parse(&self.launcher.endpoint).map_err(|e| {
            LoadError::new(BackendKind::HighPerformance, format!("invalid endpoint: {e}"))
        })?;
        let env = self
            .hf_token
            .iter()
            .map(|token| ("HF_TOKEN".to_string(), token.clone()))
            .collect();

        let process = RuntimeProcess::start(
            BackendKind::HighPerformance,
            &self.launcher,
            self.launch_args(model_id, &endpoint),
            env,
            "/health",
        )
        .await?;
        Ok(Arc::new(SglangBackend { process }))
    }
}

#[derive(Serialize)]
struct SamplingParams<'a> {
    max_new_tokens: usize,
    temperature: f32,
    top_p: f32,
    repetition_penalty: f32,
    stop: &'a [String],
}

impl<'a> SamplingParams<'a> {
    fn from_config(params: &'a GenerationConfig) -> Self {
        Self {
            max_new_tokens: params.max_tokens,
            temperature: params.temperature.max(0.0),
            top_p: params.top_p,
            repetition_penalty: params.repetition_penalty,
            stop: &params.stop_sequences,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    image_data: Vec<String>,
    sampling_params: SamplingParams<'a>,
    stream: bool,
}

/// Generation through a running SGLang server
pub struct SglangBackend {
    process: RuntimeProcess,
}

#[async_trait]
impl Backend for SglangBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HighPerformance
    }

    fn output_mode(&self) -> OutputMode {
        OutputMode::Cumulative
    }

    fn image_placeholder(&self) -> Option<&str> {
        Some(IMAGE_PLACEHOLDER)
    }

    async fn generate(&self, request: BackendRequest, sink: ChunkSink) -> Result<(), BackendError> {
        let body = GenerateRequest {
            text: &request.prompt,
            image_data: request.images.iter().map(|img| img.to_data_url()).collect(),
            sampling_params: SamplingParams::from_config(&request.params),
            stream: true,
        };

        let resp = self
            .process
            .client()
            .post(self.process.url("/generate")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;

        read_sse(resp, &sink, parse_payload).await
    }
}

fn parse_payload(value: serde_json::Value) -> Result<Payload, BackendError> {
    match value.get("text").and_then(|t| t.as_str()) {
        Some(text) => Ok(Payload::Chunk(text.to_string())),
        None => Ok(Payload::Skip),
    }
}
