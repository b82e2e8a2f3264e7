//! llama.cpp `llama-server` runtime (portable tier)

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_status, read_sse, Payload, RuntimeProcess};
use crate::config::{EngineConfig, GenerationConfig, RuntimeLauncher};
use crate::engine::backend::{
    Backend, BackendKind, BackendLoader, BackendRequest, ChunkSink, Eligibility, OutputMode,
};
use crate::error::{BackendError, LoadError};
use crate::model::ModelDescriptor;
use crate::prompt::{Conversation, Role};
use crate::system::HostFacts;

/// Multimodal marker llama-server replaces with image embeddings
pub const MEDIA_MARKER: &str = "<__media__>";

/// GGUF quantization picked when `quantize` is on and the id names none
const DEFAULT_QUANT: &str = "Q4_K_M";

pub struct LlamaCppLoader {
    launcher: RuntimeLauncher,
    quantize: bool,
    max_model_len: usize,
    hf_token: Option<String>,
}

impl LlamaCppLoader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            launcher: config.portable.clone(),
            quantize: config.quantize,
            max_model_len: config.max_model_len,
            hf_token: config.hf_token.clone(),
        }
    }

    fn model_ref(&self, model: &ModelDescriptor) -> String {
        let id = self
            .launcher
            .model
            .as_deref()
            .unwrap_or(model.backend_model_id);
        if self.quantize && !id.contains(':') {
            format!("{id}:{DEFAULT_QUANT}")
        } else {
            id.to_string()
        }
    }

    fn launch_args(&self, model_ref: &str, endpoint: &reqwest::Url) -> Vec<String> {
        vec![
            "-hf".to_string(),
            model_ref.to_string(),
            "--host".to_string(),
            endpoint.host_str().unwrap_or("127.0.0.1").to_string(),
            "--port".to_string(),
            endpoint.port_or_known_default().unwrap_or(30001).to_string(),
            "-c".to_string(),
            self.max_model_len.to_string(),
        ]
    }
}

#[async_trait]
impl BackendLoader for LlamaCppLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn eligibility(&self, _host: &HostFacts) -> Eligibility {
        Eligibility::Eligible
    }

    async fn load(&self, model: &ModelDescriptor) -> Result<Arc<dyn Backend>, LoadError> {
        let endpoint = reqwest::Url::parse(&self.launcher.endpoint)
            .map_err(|e| LoadError::new(BackendKind::Portable, format!("invalid endpoint: {e}")))?;
        let env = self
            .hf_token
            .iter()
            .map(|token| ("HF_TOKEN".to_string(), token.clone()))
            .collect();

        let process = RuntimeProcess::start(
            BackendKind::Portable,
            &self.launcher,
            self.launch_args(&self.model_ref(model), &endpoint),
            env,
            "/health",
        )
        .await?;
        Ok(Arc::new(LlamaCppBackend { process }))
    }
}

#[derive(Serialize)]
struct TemplateMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct TemplateRequest {
    messages: Vec<TemplateMessage>,
}

#[derive(Deserialize)]
struct TemplateResponse {
    prompt: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum CompletionPrompt<'a> {
    Text(&'a str),
    Multimodal {
        prompt_string: &'a str,
        multimodal_data: Vec<String>,
    },
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: CompletionPrompt<'a>,
    n_predict: usize,
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    stop: &'a [String],
    stream: bool,
    cache_prompt: bool,
}

impl<'a> CompletionRequest<'a> {
    fn new(prompt: CompletionPrompt<'a>, params: &'a GenerationConfig) -> Self {
        Self {
            prompt,
            n_predict: params.max_tokens,
            temperature: params.temperature.max(0.0),
            top_p: params.top_p,
            repeat_penalty: params.repetition_penalty,
            stop: &params.stop_sequences,
            stream: true,
            cache_prompt: true,
        }
    }
}

/// Generation through a running llama-server
pub struct LlamaCppBackend {
    process: RuntimeProcess,
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn output_mode(&self) -> OutputMode {
        OutputMode::Incremental
    }

    fn image_placeholder(&self) -> Option<&str> {
        Some(MEDIA_MARKER)
    }

    async fn apply_chat_template(
        &self,
        conversation: &Conversation,
    ) -> Option<Result<String, BackendError>> {
        Some(self.render_template(conversation).await)
    }

    async fn generate(&self, request: BackendRequest, sink: ChunkSink) -> Result<(), BackendError> {
        let prompt = if request.images.is_empty() {
            CompletionPrompt::Text(&request.prompt)
        } else {
            CompletionPrompt::Multimodal {
                prompt_string: &request.prompt,
                multimodal_data: request.images.iter().map(|img| img.to_base64()).collect(),
            }
        };
        let body = CompletionRequest::new(prompt, &request.params);

        let resp = self
            .process
            .client()
            .post(self.process.url("/completion")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;

        read_sse(resp, &sink, parse_payload).await
    }
}

impl LlamaCppBackend {
    async fn render_template(&self, conversation: &Conversation) -> Result<String, BackendError> {
        let body = TemplateRequest {
            messages: conversation
                .turns
                .iter()
                .map(|turn| TemplateMessage {
                    role: match turn.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: turn.joined_text(),
                })
                .collect(),
        };

        let resp = self
            .process
            .client()
            .post(self.process.url("/apply-template")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let template: TemplateResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(template.prompt)
    }
}

fn parse_payload(value: serde_json::Value) -> Result<Payload, BackendError> {
    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    if value.get("stop").and_then(|s| s.as_bool()).unwrap_or(false) {
        return Ok(Payload::Last(content));
    }
    Ok(content.map(Payload::Chunk).unwrap_or(Payload::Skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lookup;
    use serde_json::json;

    #[test]
    fn test_model_ref_quantization_tag() {
        let mut config = EngineConfig::default();
        let model = lookup("4").unwrap();
        assert_eq!(
            LlamaCppLoader::new(&config).model_ref(model),
            "google/medgemma-1.5-4b-it"
        );

        config.quantize = true;
        assert_eq!(
            LlamaCppLoader::new(&config).model_ref(model),
            "google/medgemma-1.5-4b-it:Q4_K_M"
        );

        config.portable.model = Some("unsloth/medgemma-4b-it-GGUF:Q8_0".to_string());
        assert_eq!(
            LlamaCppLoader::new(&config).model_ref(model),
            "unsloth/medgemma-4b-it-GGUF:Q8_0"
        );
    }

    #[test]
    fn test_launch_args() {
        let loader = LlamaCppLoader::new(&EngineConfig::default());
        let endpoint = reqwest::Url::parse("http://127.0.0.1:30001").unwrap();
        assert_eq!(
            loader.launch_args("repo/model", &endpoint).join(" "),
            "-hf repo/model --host 127.0.0.1 --port 30001 -c 8192"
        );
    }

    #[test]
    fn test_completion_prompt_shapes() {
        let params = GenerationConfig::default();
        let text = serde_json::to_value(CompletionRequest::new(CompletionPrompt::Text("hi"), &params))
            .unwrap();
        assert_eq!(text["prompt"], json!("hi"));
        assert_eq!(text["n_predict"], json!(2048));

        let multimodal = serde_json::to_value(CompletionRequest::new(
            CompletionPrompt::Multimodal {
                prompt_string: "<__media__>hi",
                multimodal_data: vec!["AAAA".to_string()],
            },
            &params,
        ))
        .unwrap();
        assert_eq!(multimodal["prompt"]["prompt_string"], json!("<__media__>hi"));
        assert_eq!(multimodal["prompt"]["multimodal_data"][0], json!("AAAA"));
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(
            parse_payload(json!({"content": "lung", "stop": false})).unwrap(),
            Payload::Chunk("lung".to_string())
        );
        assert_eq!(
            parse_payload(json!({"content": "", "stop": true, "timings": {}})).unwrap(),
            Payload::Last(None)
        );
        assert_eq!(
            parse_payload(json!({"content": ".", "stop": true})).unwrap(),
            Payload::Last(Some(".".to_string()))
        );
    }
}
