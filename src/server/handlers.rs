//! HTTP request handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Multipart, State},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::client::ClientIdentity;
use super::error::ApiError;
use super::streaming::sse_response;
use super::validation::{AnalyzeForm, ChatRequest, PreparedRequest, Validator};
use crate::admission::{AdmissionController, AdmissionSlot};
use crate::config::{GenerationConfig, MedServerConfig, RequestLimits, ServerConfig};
use crate::engine::{BackendKind, EngineStatus, HybridEngine, StreamSession};
use crate::model::{self, Modality, ModelDescriptor};

/// Shared application state
pub struct AppState {
    pub engine: Arc<HybridEngine>,
    pub admission: AdmissionController,
    pub limits: RequestLimits,
    pub generation: GenerationConfig,
    pub server: ServerConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<HybridEngine>, config: &MedServerConfig) -> Self {
        Self {
            engine,
            admission: AdmissionController::new(&config.admission),
            limits: config.limits.clone(),
            generation: config.generation.clone(),
            server: config.server.clone(),
            started_at: Instant::now(),
        }
    }

    fn validator(&self) -> Validator<'_> {
        Validator {
            limits: &self.limits,
            defaults: &self.generation,
            model: self.engine.model(),
        }
    }

    /// Readiness and admission, in that order
    fn admit(&self, client: ClientIdentity) -> Result<AdmissionSlot, ApiError> {
        if !self.engine.is_ready() {
            return Err(crate::Error::EngineNotReady.into());
        }
        Ok(self.admission.try_acquire(client.0)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_name: &'static str,
    pub model_id: &'static str,
    pub modality: Modality,
    pub supports_images: bool,
    pub gpu_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_vram_gb: Option<f64>,
    pub host: String,
    pub port: u16,
    pub uptime_seconds: f64,
    pub max_text_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

/// Server, model and GPU status
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let model = state.engine.model();
    let gpu = state.engine.host().gpu.as_ref();
    let status = match state.engine.status() {
        EngineStatus::Ready => "ready",
        EngineStatus::Failed => "failed",
        EngineStatus::Unloaded | EngineStatus::Loading => "loading",
    };

    Json(HealthResponse {
        status,
        model_name: model.display_name,
        model_id: model.backend_model_id,
        modality: model.modality,
        supports_images: model.supports_images,
        gpu_available: gpu.is_some(),
        gpu_name: gpu.map(|g| g.name.clone()),
        gpu_vram_gb: gpu.map(|g| g.vram_gb()),
        host: state.server.host.clone(),
        port: state.server.port,
        uptime_seconds: round1(state.started_at.elapsed().as_secs_f64()),
        max_text_length: state.limits.max_text_length,
        backend: state.engine.active().map(|a| a.kind),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsResponse {
    pub models: &'static [ModelDescriptor],
    pub active_model: &'static str,
}

/// Every model in the catalog
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: model::registry::all(),
        active_model: state.engine.model().key,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfoResponse {
    #[serde(flatten)]
    pub model: &'static ModelDescriptor,
    pub load_time_seconds: Option<f64>,
    pub backend: Option<BackendKind>,
    pub fallback_reason: Option<String>,
}

/// The active model and how it was loaded
pub async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    let active = state.engine.active();
    Json(ModelInfoResponse {
        model: state.engine.model(),
        load_time_seconds: active.as_ref().map(|a| round1(a.load_time.as_secs_f64())),
        backend: active.as_ref().map(|a| a.kind),
        fallback_reason: active.and_then(|a| a.fallback_reason.clone()),
    })
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Chat completion, streamed as SSE unless `stream` is false
pub async fn chat(
    State(state): State<Arc<AppState>>,
    client: ClientIdentity,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let slot = state.admit(client)?;
    let prepared = state.validator().chat(request)?;

    if prepared.stream {
        return run_stream(&state, slot, prepared).await;
    }

    let PreparedRequest {
        conversation,
        images,
        params,
        ..
    } = prepared;
    let response = state.engine.generate(conversation, params, images).await?;
    drop(slot);
    Ok(Json(ChatResponse { response }).into_response())
}

/// Single-image analysis from a multipart upload, always streamed
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    client: ClientIdentity,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let slot = state.admit(client)?;
    let form = read_analyze_form(multipart, state.limits.max_image_bytes).await?;
    let prepared = state.validator().analyze(form)?;
    run_stream(&state, slot, prepared).await
}

async fn run_stream(
    state: &AppState,
    slot: AdmissionSlot,
    prepared: PreparedRequest,
) -> Result<Response, ApiError> {
    let session = StreamSession::new(slot);
    let tokens = state
        .engine
        .stream_generate(
            prepared.conversation,
            prepared.params,
            prepared.images,
            session.cancel_token(),
        )
        .await?;
    Ok(sse_response(session.events(tokens)))
}

async fn read_analyze_form(
    mut multipart: Multipart,
    max_image_bytes: usize,
) -> Result<AnalyzeForm, ApiError> {
    let mut form = AnalyzeForm::default();
    let invalid = |e: axum::extract::multipart::MultipartError| {
        ApiError::bad_request(format!("Invalid form data: {e}"))
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field.bytes().await.map_err(invalid)?;
                if bytes.len() > max_image_bytes {
                    return Err(ApiError::bad_request(format!(
                        "Image too large. Max {}MB.",
                        max_image_bytes / (1024 * 1024)
                    )));
                }
                form.image = Some(bytes.to_vec());
            }
            "prompt" => form.prompt = Some(field.text().await.map_err(invalid)?),
            "maxTokens" | "max_tokens" => {
                form.max_tokens = Some(parse_field(&name, &field.text().await.map_err(invalid)?)?)
            }
            "temperature" => {
                form.temperature = Some(parse_field(&name, &field.text().await.map_err(invalid)?)?)
            }
            other => tracing::debug!("ignoring form field '{other}'"),
        }
    }
    Ok(form)
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid value for '{name}': {value}")))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
