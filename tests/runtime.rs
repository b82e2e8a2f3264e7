//! Runtime clients against an in-process mock of the SGLang and llama.cpp HTTP APIs

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use medserver::config::{EngineConfig, GenerationConfig, RuntimeLauncher};
use medserver::engine::{BackendKind, HybridEngine};
use medserver::prompt::{Conversation, ImagePayload, Role};
use medserver::system::{ComputeCapability, GpuInfo, HostFacts};
use medserver::Error;

type Received = Arc<Mutex<Vec<(String, Value)>>>;

fn sse(body: &'static str) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

fn mock_runtime(received: Received) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/generate",
            post(|State(received): State<Received>, Json(body): Json<Value>| async move {
                received.lock().push(("/generate".to_string(), body));
                sse("data: {\"text\":\"The\"}\n\n\
                     data: {\"text\":\"The lungs\"}\n\n\
                     data: {\"text\":\"The lungs are clear.\"}\n\n\
                     data: [DONE]\n\n")
            }),
        )
        .route(
            "/completion",
            post(|State(received): State<Received>, Json(body): Json<Value>| async move {
                received.lock().push(("/completion".to_string(), body));
                sse("data: {\"content\":\"No \",\"stop\":false}\n\n\
                     data: {\"content\":\"effusion.\",\"stop\":false}\n\n\
                     data: {\"content\":\"\",\"stop\":true}\n\n")
            }),
        )
        .route(
            "/apply-template",
            post(|State(received): State<Received>, Json(body): Json<Value>| async move {
                received.lock().push(("/apply-template".to_string(), body));
                Json(json!({ "prompt": "TEMPLATED PROMPT" }))
            }),
        )
        .with_state(received)
}

fn oom_runtime() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/generate",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "CUDA out of memory. Tried to allocate 2.00 GiB" })),
                )
            }),
        )
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn attach(endpoint: &str) -> RuntimeLauncher {
    RuntimeLauncher {
        endpoint: endpoint.to_string(),
        program: None,
        args: Vec::new(),
        extra_args: Vec::new(),
        probe: Vec::new(),
        model: None,
        startup_timeout_secs: 5,
    }
}

fn engine_config(endpoint: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.high_performance.runtime = attach(endpoint);
    config.portable = attach(endpoint);
    config
}

fn ampere_host() -> HostFacts {
    HostFacts {
        platform: "linux".to_string(),
        gpu: Some(GpuInfo {
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            vram_total_mb: 40960,
            compute_capability: Some(ComputeCapability::new(8, 0)),
            device_count: 1,
        }),
    }
}

fn question() -> Conversation {
    Conversation::new()
        .with_turn(Role::System, "You are a radiology assistant.")
        .with_turn(Role::User, "Describe the chest film.")
}

fn png_payload() -> ImagePayload {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
    let mut buf = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    ImagePayload::from_bytes(buf.into_inner(), 1024 * 1024).unwrap()
}

#[tokio::test]
async fn test_sglang_cumulative_stream_is_normalized() {
    let received = Received::default();
    let endpoint = serve(mock_runtime(received.clone())).await;
    let model = medserver::model::lookup("4").unwrap();

    let engine = HybridEngine::from_config(model, ampere_host(), &engine_config(&endpoint));
    engine.load().await.unwrap();
    assert_eq!(engine.active().unwrap().kind, BackendKind::HighPerformance);

    let mut params = GenerationConfig::default().with_request(Some(32), Some(0.0));
    params.stop_sequences = vec!["<end_of_turn>".to_string()];
    let mut tokens = engine
        .stream_generate(question(), params, vec![png_payload()], CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    while let Some(token) = tokens.next().await {
        deltas.push(token.unwrap());
    }
    assert_eq!(deltas, ["The", " lungs", " are clear."]);

    let received = received.lock();
    let (path, body) = &received[0];
    assert_eq!(path, "/generate");
    assert!(body["text"].as_str().unwrap().contains("<start_of_image>"));
    assert_eq!(body["stream"], true);
    assert_eq!(body["sampling_params"]["max_new_tokens"], 32);
    assert_eq!(body["sampling_params"]["temperature"], 0.0);
    assert_eq!(body["sampling_params"]["stop"], json!(["<end_of_turn>"]));
    let images = body["image_data"].as_array().unwrap();
    assert_eq!(images.len(), 1);
    assert!(images[0].as_str().unwrap().starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_llama_cpp_uses_native_template_without_images() {
    let received = Received::default();
    let endpoint = serve(mock_runtime(received.clone())).await;
    let model = medserver::model::lookup("27t").unwrap();

    let mut config = engine_config(&endpoint);
    config.force_portable = true;
    let engine = HybridEngine::from_config(model, ampere_host(), &config);
    engine.load().await.unwrap();

    let active = engine.active().unwrap();
    assert_eq!(active.kind, BackendKind::Portable);
    assert!(active.fallback_reason.is_some());

    let text = engine
        .generate(question(), GenerationConfig::default(), Vec::new())
        .await
        .unwrap();
    assert_eq!(text, "No effusion.");

    let received = received.lock();
    let paths: Vec<&str> = received.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, ["/apply-template", "/completion"]);

    let messages = &received[0].1["messages"];
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "Describe the chest film.");

    let completion = &received[1].1;
    assert_eq!(completion["prompt"], "TEMPLATED PROMPT");
    assert_eq!(completion["stream"], true);
    assert_eq!(completion["n_predict"], 2048);
}

#[tokio::test]
async fn test_llama_cpp_multimodal_prompt() {
    let received = Received::default();
    let endpoint = serve(mock_runtime(received.clone())).await;
    let model = medserver::model::lookup("4").unwrap();

    let mut config = engine_config(&endpoint);
    config.force_portable = true;
    let engine = HybridEngine::from_config(model, ampere_host(), &config);
    engine.load().await.unwrap();

    engine
        .generate(question(), GenerationConfig::default(), vec![png_payload()])
        .await
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    let (path, body) = &received[0];
    assert_eq!(path, "/completion");
    assert!(body["prompt"]["prompt_string"]
        .as_str()
        .unwrap()
        .contains("<__media__>"));
    assert_eq!(body["prompt"]["multimodal_data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_runtime_oom_surfaces_as_resource_error() {
    let endpoint = serve(oom_runtime()).await;
    let model = medserver::model::lookup("4").unwrap();

    let engine = HybridEngine::from_config(model, ampere_host(), &engine_config(&endpoint));
    engine.load().await.unwrap();

    let result = engine
        .generate(question(), GenerationConfig::default(), Vec::new())
        .await;
    assert!(matches!(result, Err(Error::GpuResourceExhausted(_))));
}

#[tokio::test]
async fn test_unreachable_runtimes_fail_load() {
    let mut config = engine_config("http://127.0.0.1:9");
    config.high_performance.runtime.startup_timeout_secs = 0;
    config.portable.startup_timeout_secs = 0;
    let model = medserver::model::lookup("4").unwrap();

    let engine = HybridEngine::from_config(model, ampere_host(), &config);
    assert!(matches!(engine.load().await, Err(Error::Load(_))));
    assert!(engine.active().is_none());
}
