//! HTTP server command

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use super::ServeArgs;
use crate::config::MedServerConfig;
use crate::engine::HybridEngine;
use crate::model;
use crate::server::{self, AppState};
use crate::system::HostFacts;

/// Start the server; the model loads in the background
pub async fn serve(args: ServeArgs) -> Result<()> {
    let config = build_config(args)?;
    let model = model::lookup(&config.engine.model)?;

    tracing::info!(
        "Serving {} ({}, {})",
        model.display_name,
        model.backend_model_id,
        model.modality
    );
    if config.engine.hf_token.is_none() {
        tracing::warn!("No HuggingFace token configured; gated models may fail to download");
    }

    let host = tokio::task::spawn_blocking(HostFacts::detect).await?;
    let engine = Arc::new(HybridEngine::from_config(model, host, &config.engine));
    let state = Arc::new(AppState::new(engine.clone(), &config));

    let load = tokio::spawn(async move { engine.load().await });
    let server = server::start(state);
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        loaded = load => match loaded {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(anyhow!(err).context("no inference backend could be loaded")),
            Err(err) => return Err(anyhow!("model loading task failed: {err}")),
        },
    }

    server.await
}

/// Layer command-line flags over the config file and environment
fn build_config(args: ServeArgs) -> Result<MedServerConfig> {
    let mut config = match &args.config {
        Some(path) => MedServerConfig::from_yaml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MedServerConfig::default(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(model) = args.model {
        config.engine.model = model;
    }
    if args.quantize {
        config.engine.quantize = true;
    }
    if args.force_portable {
        config.engine.force_portable = true;
    }
    if let Some(token) = args.hf_token.filter(|t| !t.is_empty()) {
        config.engine.hf_token = Some(token);
    }
    if let Some(len) = args.max_model_len {
        config.engine.max_model_len = len;
    }
    if let Some(fraction) = args.gpu_memory_utilization {
        config.engine.gpu_memory_utilization = fraction;
    }
    if let Some(streams) = args.max_user_streams {
        config.admission.max_streams_per_client = streams;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.admission.rate_limit = rate_limit;
    }

    config.resolve_hf_token();
    Ok(config)
}
