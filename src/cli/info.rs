//! Model info command

use anyhow::Result;

use crate::config::EngineConfig;
use crate::engine::runtime::SglangLoader;
use crate::engine::{BackendLoader, Eligibility};
use crate::model;
use crate::system::HostFacts;

/// Show a model descriptor and the backend this host would use
pub async fn info(key: String) -> Result<()> {
    let model = model::lookup(&key)?;

    println!("Model: {} ({})\n", model.display_name, model.key);
    println!("  HuggingFace id: {}", model.backend_model_id);
    println!("  Parameters:     {:.1}B", model.param_billions);
    println!("  Modality:       {}", model.modality);
    println!("  Images:         {}", if model.supports_images { "yes" } else { "no" });
    println!("  Context:        {} tokens", model.max_context_tokens);
    println!("  Minimum VRAM:   {} GB", model.min_vram_gb);
    if !model.recommended_gpus.is_empty() {
        println!("  Suggested GPUs: {}", model.recommended_gpus.join(", "));
    }
    println!("\n{}\n", model.description);

    let host = tokio::task::spawn_blocking(HostFacts::detect).await?;
    match &host.gpu {
        Some(gpu) => {
            println!("GPU: {} x{} ({:.1} GB)", gpu.name, gpu.device_count, gpu.vram_gb());
            if gpu.vram_gb() < f64::from(model.min_vram_gb) {
                println!("  Warning: below the {} GB this model needs", model.min_vram_gb);
            }
        }
        None => println!("GPU: none detected"),
    }

    let loader = SglangLoader::new(&EngineConfig::default());
    let eligibility = tokio::task::spawn_blocking(move || loader.eligibility(&host)).await?;
    match eligibility {
        Eligibility::Eligible => println!("Backend: high-performance (SGLang)"),
        Eligibility::Ineligible(reason) => println!("Backend: portable (llama.cpp); {reason}"),
    }

    Ok(())
}
