//! List models command

use anyhow::Result;

use crate::model::registry;

/// Print the model catalog
pub async fn list() -> Result<()> {
    println!("Available models:\n");
    for model in registry::all() {
        println!(
            "  {:<4} {:<24} {:>5.1}B  {:<10}  {:>3} GB VRAM",
            model.key,
            model.display_name,
            model.param_billions,
            model.modality,
            model.min_vram_gb
        );
    }
    println!("\nServe one with: medserver serve --model <key>");
    Ok(())
}
