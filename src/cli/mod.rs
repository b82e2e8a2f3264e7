//! CLI commands

mod info;
mod list;
mod serve;

pub use info::info;
pub use list::list;
pub use serve::serve;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::admission::RateLimit;

/// medserver - self-hosted MedGemma clinical chat server
#[derive(Parser)]
#[command(name = "medserver")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log filter (e.g. "debug", "medserver=trace"). Overrides RUST_LOG.
    #[arg(long, global = true, env = "MEDSERVER_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat server
    Serve(ServeArgs),

    /// List the model catalog
    List,

    /// Show one model and whether this host can run the fast backend
    Info {
        /// Model key (e.g. "4", "27", "27t")
        model: String,
    },
}

/// Flags for `serve`. Anything left unset keeps the config file's value.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// YAML configuration file
    #[arg(long, short, env = "MEDSERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Model key to serve
    #[arg(long, short)]
    pub model: Option<String>,

    /// Load quantized weights to reduce VRAM use
    #[arg(long, short)]
    pub quantize: bool,

    /// Skip the high-performance backend
    #[arg(long)]
    pub force_portable: bool,

    /// HuggingFace access token for gated models
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Maximum context length in tokens
    #[arg(long)]
    pub max_model_len: Option<usize>,

    /// Fraction of GPU memory the runtime may reserve
    #[arg(long)]
    pub gpu_memory_utilization: Option<f32>,

    /// Simultaneous streams allowed per client
    #[arg(long)]
    pub max_user_streams: Option<usize>,

    /// Request rate allowed per client, e.g. "20/minute"
    #[arg(long)]
    pub rate_limit: Option<RateLimit>,
}
