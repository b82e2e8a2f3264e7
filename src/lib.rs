//! medserver - self-hosted MedGemma clinical chat server
//!
//! Serves a single MedGemma variant over HTTP, delegating tensor work to an
//! external inference runtime.
//!
//! # Architecture
//!
//! - **engine**: backend selection with fallback (SGLang, then llama.cpp),
//!   delta normalization and cancellable token streams
//! - **prompt**: Gemma turn rendering with image placeholders
//! - **admission**: per-client stream cap and rate limit
//! - **server**: axum routes, validation and SSE framing
//!
//! # Example
//!
//! ```bash
//! # Serve the 4B multimodal model
//! medserver serve --model 4 --port 8000
//!
//! # Force the llama.cpp backend with quantized weights
//! medserver serve --model 27t --force-portable -q
//!
//! # Show the catalog
//! medserver list
//! ```

pub mod admission;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod prompt;
pub mod server;
pub mod system;

// Re-export key types
pub use admission::{AdmissionController, AdmissionRejected, AdmissionSlot, RateLimit};
pub use config::{GenerationConfig, MedServerConfig, ServerConfig};
pub use engine::{HybridEngine, StreamEvent, StreamSession};
pub use error::{Error, Result};
pub use model::ModelDescriptor;
