//! Inference engine
//!
//! - [`HybridEngine`]: picks a backend once at load time and serves every
//!   request through it
//! - [`Backend`] / [`BackendLoader`]: the seam concrete runtimes implement
//! - [`StreamSession`]: one admitted streaming request and its cancellation
//! - [`runtime`]: SGLang and llama.cpp server backends
//! - [`scripted`]: in-process backend with canned output

mod backend;
mod delta;
mod handle;
mod hybrid;
pub mod runtime;
pub mod scripted;
mod session;
mod stream;

pub use backend::{
    Backend, BackendKind, BackendLoader, BackendRequest, ChunkSink, Eligibility, OutputMode,
};
pub use delta::DeltaNormalizer;
pub use handle::{ActiveBackend, EngineStatus};
pub use hybrid::HybridEngine;
pub use session::{SessionState, StreamEvent, StreamSession};
pub use stream::TokenStream;
