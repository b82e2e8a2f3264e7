//! Error taxonomy for the serving core
//!
//! Backend-selection failures are recovered inside the hybrid engine; the
//! variants here are what callers can actually observe.

use thiserror::Error;

use crate::engine::BackendKind;
use crate::prompt::FormatError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Requested model key is not in the registry.
    #[error("unknown model key '{key}'. Valid options: {valid}")]
    UnknownModel { key: String, valid: String },

    /// Every backend failed to load. Fatal: the process does not serve.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// `load()` was called on an engine that already attempted a load.
    #[error("engine load was already attempted")]
    LoadAttempted,

    /// A generation request arrived before the engine finished loading.
    #[error("model is still loading, please wait")]
    EngineNotReady,

    #[error(transparent)]
    Format(#[from] FormatError),

    /// The runtime ran out of GPU memory while generating.
    #[error("GPU out of memory ({0}). Try using quantization (-q) or a smaller model.")]
    GpuResourceExhausted(String),

    /// Any other per-request generation failure.
    #[error("generation failed: {0}")]
    Generation(String),
}

/// A backend failed to initialize.
#[derive(Debug, Clone, Error)]
#[error("{backend} backend failed to load: {reason}")]
pub struct LoadError {
    pub backend: BackendKind,
    pub reason: String,
}

impl LoadError {
    pub fn new(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }
}

/// Failure reported by a backend while producing tokens.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("runtime request failed: {0}")]
    Request(String),

    #[error("malformed runtime response: {0}")]
    Protocol(String),

    /// The worker task panicked or was aborted.
    #[error("generation worker terminated abnormally: {0}")]
    Worker(String),
}

impl BackendError {
    /// Classify a runtime error message, promoting OOM reports to their own variant.
    pub fn from_runtime_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains("out of memory") {
            BackendError::OutOfMemory(message)
        } else {
            BackendError::Request(message)
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfMemory(msg) => Error::GpuResourceExhausted(msg),
            other => Error::Generation(other.to_string()),
        }
    }
}
