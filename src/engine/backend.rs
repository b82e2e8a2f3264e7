//! Backend abstraction
//!
//! A backend turns a rendered prompt into text chunks. Loaders decide
//! whether their backend can run on this host and construct it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::error::{BackendError, LoadError};
use crate::model::ModelDescriptor;
use crate::prompt::{Conversation, ImagePayload};
use crate::system::HostFacts;

/// Which of the two backend tiers is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    HighPerformance,
    Portable,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HighPerformance => "high-performance",
            BackendKind::Portable => "portable",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend reports generated text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Each chunk is the full text generated so far
    Cumulative,
    /// Each chunk is only the new text
    Incremental,
}

/// Whether a loader may be tried on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// A fully prepared generation request
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub prompt: String,
    pub images: Vec<ImagePayload>,
    pub params: GenerationConfig,
}

/// Where a backend pushes its output chunks
///
/// Sending fails once the consumer is gone or the stream was cancelled, at
/// which point the backend should stop producing.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Deliver one chunk. Returns false when the stream should stop.
    pub async fn send(&self, chunk: String) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(chunk) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the stream has been cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A loaded model ready to generate
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn output_mode(&self) -> OutputMode;

    /// Token the runtime expects inline for each image, if any
    fn image_placeholder(&self) -> Option<&str>;

    /// Render the conversation with the runtime's own chat template.
    ///
    /// `None` means the backend has no native templating.
    async fn apply_chat_template(
        &self,
        _conversation: &Conversation,
    ) -> Option<Result<String, BackendError>> {
        None
    }

    /// Generate until done, cancelled, or failed, pushing chunks into `sink`
    async fn generate(&self, request: BackendRequest, sink: ChunkSink) -> Result<(), BackendError>;
}

/// Knows how to bring up one kind of backend
#[async_trait]
pub trait BackendLoader: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn eligibility(&self, host: &HostFacts) -> Eligibility;

    async fn load(&self, model: &ModelDescriptor) -> Result<Arc<dyn Backend>, LoadError>;
}
