//! Deterministic in-process backend
//!
//! Replays a fixed script of chunks instead of running a model. Used by the
//! test suites and handy for exercising the HTTP surface without a GPU.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{
    Backend, BackendKind, BackendLoader, BackendRequest, ChunkSink, Eligibility, OutputMode,
};
use crate::error::{BackendError, LoadError};
use crate::model::ModelDescriptor;
use crate::prompt::Conversation;
use crate::system::HostFacts;

/// One scripted action
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(String),
    Pause(Duration),
    Fail(BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Template {
    Absent,
    Native,
    Broken,
}

/// What a backend was asked to do
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub prompt: String,
    pub image_count: usize,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    kind: BackendKind,
    mode: OutputMode,
    steps: Vec<Step>,
    repeat: Option<(String, Duration)>,
    placeholder: Option<String>,
    template: Template,
    finished: AtomicBool,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedBackend {
    pub fn new(mode: OutputMode, steps: Vec<Step>) -> Self {
        Self {
            kind: BackendKind::Portable,
            mode,
            steps,
            repeat: None,
            placeholder: Some("<start_of_image>".to_string()),
            template: Template::Absent,
            finished: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn incremental<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            OutputMode::Incremental,
            chunks.into_iter().map(|c| Step::Chunk(c.into())).collect(),
        )
    }

    pub fn cumulative<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            OutputMode::Cumulative,
            chunks.into_iter().map(|c| Step::Chunk(c.into())).collect(),
        )
    }

    /// Emits `chunk` every `interval` until cancelled
    pub fn endless(chunk: impl Into<String>, interval: Duration) -> Self {
        let mut backend = Self::new(OutputMode::Incremental, Vec::new());
        backend.repeat = Some((chunk.into(), interval));
        backend
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_placeholder(mut self, placeholder: Option<&str>) -> Self {
        self.placeholder = placeholder.map(str::to_string);
        self
    }

    /// Render prompts with a recognizable `native:` prefix
    pub fn with_native_template(mut self) -> Self {
        self.template = Template::Native;
        self
    }

    /// Native templating that always errors
    pub fn with_broken_template(mut self) -> Self {
        self.template = Template::Broken;
        self
    }

    /// True once a generate call has returned
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    async fn run(&self, sink: &ChunkSink) -> Result<(), BackendError> {
        for step in &self.steps {
            match step {
                Step::Chunk(chunk) => {
                    if !sink.send(chunk.clone()).await {
                        return Ok(());
                    }
                }
                Step::Pause(duration) => {
                    tokio::select! {
                        _ = sink.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(*duration) => {}
                    }
                }
                Step::Fail(err) => return Err(err.clone()),
            }
        }

        if let Some((chunk, interval)) = &self.repeat {
            loop {
                if !sink.send(chunk.clone()).await {
                    break;
                }
                tokio::select! {
                    _ = sink.cancelled() => break,
                    _ = tokio::time::sleep(*interval) => {}
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn output_mode(&self) -> OutputMode {
        self.mode
    }

    fn image_placeholder(&self) -> Option<&str> {
        self.placeholder.as_deref()
    }

    async fn apply_chat_template(
        &self,
        conversation: &Conversation,
    ) -> Option<Result<String, BackendError>> {
        match self.template {
            Template::Absent => None,
            Template::Broken => Some(Err(BackendError::Protocol(
                "template endpoint unavailable".to_string(),
            ))),
            Template::Native => {
                let turns: Vec<String> = conversation
                    .turns
                    .iter()
                    .map(|t| format!("{}: {}", t.role, t.joined_text()))
                    .collect();
                Some(Ok(format!("native:{}", turns.join(" | "))))
            }
        }
    }

    async fn generate(&self, request: BackendRequest, sink: ChunkSink) -> Result<(), BackendError> {
        self.requests.lock().push(RecordedRequest {
            prompt: request.prompt,
            image_count: request.images.len(),
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
        });
        let result = self.run(&sink).await;
        self.finished.store(true, Ordering::Release);
        result
    }
}

/// Loader handing out a prepared [`ScriptedBackend`] or a scripted failure
pub struct ScriptedLoader {
    kind: BackendKind,
    eligibility: Eligibility,
    outcome: Result<Arc<ScriptedBackend>, String>,
    delay: Duration,
    eligibility_delay: Duration,
    attempts: AtomicUsize,
}

impl ScriptedLoader {
    pub fn ready(kind: BackendKind, backend: ScriptedBackend) -> Self {
        Self {
            kind,
            eligibility: Eligibility::Eligible,
            outcome: Ok(Arc::new(backend.with_kind(kind))),
            delay: Duration::ZERO,
            eligibility_delay: Duration::ZERO,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            eligibility: Eligibility::Eligible,
            outcome: Err(reason.into()),
            delay: Duration::ZERO,
            eligibility_delay: Duration::ZERO,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn ineligible(mut self, reason: impl Into<String>) -> Self {
        self.eligibility = Eligibility::Ineligible(reason.into());
        self
    }

    /// Simulate a slow model load
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block the calling thread during the eligibility check, like a slow install check
    pub fn with_slow_eligibility(mut self, delay: Duration) -> Self {
        self.eligibility_delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// The backend this loader produces, if it succeeds
    pub fn backend(&self) -> Option<Arc<ScriptedBackend>> {
        self.outcome.as_ref().ok().cloned()
    }
}

#[async_trait]
impl BackendLoader for ScriptedLoader {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn eligibility(&self, _host: &HostFacts) -> Eligibility {
        if !self.eligibility_delay.is_zero() {
            std::thread::sleep(self.eligibility_delay);
        }
        self.eligibility.clone()
    }

    async fn load(&self, _model: &ModelDescriptor) -> Result<Arc<dyn Backend>, LoadError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Ok(backend) => Ok(Arc::clone(backend) as Arc<dyn Backend>),
            Err(reason) => Err(LoadError::new(self.kind, reason.clone())),
        }
    }
}
