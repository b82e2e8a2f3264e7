//! Hybrid engine: high-performance backend with portable fallback

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::backend::{Backend, BackendKind, BackendLoader, BackendRequest, Eligibility};
use super::handle::{ActiveBackend, EngineHandle, EngineStatus};
use super::runtime::{LlamaCppLoader, SglangLoader};
use super::stream::{spawn_worker, TokenStream};
use crate::config::{EngineConfig, GenerationConfig};
use crate::error::{Error, LoadError, Result};
use crate::model::ModelDescriptor;
use crate::prompt::{check_image_refs, render, Conversation, ImagePayload, RenderOptions};
use crate::system::HostFacts;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Serves one model through whichever backend could be loaded
pub struct HybridEngine {
    model: &'static ModelDescriptor,
    host: HostFacts,
    high_performance: Arc<dyn BackendLoader>,
    portable: Arc<dyn BackendLoader>,
    force_portable: bool,
    handle: EngineHandle,
    grace_period: Duration,
    channel_capacity: usize,
}

impl HybridEngine {
    pub fn new(
        model: &'static ModelDescriptor,
        host: HostFacts,
        high_performance: Arc<dyn BackendLoader>,
        portable: Arc<dyn BackendLoader>,
    ) -> Self {
        Self {
            model,
            host,
            high_performance,
            portable,
            force_portable: false,
            handle: EngineHandle::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Engine wired to the SGLang and llama.cpp runtimes
    pub fn from_config(
        model: &'static ModelDescriptor,
        host: HostFacts,
        config: &EngineConfig,
    ) -> Self {
        Self::new(
            model,
            host,
            Arc::new(SglangLoader::new(config)),
            Arc::new(LlamaCppLoader::new(config)),
        )
        .with_force_portable(config.force_portable)
        .with_grace_period(config.grace_period())
        .with_channel_capacity(config.channel_capacity)
    }

    pub fn with_force_portable(mut self, force: bool) -> Self {
        self.force_portable = force;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn model(&self) -> &'static ModelDescriptor {
        self.model
    }

    pub fn host(&self) -> &HostFacts {
        &self.host
    }

    pub fn status(&self) -> EngineStatus {
        self.handle.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    pub fn active(&self) -> Option<Arc<ActiveBackend>> {
        self.handle.active()
    }

    /// Select and load a backend. May only be called once.
    pub async fn load(&self) -> Result<()> {
        if !self.handle.begin_load() {
            return Err(Error::LoadAttempted);
        }
        let started = Instant::now();

        let eligibility = if self.force_portable {
            Eligibility::Ineligible("portable backend forced by configuration".to_string())
        } else {
            self.check_eligibility().await
        };

        let fallback_reason = match eligibility {
            Eligibility::Ineligible(reason) => {
                tracing::info!("High-performance backend skipped: {reason}");
                reason
            }
            Eligibility::Eligible => match self.try_high_performance().await {
                Ok(backend) => {
                    self.activate(backend, BackendKind::HighPerformance, started, None);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!("{err}; falling back to the portable backend");
                    err.reason
                }
            },
        };

        tracing::info!("Loading {} with the portable backend", self.model.display_name);
        match self.portable.load(self.model).await {
            Ok(backend) => {
                self.activate(backend, BackendKind::Portable, started, Some(fallback_reason));
                Ok(())
            }
            Err(err) => {
                tracing::error!("{err}");
                self.handle.set_failed(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Eligibility may shell out to an install check, so it runs on the blocking pool
    async fn check_eligibility(&self) -> Eligibility {
        let loader = Arc::clone(&self.high_performance);
        let host = self.host.clone();
        match tokio::task::spawn_blocking(move || loader.eligibility(&host)).await {
            Ok(eligibility) => eligibility,
            Err(join_err) => Eligibility::Ineligible(format!("eligibility check failed: {join_err}")),
        }
    }

    /// Load attempt isolated on its own task so a panicking loader counts as a failure
    async fn try_high_performance(&self) -> std::result::Result<Arc<dyn Backend>, LoadError> {
        tracing::info!(
            "Loading {} with the high-performance backend",
            self.model.display_name
        );
        let loader = Arc::clone(&self.high_performance);
        let model = self.model;
        match tokio::spawn(async move { loader.load(model).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(LoadError::new(
                BackendKind::HighPerformance,
                format!("loader aborted: {join_err}"),
            )),
        }
    }

    fn activate(
        &self,
        backend: Arc<dyn Backend>,
        kind: BackendKind,
        started: Instant,
        fallback_reason: Option<String>,
    ) {
        let load_time = started.elapsed();
        tracing::info!(
            "{} ready on the {kind} backend in {:.1}s",
            self.model.display_name,
            load_time.as_secs_f32()
        );
        self.handle.set_ready(ActiveBackend {
            backend,
            kind,
            load_time,
            fallback_reason,
        });
    }

    /// Start generating and return the deltas as they arrive.
    ///
    /// Cancelling `cancel` stops the stream at the next delta and asks the
    /// worker to stop; the stream then ends within the grace period.
    pub async fn stream_generate(
        &self,
        mut conversation: Conversation,
        params: GenerationConfig,
        mut images: Vec<ImagePayload>,
        cancel: CancellationToken,
    ) -> Result<TokenStream> {
        let active = self.handle.active().ok_or(Error::EngineNotReady)?;

        if !self.model.supports_images && (!images.is_empty() || conversation.image_ref_count() > 0) {
            tracing::warn!(
                "{} is text-only; dropping {} attached image(s)",
                self.model.display_name,
                images.len()
            );
            images.clear();
            conversation.strip_images();
        }

        let prompt = self
            .build_prompt(active.backend.as_ref(), &conversation, images.len())
            .await?;
        tracing::debug!(
            "Prompt: {} chars, {} image(s), max_tokens={}",
            prompt.len(),
            images.len(),
            params.max_tokens
        );

        let request = BackendRequest {
            prompt,
            images,
            params,
        };
        Ok(spawn_worker(
            Arc::clone(&active.backend),
            request,
            cancel,
            self.grace_period,
            self.channel_capacity,
        ))
    }

    /// Non-streaming generation: the concatenation of `stream_generate`
    pub async fn generate(
        &self,
        conversation: Conversation,
        params: GenerationConfig,
        images: Vec<ImagePayload>,
    ) -> Result<String> {
        let cancel = CancellationToken::new();
        let mut stream = self
            .stream_generate(conversation, params, images, cancel.clone())
            .await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta?);
        }
        cancel.cancel();
        Ok(text)
    }

    async fn build_prompt(
        &self,
        backend: &dyn Backend,
        conversation: &Conversation,
        image_count: usize,
    ) -> Result<String> {
        check_image_refs(conversation, image_count)?;
        if image_count == 0 {
            match backend.apply_chat_template(conversation).await {
                Some(Ok(prompt)) => return Ok(prompt),
                Some(Err(err)) => {
                    tracing::warn!("Native chat template failed ({err}); rendering manually")
                }
                None => {}
            }
        }
        let prompt = render(
            conversation,
            RenderOptions {
                image_count,
                image_placeholder: backend.image_placeholder(),
            },
        )?;
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{ScriptedBackend, ScriptedLoader};
    use crate::model::lookup;
    use crate::prompt::{ContentPart, ConversationTurn, Role};

    fn host() -> HostFacts {
        HostFacts {
            platform: "linux".to_string(),
            gpu: None,
        }
    }

    fn engine(
        model_key: &str,
        high_performance: ScriptedLoader,
        portable: ScriptedLoader,
    ) -> (HybridEngine, Arc<ScriptedLoader>, Arc<ScriptedLoader>) {
        let hp = Arc::new(high_performance);
        let portable = Arc::new(portable);
        let engine = HybridEngine::new(
            lookup(model_key).unwrap(),
            host(),
            hp.clone(),
            portable.clone(),
        )
        .with_grace_period(Duration::from_millis(500));
        (engine, hp, portable)
    }

    fn question() -> Conversation {
        Conversation::new().with_turn(Role::User, "Is this normal?")
    }

    #[tokio::test]
    async fn test_high_performance_preferred_when_eligible() {
        let (engine, hp, portable) = engine(
            "4",
            ScriptedLoader::ready(BackendKind::HighPerformance, ScriptedBackend::incremental(["a"])),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["b"])),
        );
        engine.load().await.unwrap();

        let active = engine.active().unwrap();
        assert_eq!(active.kind, BackendKind::HighPerformance);
        assert!(active.fallback_reason.is_none());
        assert_eq!(hp.attempts(), 1);
        assert_eq!(portable.attempts(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_when_high_performance_fails() {
        let (engine, hp, portable) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "CUDA out of memory"),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["ok"])),
        );
        engine.load().await.unwrap();

        let active = engine.active().unwrap();
        assert_eq!(active.kind, BackendKind::Portable);
        assert_eq!(active.fallback_reason.as_deref(), Some("CUDA out of memory"));
        assert_eq!(hp.attempts(), 1);
        assert_eq!(portable.attempts(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_high_performance_is_never_tried() {
        let (engine, hp, _) = engine(
            "4",
            ScriptedLoader::ready(BackendKind::HighPerformance, ScriptedBackend::incremental(["a"]))
                .ineligible("compute capability 7.5 below 8.0"),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["b"])),
        );
        engine.load().await.unwrap();
        assert_eq!(hp.attempts(), 0);
        assert_eq!(
            engine.active().unwrap().fallback_reason.as_deref(),
            Some("compute capability 7.5 below 8.0")
        );
    }

    #[tokio::test]
    async fn test_force_portable() {
        let (engine, hp, _) = engine(
            "4",
            ScriptedLoader::ready(BackendKind::HighPerformance, ScriptedBackend::incremental(["a"])),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["b"])),
        );
        let engine = engine.with_force_portable(true);
        engine.load().await.unwrap();
        assert_eq!(hp.attempts(), 0);
        assert_eq!(engine.active().unwrap().kind, BackendKind::Portable);
    }

    #[tokio::test]
    async fn test_both_failing_is_fatal_and_final() {
        let (engine, _, _) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "no sglang"),
            ScriptedLoader::failing(BackendKind::Portable, "llama-server not found"),
        );
        let err = engine.load().await.unwrap_err();
        assert!(matches!(err, Error::Load(ref e) if e.backend == BackendKind::Portable));
        assert_eq!(engine.status(), EngineStatus::Failed);
        assert!(matches!(engine.load().await, Err(Error::LoadAttempted)));
    }

    #[tokio::test]
    async fn test_generate_before_load_is_not_ready() {
        let (engine, _, _) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["b"])),
        );
        let result = engine
            .stream_generate(question(), GenerationConfig::default(), Vec::new(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::EngineNotReady)));
    }

    #[tokio::test]
    async fn test_generate_equals_stream_concatenation() {
        let script = ["The ", "lungs ", "appear ", "clear."];
        let (engine, _, _) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(script)),
        );
        engine.load().await.unwrap();

        let streamed: String = engine
            .stream_generate(question(), GenerationConfig::default(), Vec::new(), CancellationToken::new())
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        let full = engine
            .generate(question(), GenerationConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(streamed, full);
        assert_eq!(full, "The lungs appear clear.");
    }

    #[tokio::test]
    async fn test_native_template_preferred_for_text_only_requests() {
        let (engine, _, portable) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(
                BackendKind::Portable,
                ScriptedBackend::incremental(["ok"]).with_native_template(),
            ),
        );
        engine.load().await.unwrap();
        engine
            .generate(question(), GenerationConfig::default(), Vec::new())
            .await
            .unwrap();

        let requests = portable.backend().unwrap().requests();
        assert_eq!(requests[0].prompt, "native:user: Is this normal?");
    }

    #[tokio::test]
    async fn test_broken_native_template_falls_back_to_manual() {
        let (engine, _, portable) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(
                BackendKind::Portable,
                ScriptedBackend::incremental(["ok"]).with_broken_template(),
            ),
        );
        engine.load().await.unwrap();
        engine
            .generate(question(), GenerationConfig::default(), Vec::new())
            .await
            .unwrap();

        let prompt = &portable.backend().unwrap().requests()[0].prompt;
        assert_eq!(
            prompt,
            "<start_of_turn>user\nIs this normal?<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[tokio::test]
    async fn test_text_only_model_drops_image_refs() {
        let (engine, _, portable) = engine(
            "27t",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["ok"])),
        );
        engine.load().await.unwrap();

        let conversation = Conversation {
            turns: vec![ConversationTurn {
                role: Role::User,
                content: vec![ContentPart::Image(0), ContentPart::Text("Describe.".into())],
            }],
        };
        engine
            .generate(conversation, GenerationConfig::default(), Vec::new())
            .await
            .unwrap();

        let request = &portable.backend().unwrap().requests()[0];
        assert_eq!(request.image_count, 0);
        assert!(!request.prompt.contains("<start_of_image>"));
    }

    #[tokio::test]
    async fn test_worker_failure_surfaces_as_error() {
        use crate::engine::scripted::Step;
        use crate::engine::OutputMode;
        use crate::error::BackendError;

        let backend = ScriptedBackend::new(
            OutputMode::Incremental,
            vec![Step::Fail(BackendError::from_runtime_message("out of memory"))],
        );
        let (engine, _, _) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(BackendKind::Portable, backend),
        );
        engine.load().await.unwrap();
        let err = engine
            .generate(question(), GenerationConfig::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GpuResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_image_refs_checked_before_native_template() {
        let (engine, _, portable) = engine(
            "4",
            ScriptedLoader::failing(BackendKind::HighPerformance, "x"),
            ScriptedLoader::ready(
                BackendKind::Portable,
                ScriptedBackend::incremental(["ok"]).with_native_template(),
            ),
        );
        engine.load().await.unwrap();

        let conversation = Conversation {
            turns: vec![ConversationTurn {
                role: Role::User,
                content: vec![ContentPart::Image(0), ContentPart::Text("Describe.".into())],
            }],
        };
        let err = engine
            .generate(conversation, GenerationConfig::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Format(crate::prompt::FormatError::ImageCountMismatch { index: 0, available: 0 })
        ));
        assert!(portable.backend().unwrap().requests().is_empty());
    }

    #[tokio::test]
    async fn test_slow_eligibility_check_does_not_stall_the_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (engine, _, _) = engine(
            "4",
            ScriptedLoader::ready(BackendKind::HighPerformance, ScriptedBackend::incremental(["a"]))
                .with_slow_eligibility(Duration::from_millis(300)),
            ScriptedLoader::ready(BackendKind::Portable, ScriptedBackend::incremental(["b"])),
        );

        // Single-threaded runtime: the ticker only advances while load() yields.
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        engine.load().await.unwrap();
        ticker.abort();

        assert_eq!(engine.active().unwrap().kind, BackendKind::HighPerformance);
        assert!(ticks.load(Ordering::Relaxed) >= 5, "runtime stalled during eligibility");
    }
}
