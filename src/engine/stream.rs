//! Worker-backed token streams
//!
//! Generation runs on its own task and hands chunks to the consumer over a
//! bounded channel. The consumer side normalizes chunks to deltas, stops
//! yielding as soon as the caller's token is cancelled, and waits a bounded
//! time for the worker to wind down.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{Backend, BackendRequest, ChunkSink};
use super::delta::DeltaNormalizer;
use crate::error::{BackendError, Result};

/// Lazy sequence of text deltas
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

type WorkerResult = std::result::Result<(), BackendError>;

/// Run `request` on a dedicated task and expose its output as deltas
pub(crate) fn spawn_worker(
    backend: Arc<dyn Backend>,
    request: BackendRequest,
    cancel: CancellationToken,
    grace_period: Duration,
    channel_capacity: usize,
) -> TokenStream {
    // Child token: stopping the worker never marks the caller's stream cancelled.
    let worker_cancel = cancel.child_token();
    let (tx, mut rx) = mpsc::channel(channel_capacity.max(1));
    let sink = ChunkSink::new(tx, worker_cancel.clone());
    let mode = backend.output_mode();

    let handle = tokio::spawn(async move { backend.generate(request, sink).await });
    let mut guard = WorkerGuard {
        handle: Some(handle),
        cancel: worker_cancel,
        grace_period,
    };

    Box::pin(async_stream::stream! {
        let mut normalizer = DeltaNormalizer::new(mode);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };
            if let Some(delta) = normalizer.push(chunk) {
                yield Ok(delta);
            }
        }

        let outcome = guard.finish().await;
        if !cancel.is_cancelled() {
            if let Err(err) = outcome {
                yield Err(err.into());
            }
        }
    })
}

/// Owns the worker task; stops it on every exit path
struct WorkerGuard {
    handle: Option<JoinHandle<WorkerResult>>,
    cancel: CancellationToken,
    grace_period: Duration,
}

impl WorkerGuard {
    async fn finish(&mut self) -> WorkerResult {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.cancel.cancel();
        join_within(handle, self.grace_period).await
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.cancel();
        // Consumer went away mid-stream; reap the worker in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let grace_period = self.grace_period;
            runtime.spawn(async move {
                if let Err(err) = join_within(handle, grace_period).await {
                    tracing::debug!("abandoned generation worker ended with: {err}");
                }
            });
        }
    }
}

async fn join_within(mut handle: JoinHandle<WorkerResult>, grace_period: Duration) -> WorkerResult {
    match tokio::time::timeout(grace_period, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(BackendError::Worker(join_err.to_string())),
        Err(_) => {
            // Left running; it exits at its next cancellation check.
            tracing::warn!(
                "generation worker still running {:.1}s after stop was requested",
                grace_period.as_secs_f32()
            );
            Ok(())
        }
    }
}
