//! External inference runtimes
//!
//! Both backends drive a separate server process over HTTP: SGLang for the
//! high-performance tier and llama.cpp's `llama-server` for the portable
//! tier. This module owns the shared plumbing: install probes, launching
//! (or attaching to) the process, health polling and SSE decoding.

mod llamacpp;
mod sglang;
mod sse;

pub use llamacpp::{LlamaCppBackend, LlamaCppLoader};
pub use sglang::{SglangBackend, SglangLoader};

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Response, Url};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::backend::{BackendKind, ChunkSink};
use crate::config::RuntimeLauncher;
use crate::error::{BackendError, LoadError};
use sse::{SseData, SseDecoder};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound for a single health request; never longer than the time left before the deadline
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_REQUEST_MIN: Duration = Duration::from_millis(100);

/// Check that the launcher's runtime is present on this host
pub(crate) fn check_installed(launcher: &RuntimeLauncher) -> Result<(), String> {
    let Some(program) = &launcher.program else {
        // Attach mode: someone else runs the server.
        return Ok(());
    };

    if let Some((probe, probe_args)) = launcher.probe.split_first() {
        let status = std::process::Command::new(probe)
            .args(probe_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        return match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(format!("runtime not installed (`{}` failed)", launcher.probe.join(" "))),
            Err(err) => Err(format!("runtime probe `{probe}` could not run: {err}")),
        };
    }

    which::which(program)
        .map(|_| ())
        .map_err(|_| format!("`{program}` not found on PATH"))
}

/// A running runtime server, spawned by us or attached to
pub(crate) struct RuntimeProcess {
    base: Url,
    client: Client,
    // Held for kill_on_drop.
    _child: Option<Child>,
}

impl RuntimeProcess {
    /// Launch (or attach to) the runtime and wait until `health_path` answers 200
    pub(crate) async fn start(
        kind: BackendKind,
        launcher: &RuntimeLauncher,
        runtime_args: Vec<String>,
        env: Vec<(String, String)>,
        health_path: &str,
    ) -> Result<Self, LoadError> {
        let fail = |reason: String| LoadError::new(kind, reason);
        let base = Url::parse(&launcher.endpoint)
            .map_err(|e| fail(format!("invalid endpoint '{}': {e}", launcher.endpoint)))?;
        let client = Client::builder()
            .build()
            .map_err(|e| fail(format!("failed to build HTTP client: {e}")))?;

        let last_log_line = Arc::new(Mutex::new(None::<String>));
        let mut child = match &launcher.program {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.args(&launcher.args)
                    .args(&runtime_args)
                    .args(&launcher.extra_args)
                    .envs(env)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);

                tracing::info!(
                    "Starting {kind} runtime: {} {} {}",
                    program,
                    launcher.args.join(" "),
                    runtime_args.join(" ")
                );
                let mut child = cmd
                    .spawn()
                    .map_err(|e| fail(format!("failed to start `{program}`: {e}")))?;
                if let Some(stderr) = child.stderr.take() {
                    forward_logs(kind, stderr, Arc::clone(&last_log_line));
                }
                Some(child)
            }
            None => {
                tracing::info!("Attaching to {kind} runtime at {base}");
                None
            }
        };

        let health = base
            .join(health_path)
            .map_err(|e| fail(format!("invalid health path: {e}")))?;
        let deadline = Instant::now() + launcher.startup_timeout();

        loop {
            if let Some(child) = child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let detail = last_log_line
                        .lock()
                        .clone()
                        .map(|line| format!(": {line}"))
                        .unwrap_or_default();
                    return Err(fail(format!("runtime exited with {status}{detail}")));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = remaining.clamp(HEALTH_REQUEST_MIN, HEALTH_REQUEST_TIMEOUT);
            match client.get(health.clone()).timeout(attempt).send().await {
                Ok(resp) if resp.status().is_success() => break,
                Ok(resp) => tracing::debug!("{kind} runtime not ready yet ({})", resp.status()),
                Err(err) => tracing::debug!("{kind} runtime not reachable yet: {err}"),
            }

            if Instant::now() >= deadline {
                return Err(fail(format!(
                    "runtime did not become healthy within {}s",
                    launcher.startup_timeout_secs
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Ok(Self {
            base,
            client,
            _child: child,
        })
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Request(format!("invalid runtime URL: {e}")))
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
}

/// Relay runtime stderr into our logs, remembering the last line for load errors
fn forward_logs(
    kind: BackendKind,
    stderr: tokio::process::ChildStderr,
    last_line: Arc<Mutex<Option<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "medserver::runtime", "[{kind}] {line}");
            if !line.trim().is_empty() {
                *last_line.lock() = Some(line);
            }
        }
    });
}

/// Turn a non-2xx runtime response into a classified error
pub(crate) async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::from_runtime_message(format!("{status}: {body}")))
}

/// What a runtime payload contributes to the output
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    Chunk(String),
    /// Last payload of the response, possibly carrying a final chunk
    Last(Option<String>),
    Skip,
}

/// Read an SSE response, forwarding the chunks `parse` extracts into `sink`.
///
/// Ends on `[DONE]`, a `Payload::Last`, end of body, or cancellation.
pub(crate) async fn read_sse<F>(
    resp: Response,
    sink: &ChunkSink,
    mut parse: F,
) -> Result<(), BackendError>
where
    F: FnMut(serde_json::Value) -> Result<Payload, BackendError>,
{
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = sink.cancelled() => return Ok(()),
            next = body.next() => next,
        };

        let (events, finished) = match next {
            Some(Ok(bytes)) => (decoder.push(&bytes), false),
            Some(Err(err)) => return Err(BackendError::Request(err.to_string())),
            None => (decoder.finish().into_iter().collect(), true),
        };

        for event in events {
            match event {
                SseData::Done => return Ok(()),
                SseData::Json(json) => {
                    let value: serde_json::Value = serde_json::from_str(&json)
                        .map_err(|e| BackendError::Protocol(format!("{e}: {json}")))?;
                    if let Some(message) = error_message(&value) {
                        return Err(BackendError::from_runtime_message(message));
                    }
                    let (chunk, last) = match parse(value)? {
                        Payload::Chunk(chunk) => (Some(chunk), false),
                        Payload::Last(chunk) => (chunk, true),
                        Payload::Skip => (None, false),
                    };
                    if let Some(chunk) = chunk {
                        if !sink.send(chunk).await {
                            return Ok(());
                        }
                    }
                    if last {
                        return Ok(());
                    }
                }
            }
        }

        if finished {
            return Ok(());
        }
    }
}

/// Extract `error` from a runtime payload (string or `{message}` object)
fn error_message(value: &serde_json::Value) -> Option<String> {
    match value.get("error")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(message) => Some(message.clone()),
        other => Some(
            other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}
