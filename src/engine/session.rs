//! Per-request streaming sessions

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::TokenStream;
use crate::admission::AdmissionSlot;

/// What a client receives on a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    /// Normal completion, emitted once
    Done,
    /// Request-level failure; replaces `Done`
    Error(String),
    /// Stopped on request; no further tokens follow
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// An admitted stream
///
/// Holds the client's admission slot for as long as it lives. Dropping the
/// session, on any path, sets its cancellation token and frees the slot.
pub struct StreamSession {
    id: Uuid,
    identity: IpAddr,
    cancel: CancellationToken,
    started_at: Instant,
    state: SessionState,
    _slot: AdmissionSlot,
}

impl StreamSession {
    pub fn new(slot: AdmissionSlot) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            identity: slot.identity(),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            state: SessionState::Pending,
            _slot: slot,
        };
        tracing::debug!(session = %session.id, client = %session.identity, "stream admitted");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> IpAddr {
        self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token to hand to the engine. Cancelling it ends the session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drive `tokens` to completion, translating them into client events.
    ///
    /// The session moves into the returned stream, so dropping the stream
    /// (client disconnect) ends the session too.
    pub fn events(self, tokens: TokenStream) -> impl Stream<Item = StreamEvent> + Send {
        let mut session = self;
        let mut tokens = tokens;
        async_stream::stream! {
            session.state = SessionState::Streaming;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => None,
                    item = tokens.next() => Some(item),
                };

                match next {
                    Some(Some(Ok(delta))) => yield StreamEvent::Token(delta),
                    Some(Some(Err(err))) => {
                        tracing::error!(session = %session.id, "generation failed: {err}");
                        session.state = SessionState::Failed;
                        yield StreamEvent::Error(err.to_string());
                        break;
                    }
                    Some(None) if !session.cancel.is_cancelled() => {
                        session.state = SessionState::Completed;
                        yield StreamEvent::Done;
                        break;
                    }
                    Some(None) | None => {
                        // Let the engine stream run its bounded worker teardown.
                        while tokens.next().await.is_some() {}
                        session.state = SessionState::Cancelled;
                        yield StreamEvent::Cancelled;
                        break;
                    }
                }
            }
            session.cancel.cancel();
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.state == SessionState::Streaming {
            self.state = SessionState::Cancelled;
        }
        tracing::info!(
            session = %self.id,
            client = %self.identity,
            "stream {} after {:.1}s",
            self.state,
            self.started_at.elapsed().as_secs_f32()
        );
    }
}
