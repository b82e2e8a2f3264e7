//! Server-sent event framing for generation streams
//!
//! Wire format, one event per line pair:
//! - `data: {"token": "<delta>"}`
//! - `data: [DONE]` after the last token
//! - `data: {"error": "<message>"}` instead of `[DONE]` on failure

use std::convert::Infallible;

use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::engine::StreamEvent;

#[derive(Serialize)]
struct TokenChunk<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct ErrorChunk<'a> {
    error: &'a str,
}

/// Map a session event to its SSE frame
pub fn to_sse_event(event: &StreamEvent) -> Event {
    let data = match event {
        StreamEvent::Token(token) => serde_json::to_string(&TokenChunk { token }),
        StreamEvent::Error(error) => serde_json::to_string(&ErrorChunk { error }),
        StreamEvent::Done | StreamEvent::Cancelled => return Event::default().data("[DONE]"),
    };
    Event::default().data(data.unwrap_or_default())
}

/// Build the `text/event-stream` response for a session
pub fn sse_response(events: impl Stream<Item = StreamEvent> + Send + 'static) -> Response {
    let frames = events.map(|event| Ok::<_, Infallible>(to_sse_event(&event)));

    let mut response = Sse::new(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
