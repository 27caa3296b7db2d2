//! Stage 11 — **StreamingEmitter** / **NonStreamingEmitter**: the two
//! terminal stages, selected by the client's `stream` flag: an
//! `async_stream::stream!` over the upstream-derived event stream, wrapped
//! in `axum::response::sse::Sse`.

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::Error;
use crate::event::Event;

pub fn non_streaming_response(message: Value) -> Response {
    Json(message).into_response()
}

pub fn streaming_response(mut frames: BoxStream<'static, Result<Vec<Event>, Error>>) -> Response {
    let stream = async_stream::stream! {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(events) => {
                    for event in events {
                        let data = serde_json::to_string(&event).unwrap_or_default();
                        yield Ok::<_, std::convert::Infallible>(
                            SseEvent::default().event(event.sse_event_name()).data(data),
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream terminated mid-response");
                    let data = serde_json::json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": e.to_string()},
                    });
                    yield Ok(SseEvent::default().event("error").data(data.to_string()));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_streaming_response_is_json() {
        let response = non_streaming_response(serde_json::json!({"type": "message"}));
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
