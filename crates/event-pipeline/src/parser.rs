//! Stage 4 — **EventParser**: decodes raw upstream SSE frames into this
//! crate's public `Event` schema, folding in the private→public mapping
//! table from §4.5. The exact wire shape of the private variants is an
//! open question (re-derived from observation, not a published spec); the
//! discriminants and field names below are this implementation's answer.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{Citation, Delta, Event};

/// Turn a raw upstream byte stream into a stream of `Result<Event>`,
/// applying the private→public mapping per frame. A frame that maps to
/// nothing (dropped private variant) yields no item; one JSON object can
/// still yield more than one public event in principle, so this returns a
/// stream of `Vec<Event>` groups, one group per upstream frame.
pub fn parse(
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    mut ctx_knowledge_sink: impl FnMut(Value) + Send + 'static,
) -> BoxStream<'static, Result<Vec<Event>>> {
    let source = bytes.map(|r| r.map_err(std::io::Error::other));
    let mut events = source.eventsource();

    Box::pin(async_stream::stream! {
        while let Some(frame) = events.next().await {
            match frame {
                Ok(frame) => {
                    let data = frame.data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(Error::UpstreamProtocol(format!("invalid SSE JSON: {e}")));
                            continue;
                        }
                    };
                    match map_raw_event(&value, &mut ctx_knowledge_sink) {
                        Ok(mapped) => yield Ok(mapped),
                        Err(e) => yield Err(e),
                    }
                }
                Err(e) => {
                    yield Err(Error::UpstreamProtocol(format!("SSE transport error: {e}")));
                    break;
                }
            }
        }
    })
}

fn map_raw_event(value: &Value, knowledge_sink: &mut impl FnMut(Value)) -> Result<Vec<Event>> {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::UpstreamProtocol("event missing type tag".into()))?;

    match kind {
        // Public variants pass through unchanged — just re-parse into our
        // typed representation so downstream stages operate on structured
        // data instead of raw JSON.
        "message_start" | "content_block_start" | "content_block_delta" | "content_block_stop"
        | "message_delta" | "message_stop" | "error" => {
            let event: Event = serde_json::from_value(value.clone())
                .map_err(|e| Error::UpstreamProtocol(format!("malformed {kind}: {e}")))?;
            Ok(vec![event])
        }

        // citation_start_delta => content_block_delta { citationsDelta }.
        "citation_start_delta" => {
            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let citation = value
                .get("citation")
                .cloned()
                .ok_or_else(|| Error::UpstreamProtocol("citation_start_delta missing citation".into()))?;
            let citation: Citation = serde_json::from_value(citation)
                .map_err(|e| Error::UpstreamProtocol(format!("malformed citation: {e}")))?;
            Ok(vec![Event::ContentBlockDelta {
                index,
                delta: Delta::CitationsDelta { citation },
            }])
        }

        // Dropped from the outbound stream entirely.
        "citation_end_delta" | "thinking_summary_delta" | "message_limit" => Ok(vec![]),

        // Private tool_result carrying a `knowledge` payload: the payload
        // is handed to the collector internally (tool continuity) but
        // never re-emitted downstream.
        "tool_result" if value.get("knowledge").is_some() => {
            knowledge_sink(value["knowledge"].clone());
            Ok(vec![])
        }

        // Unknown discriminants are dropped, never stored, per the
        // tagged-union REDESIGN FLAG.
        _ => Ok(vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_citation_start_delta_to_citations_delta() {
        let raw = serde_json::json!({
            "type": "citation_start_delta",
            "index": 1,
            "citation": {"type": "web_search_result_location", "url": "https://example.com", "title": "Ex", "cited_text": "text"}
        });
        let mapped = map_raw_event(&raw, &mut |_| {}).unwrap();
        assert_eq!(mapped.len(), 1);
        match &mapped[0] {
            Event::ContentBlockDelta { index, delta: Delta::CitationsDelta { citation } } => {
                assert_eq!(*index, 1);
                assert_eq!(citation.url.as_deref(), Some("https://example.com"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn drops_thinking_summary_delta() {
        let raw = serde_json::json!({"type": "thinking_summary_delta", "index": 0, "summary": "x"});
        let mapped = map_raw_event(&raw, &mut |_| {}).unwrap();
        assert!(mapped.is_empty());
    }

    #[test]
    fn drops_message_limit() {
        let raw = serde_json::json!({"type": "message_limit", "resetsAt": "2026-01-01T00:00:00Z"});
        assert!(map_raw_event(&raw, &mut |_| {}).unwrap().is_empty());
    }

    #[test]
    fn tool_result_with_knowledge_is_sunk_not_emitted() {
        let raw = serde_json::json!({"type": "tool_result", "tool_use_id": "t1", "knowledge": {"facts": ["a"]}});
        let mut sunk = Vec::new();
        let mapped = map_raw_event(&raw, &mut |k| sunk.push(k)).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(sunk.len(), 1);
    }

    #[test]
    fn unknown_discriminant_is_dropped() {
        let raw = serde_json::json!({"type": "some_future_event", "foo": "bar"});
        assert!(map_raw_event(&raw, &mut |_| {}).unwrap().is_empty());
    }

    #[test]
    fn public_message_stop_passes_through() {
        let raw = serde_json::json!({"type": "message_stop"});
        let mapped = map_raw_event(&raw, &mut |_| {}).unwrap();
        assert_eq!(mapped, vec![Event::MessageStop]);
    }
}
