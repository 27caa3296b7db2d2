//! `PipelineContext`: the per-request mutable bag every stage closes over.
//! A flat struct rather than a class hierarchy, per the "coroutine
//! pipeline of stage objects" REDESIGN FLAG — stages are plain functions
//! that read and mutate this value, not objects with their own state.

use crate::event::{ContentBlock, Usage};
use serde_json::Value;

pub struct PipelineContext {
    /// The client's original request body, unmodified.
    pub request: Value,
    pub account_id: String,
    pub client_requested_model: String,
    pub client_requested_stream: bool,
    pub stop_sequences: Vec<String>,

    /// Materialized message under construction — what a non-streaming
    /// caller receives verbatim, and what a streaming caller would arrive
    /// at by applying every emitted delta.
    pub message_id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub stop_sequence_hit: Option<String>,
    pub usage: Usage,
    pub usage_reported_by_upstream: bool,

    /// Index of the content block currently open (per `content_block_start`
    /// / `content_block_stop` bracketing), if any.
    pub open_block_index: Option<u32>,
    /// Accumulated text for the open block, used by `StopSequencesEnforcer`
    /// to scan across delta boundaries.
    pub open_block_text: String,

    /// Tool-result `knowledge` payloads consumed internally by the
    /// collector but never re-emitted downstream (§4.5 EventParser rule).
    pub dropped_knowledge: Vec<Value>,

    pub terminated_by_tool_use: bool,
    pub terminal_error: Option<String>,

    /// Set once a `message_stop` (natural or synthesized by
    /// `StopSequencesEnforcer`/`ToolCallEvents`) has been emitted. The
    /// pipeline stops pulling further upstream frames once this is true, so
    /// a forced early stop actually ends the client-visible stream instead
    /// of just flagging it.
    pub terminated: bool,
}

impl PipelineContext {
    pub fn new(request: Value, account_id: String) -> Self {
        let client_requested_model = request
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let client_requested_stream = request
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let stop_sequences = request
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        Self {
            request,
            account_id,
            model: client_requested_model.clone(),
            client_requested_model,
            client_requested_stream,
            stop_sequences,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence_hit: None,
            usage: Usage::default(),
            usage_reported_by_upstream: false,
            open_block_index: None,
            open_block_text: String::new(),
            dropped_knowledge: Vec::new(),
            terminated_by_tool_use: false,
            terminal_error: None,
            terminated: false,
        }
    }

    /// The fully materialized non-streaming message body, built once the
    /// stream reaches `message_stop`.
    pub fn materialized_message(&self) -> Value {
        serde_json::json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": self.content,
            "stop_reason": self.stop_reason,
            "stop_sequence": self.stop_sequence_hit,
            "usage": self.usage,
        })
    }

    pub fn concatenated_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}
