//! Stages 1–2: request-side preprocessing that runs before a driver is
//! ever dispatched.

use serde_json::Value;

use crate::context::PipelineContext;

/// Stage 1 — **TestMessageFilter**: short-circuits known liveness pings
/// (a single user message whose text is exactly this sentinel) with a
/// canned reply instead of spending an upstream call on it.
const LIVENESS_PING_TEXT: &str = "test connection, reply with ok";

pub fn is_liveness_ping(request: &Value) -> bool {
    let Some(messages) = request.get("messages").and_then(|m| m.as_array()) else {
        return false;
    };
    if messages.len() != 1 {
        return false;
    }
    let Some(text) = messages[0].get("content").and_then(message_text) else {
        return false;
    };
    text.trim().eq_ignore_ascii_case(LIVENESS_PING_TEXT)
}

fn message_text(content: &Value) -> Option<String> {
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    let blocks = content.as_array()?;
    Some(
        blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
    )
}

pub fn canned_reply(ctx: &PipelineContext) -> Value {
    serde_json::json!({
        "id": ctx.message_id,
        "type": "message",
        "role": "assistant",
        "model": ctx.client_requested_model,
        "content": [{"type": "text", "text": "ok"}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": 1},
    })
}

/// Stage 2 — **ToolResultAdapter**: reshapes inbound client `tool_result`
/// content blocks into the shape the selected driver's wire format
/// expects. Both drivers accept Anthropic's native block shape
/// (`{"type":"tool_result","tool_use_id":..,"content":..}`); the only
/// normalization needed is coercing a bare string `content` into the
/// single-text-block array form both upstreams require.
pub fn adapt_tool_results(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for message in messages {
        let Some(blocks) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            if let Some(text) = block.get("content").and_then(|c| c.as_str()) {
                let wrapped = serde_json::json!([{"type": "text", "text": text}]);
                block["content"] = wrapped;
            }
        }
    }
}
