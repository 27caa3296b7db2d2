//! Derives a stable per-conversation session key for callers that never
//! send an explicit one.
//!
//! Prefers `metadata.user_id` when the client set it, otherwise hashes the
//! first user message so a multi-turn conversation keeps hitting the same
//! Web session (and, transitively, the same upstream conversation id)
//! without the client having to manage a key itself.

use serde_json::Value;
use sha2::{Digest, Sha256};

const MIN_MESSAGE_CHARS: usize = 3;

pub fn derive(request: &Value) -> String {
    if let Some(user_id) = request
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        && !user_id.is_empty()
    {
        return user_id.to_string();
    }

    let mut hasher = Sha256::new();
    let mut found = false;

    if let Some(messages) = request.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if message.get("role").and_then(|r| r.as_str()) != Some("user") {
                continue;
            }
            let text = message_text(message);
            let trimmed = text.trim();
            if trimmed.chars().count() >= MIN_MESSAGE_CHARS {
                hasher.update(trimmed.as_bytes());
                found = true;
                break;
            }
        }

        if !found && let Some(last) = messages.last() {
            hasher.update(last.to_string().as_bytes());
        }
    }

    let hex = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hex[..16])
}

fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
