//! Stages 5–9: per-event transforms applied, in order, to every event the
//! parser emits. Each is a plain function over `(&mut PipelineContext,
//! Event) -> Vec<Event>` — a flat list, not a trait-object hierarchy — so
//! `apply_stages` is just a fold.

use crate::context::PipelineContext;
use crate::event::{ContentBlock, Delta, Event, MessageDelta};

/// Run one parsed event through stages 5–9 in order, returning the events
/// that should actually reach the client. May return more events than
/// went in (stop-sequence truncation synthesizes `message_delta` +
/// `message_stop`) or fewer (a `content_block_delta` consumed entirely by
/// truncation emits nothing of its own).
pub fn apply_stages(ctx: &mut PipelineContext, event: Event) -> Vec<Event> {
    if ctx.terminated {
        return vec![];
    }

    let event = model_injector(ctx, event);

    let Some(event) = event else { return vec![] };

    let (events, truncated) = stop_sequences_enforcer(ctx, event);
    let mut out = Vec::new();
    let was_terminated_by_tool_use = ctx.terminated_by_tool_use;
    for event in events {
        let event = tool_call_events(ctx, event);
        message_collector(ctx, &event);
        out.push(event);
    }

    if truncated {
        ctx.stop_reason = Some("stop_sequence".into());
        token_counter(ctx);
        out.push(Event::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some("stop_sequence".into()),
                stop_sequence: ctx.stop_sequence_hit.clone(),
            },
            usage: ctx.usage.clone(),
        });
        out.push(Event::MessageStop);
        ctx.terminated = true;
    } else if !was_terminated_by_tool_use && ctx.terminated_by_tool_use {
        // The content_block_stop that just closed a client tool_use block
        // already made it into `out` above; append the synthetic
        // message_delta/message_stop pair that ends the message here,
        // since a client tool call can't be followed by more content.
        ctx.stop_reason = Some("tool_use".into());
        token_counter(ctx);
        out.push(Event::MessageDelta {
            delta: MessageDelta { stop_reason: Some("tool_use".into()), stop_sequence: None },
            usage: ctx.usage.clone(),
        });
        out.push(Event::MessageStop);
        ctx.terminated = true;
    }

    out
}

/// Stage 5 — **ModelInjector**: force `message_start.message.model` to the
/// client-requested model name, since the upstream may report its
/// canonical internal form instead.
fn model_injector(ctx: &mut PipelineContext, mut event: Event) -> Option<Event> {
    if let Event::MessageStart { message } = &mut event {
        message.model = ctx.client_requested_model.clone();
        ctx.model = ctx.client_requested_model.clone();
    }
    Some(event)
}

/// Stage 6 — **StopSequencesEnforcer**: scans emitted text for a
/// client-supplied stop sequence. On match, truncates the current delta
/// at the match point; the caller appends the synthetic
/// `message_delta`/`message_stop` pair. Returns `(events, truncated)`.
fn stop_sequences_enforcer(ctx: &mut PipelineContext, event: Event) -> (Vec<Event>, bool) {
    if ctx.stop_sequences.is_empty() {
        return (vec![event], false);
    }

    let Event::ContentBlockDelta { index, delta: Delta::TextDelta { text } } = &event else {
        return (vec![event], false);
    };

    ctx.open_block_text.push_str(text);
    for seq in &ctx.stop_sequences {
        if let Some(pos) = ctx.open_block_text.find(seq.as_str()) {
            let already_emitted_len = ctx.open_block_text.len() - text.len();
            let truncated_delta = if pos >= already_emitted_len {
                text[..pos - already_emitted_len].to_string()
            } else {
                String::new()
            };
            ctx.stop_sequence_hit = Some(seq.clone());
            let truncated_event = Event::ContentBlockDelta {
                index: *index,
                delta: Delta::TextDelta { text: truncated_delta },
            };
            return (vec![truncated_event], true);
        }
    }

    (vec![event], false)
}

/// Stage 7 — **ToolCallEvents**: a client tool's `content_block_stop`
/// registers a pending call and ends the message with
/// `stop_reason = "tool_use"`. Server tools must never trigger this.
fn tool_call_events(ctx: &mut PipelineContext, event: Event) -> Event {
    if let Event::ContentBlockStop { index } = &event {
        if let Some(ContentBlock::ToolUse { name, .. }) = ctx.content.get(*index as usize) {
            if !is_server_tool(name) {
                ctx.terminated_by_tool_use = true;
            }
        }
    }
    event
}

fn is_server_tool(name: &str) -> bool {
    name.starts_with("web_search") || name.starts_with("code_execution")
}

/// Stage 8 — **MessageCollector**: applies every delta to the
/// materialized message.
fn message_collector(ctx: &mut PipelineContext, event: &Event) {
    match event {
        Event::MessageStart { message } => {
            ctx.message_id = message.id.clone();
            ctx.content = message.content.clone();
            ctx.usage = message.usage.clone();
            ctx.usage_reported_by_upstream = ctx.usage.input_tokens > 0 || ctx.usage.output_tokens > 0;
        }
        Event::ContentBlockStart { index, content_block } => {
            ctx.open_block_index = Some(*index);
            ctx.open_block_text.clear();
            let idx = *index as usize;
            if ctx.content.len() <= idx {
                ctx.content.resize(idx + 1, content_block.clone());
            } else {
                ctx.content[idx] = content_block.clone();
            }
        }
        Event::ContentBlockDelta { index, delta } => apply_delta(ctx, *index, delta),
        Event::ContentBlockStop { .. } => {
            ctx.open_block_index = None;
            ctx.open_block_text.clear();
        }
        Event::MessageDelta { delta, usage } => {
            ctx.stop_reason = delta.stop_reason.clone().or_else(|| ctx.stop_reason.clone());
            ctx.stop_sequence_hit = delta.stop_sequence.clone().or_else(|| ctx.stop_sequence_hit.clone());
            if usage.input_tokens > 0 || usage.output_tokens > 0 {
                ctx.usage = usage.clone();
                ctx.usage_reported_by_upstream = true;
            }
        }
        Event::MessageStop => {
            // A thinking block's signature defaults to "" and is only ever
            // appended to by SignatureDelta, so an unsigned block already
            // satisfies the §4.5 "fill with empty string" rule structurally.
            ctx.terminated = true;
        }
        Event::Error { .. } => {}
    }
}

fn apply_delta(ctx: &mut PipelineContext, index: u32, delta: &Delta) {
    let idx = index as usize;
    if ctx.content.len() <= idx {
        return;
    }
    match (&mut ctx.content[idx], delta) {
        (ContentBlock::Text { text, .. }, Delta::TextDelta { text: delta_text }) => {
            text.push_str(delta_text);
        }
        (ContentBlock::Thinking { thinking, .. }, Delta::ThinkingDelta { thinking: delta_text }) => {
            thinking.push_str(delta_text);
        }
        (ContentBlock::Thinking { signature, .. }, Delta::SignatureDelta { signature: sig }) => {
            signature.push_str(sig);
        }
        (ContentBlock::ToolUse { input, .. }, Delta::InputJsonDelta { partial_json }) => {
            merge_partial_json(input, partial_json);
        }
        (ContentBlock::Text { citations, .. }, Delta::CitationsDelta { citation }) => {
            citations.push(citation.clone());
        }
        _ => {}
    }
}

/// Tool-use input arrives as a stream of partial JSON fragments. Collected
/// raw; parsed once the block closes (callers needing the final value use
/// `serde_json::from_str` on the accumulated string at that point).
fn merge_partial_json(input: &mut serde_json::Value, fragment: &str) {
    let existing = input.as_str().unwrap_or_default();
    *input = serde_json::Value::String(format!("{existing}{fragment}"));
}

/// Stage 9 — **TokenCounter**: heuristic input/output estimate when
/// upstream never reported usage. Accuracy target unstated (Open
/// Question); a simple chars/4 approximation, the common rough ratio for
/// English prose, documented as a heuristic rather than a guarantee.
pub fn token_counter(ctx: &mut PipelineContext) {
    if ctx.usage_reported_by_upstream {
        return;
    }
    let output_chars: usize = ctx.concatenated_text().len();
    ctx.usage.output_tokens = ((output_chars as f64) / 4.0).ceil() as u32;
    let input_chars: usize = ctx
        .request
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|msgs| msgs.iter().map(estimate_message_chars).sum())
        .unwrap_or(0);
    ctx.usage.input_tokens = ((input_chars as f64) / 4.0).ceil() as u32;
}

fn estimate_message_chars(message: &serde_json::Value) -> usize {
    match message.get("content") {
        Some(serde_json::Value::String(s)) => s.len(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(str::len)
            .sum(),
        _ => 0,
    }
}
