//! Ties stages 1–11 together into the one entrypoint the orchestrator
//! calls per request.

use std::sync::Arc;

use account_registry::SelectedAccount;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use upstream::{Driver, DriverRequest, SessionContext};

use crate::context::PipelineContext;
use crate::emitter;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::parser;
use crate::request_prep;
use crate::stages;

pub struct Drivers {
    pub oauth: Arc<dyn Driver>,
    pub web: Arc<dyn Driver>,
}

/// What the orchestrator gets back from one pipeline run: the finished
/// HTTP response to hand to the client, and the account that actually
/// served it.
pub struct PipelineOutcome {
    pub response: axum::response::Response,
    pub account_id: String,
}

pub async fn run(
    mut body: Value,
    account: SelectedAccount,
    proxy_url: Option<String>,
    session: Option<SessionContext>,
    drivers: &Drivers,
) -> Result<PipelineOutcome> {
    let mut ctx = PipelineContext::new(body.clone(), account.id.clone());

    // Stage 1 — TestMessageFilter.
    if request_prep::is_liveness_ping(&body) {
        let reply = request_prep::canned_reply(&ctx);
        return Ok(PipelineOutcome {
            response: emitter::non_streaming_response(reply),
            account_id: account.id,
        });
    }

    // Stage 2 — ToolResultAdapter.
    request_prep::adapt_tool_results(&mut body);
    ctx.request = body.clone();

    // Stage 3 — DriverDispatch: OAuth if the account has a usable access
    // token, Web otherwise.
    let driver: &Arc<dyn Driver> = if account.access_token.is_some() {
        &drivers.oauth
    } else {
        &drivers.web
    };
    let request = DriverRequest {
        body,
        account: account.clone(),
        proxy_url,
        session,
    };
    let driver_response = driver.stream(request).await?;
    let account_id = driver_response.account_id;

    // Stage 4 — EventParser.
    let raw_frames: BoxStream<'static, Result<Vec<Event>>> =
        parser::parse(driver_response.bytes, |_knowledge| {
            // Knowledge payloads are sunk here for internal tool
            // continuity; preserved per §4.5 but not acted on further by
            // this implementation.
        });

    // Stage 10 — OverloadDetector: peek the first frame before committing
    // to a response. Error events pass through stages 5–9 unchanged, so
    // checking the raw frame here is equivalent to checking post-stage.
    let mut raw_frames = Box::pin(raw_frames);
    let first = raw_frames.next().await;
    if let Some(Ok(group)) = &first
        && let Some(kind) = overload_kind(group)
    {
        tracing::warn!(account_id = %account_id, kind, "upstream reported overload before first byte");
        return Err(Error::Overloaded);
    }

    let rewound: BoxStream<'static, Result<Vec<Event>>> = match first {
        Some(first) => Box::pin(stream::once(async { first }).chain(raw_frames)),
        None => Box::pin(stream::empty()),
    };

    // Stage 11 — StreamingEmitter / NonStreamingEmitter.
    let response = if ctx.client_requested_stream {
        let staged = rewound.scan(ctx, |ctx, frame| {
            // Once a message_stop (natural or synthesized by a stage that
            // forces early termination, e.g. a client tool_use stop) has
            // gone out, stop pulling further upstream frames — ending this
            // stream here is what actually closes the client's SSE
            // connection instead of just recording that it should.
            if ctx.terminated {
                return futures_util::future::ready(None);
            }
            futures_util::future::ready(Some(process_with_context(ctx, frame)))
        });
        emitter::streaming_response(Box::pin(staged))
    } else {
        drain_non_streaming(&mut ctx, rewound).await?;
        emitter::non_streaming_response(ctx.materialized_message())
    };

    Ok(PipelineOutcome { response, account_id })
}

fn overload_kind(events: &[Event]) -> Option<String> {
    events.iter().find_map(|e| match e {
        Event::Error { error } if error.kind.contains("overload") => Some(error.kind.clone()),
        _ => None,
    })
}

fn process_with_context(ctx: &mut PipelineContext, frame: Result<Vec<Event>>) -> Result<Vec<Event>> {
    let events = frame?;
    let mut out = Vec::new();
    for event in events {
        out.extend(stages::apply_stages(ctx, event));
    }
    Ok(out)
}

async fn drain_non_streaming(
    ctx: &mut PipelineContext,
    mut frames: BoxStream<'static, Result<Vec<Event>>>,
) -> Result<()> {
    while let Some(frame) = frames.next().await {
        process_with_context(ctx, frame)?;
        if ctx.terminated {
            break;
        }
    }
    stages::token_counter(ctx);
    Ok(())
}
