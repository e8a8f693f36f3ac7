//! Outbound sender: chunked delivery with fallback, file-attached send.

use serenity::all::ChannelId;
use tracing::{info, warn};

use crate::channels::formatting::split_message;
use crate::events::{Event, OutboundPayload, OutboundSource};
use crate::worker::TerminalEventError;

use super::HandlerContext;

/// Discord's hard per-message limit.
const MAX_MESSAGE_LEN: usize = 2000;

/// Sent when chunking leaves nothing and the source expects a reply.
const FALLBACK_MESSAGE: &str = "(the agent returned an empty response)";

/// Deliver one outbound request. Returns the number of messages sent.
pub async fn handle(ctx: &HandlerContext, event: &Event) -> anyhow::Result<u32> {
    let payload: OutboundPayload = serde_json::from_value(event.payload.clone())
        .map_err(|e| TerminalEventError::new(format!("bad outbound payload: {}", e)))?;

    let channel_id = resolve_target(ctx, &payload).await?;
    let chunks = split_message(&payload.text, MAX_MESSAGE_LEN);

    if !payload.files.is_empty() {
        // The first chunk rides with the files; text-only chunks follow.
        let first_text = chunks.first().map(|s| s.as_str());
        ctx.api
            .send_with_files(channel_id, first_text, &payload.files)
            .await?;
        for chunk in chunks.iter().skip(1) {
            ctx.api.say(channel_id, chunk).await?;
        }
        let sent = chunks.len().max(1) as u32;
        info!(request_id = %payload.request_id, sent, files = payload.files.len(), "Outbound with files delivered");
        return Ok(sent);
    }

    if chunks.is_empty() {
        if payload.source == OutboundSource::Scheduler {
            info!(request_id = %payload.request_id, "Scheduler outbound had no content; dropping");
            return Ok(0);
        }
        if FALLBACK_MESSAGE.is_empty() {
            return Ok(0);
        }
        ctx.api.say(channel_id, FALLBACK_MESSAGE).await?;
        warn!(request_id = %payload.request_id, "Outbound was empty; sent fallback");
        return Ok(1);
    }

    for chunk in &chunks {
        ctx.api.say(channel_id, chunk).await?;
    }
    info!(
        request_id = %payload.request_id,
        source = payload.source.as_str(),
        sent = chunks.len(),
        context = payload.context.as_deref().unwrap_or(""),
        "Outbound delivered"
    );
    Ok(chunks.len() as u32)
}

/// Resolve the destination channel from either a user id (fetch the user's
/// DM channel) or a channel id. A non-sendable channel is terminal.
async fn resolve_target(
    ctx: &HandlerContext,
    payload: &OutboundPayload,
) -> anyhow::Result<ChannelId> {
    if let Some(user_id) = &payload.user_id {
        let user_u64: u64 = user_id
            .parse()
            .map_err(|_| TerminalEventError::new(format!("bad user id '{}'", user_id)))?;
        return ctx.api.dm_channel_for_user(user_u64).await;
    }

    if let Some(channel_id) = &payload.channel_id {
        let channel_u64: u64 = channel_id
            .parse()
            .map_err(|_| TerminalEventError::new(format!("bad channel id '{}'", channel_id)))?;
        return match ctx.api.fetch_dm_channel(channel_u64).await {
            Ok(id) => Ok(id),
            Err(e) if e.to_string().contains("not DM-capable") => {
                Err(TerminalEventError::new(format!(
                    "channel {} is not sendable: {}",
                    channel_id, e
                )))
            }
            Err(e) => Err(e),
        };
    }

    Err(TerminalEventError::new(
        "outbound payload has neither user_id nor channel_id",
    ))
}
