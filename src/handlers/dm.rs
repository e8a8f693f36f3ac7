//! DM lifecycle handler: 👀 → agent call → reply → ✅, all flag-gated in
//! durable state so replays skip completed work.

use std::sync::Arc;
use std::time::Duration;

use serenity::all::{ChannelId, Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentCallOptions, AgentReply, AgentSource, SessionTarget};
use crate::channels::DiscordApi;
use crate::events::{
    DmIncomingPayload, Event, EventInput, EventType, FileDescriptor, Lane, OutboundPayload,
    OutboundSource,
};
use crate::utils::truncate_str;
use crate::worker::{AttachmentError, TerminalEventError};

use super::HandlerContext;

pub const EYE: &str = "👀";
pub const CHECK: &str = "✅";
pub const CROSS: &str = "❌";

/// Empty agent responses are retried this many extra times.
const EMPTY_RETRY_EXTRA: usize = 3;
const EMPTY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Discord shows "typing…" for ~10 s per ping; refresh just under that.
const TYPING_INTERVAL: Duration = Duration::from_secs(9);

/// Error replies stay under Discord's 2000-char limit with headroom.
const ERROR_REPLY_LIMIT: usize = 1900;

const AUTH_RECOVERY_TEXT: &str = "\
The agent CLI is not logged in, so I can't process messages right now.

To fix it:
1. Open a shell in the sandbox (or on the host if the sandbox is disabled).
2. Run `claude /login` and finish the browser flow.
3. Send your message again; nothing queued was lost.";

pub async fn handle(ctx: &HandlerContext, event: &Event) -> anyhow::Result<()> {
    let payload: DmIncomingPayload = serde_json::from_value(event.payload.clone())
        .map_err(|e| TerminalEventError::new(format!("bad dm.incoming payload: {}", e)))?;

    ctx.store
        .upsert_dm(&payload.message_id, &payload.channel_id, &payload.author_id)
        .await?;
    let Some(state) = ctx.store.get_dm_state(&payload.message_id).await? else {
        return Ok(());
    };
    if state.terminal_failed {
        info!(message_id = %payload.message_id, "DM already terminally failed; skipping");
        return Ok(());
    }
    if state.check_applied {
        return Ok(());
    }

    let channel_u64: u64 = payload
        .channel_id
        .parse()
        .map_err(|_| TerminalEventError::new(format!("bad channel id '{}'", payload.channel_id)))?;
    let message_u64: u64 = payload
        .message_id
        .parse()
        .map_err(|_| TerminalEventError::new(format!("bad message id '{}'", payload.message_id)))?;

    // Fetch channel + message. Missing-channel/message platform codes are
    // classified terminal by the worker; a non-DM channel is terminal here.
    let channel_id = match ctx.api.fetch_dm_channel(channel_u64).await {
        Ok(id) => id,
        Err(e) if e.to_string().contains("not DM-capable") => {
            return Err(TerminalEventError::new(e.to_string()));
        }
        Err(e) => return Err(e),
    };
    let message = ctx.api.fetch_message(channel_id, message_u64).await?;

    let typing = spawn_typing_indicator(ctx.api.clone(), channel_id);
    let result = process_message(ctx, &payload, &state, channel_id, message_u64, &message).await;
    typing.cancel();
    result
}

async fn process_message(
    ctx: &HandlerContext,
    payload: &DmIncomingPayload,
    state: &crate::events::DmState,
    channel_id: ChannelId,
    message_u64: u64,
    message: &Message,
) -> anyhow::Result<()> {
    if !state.eye_applied {
        ctx.api.react(channel_id, message_u64, EYE).await?;
        ctx.store.mark_eye_applied(&payload.message_id).await?;
    }

    if !state.processing_done {
        let content = message.content.trim();
        match content {
            "!reset" => {
                ctx.sessions.clear(&SessionTarget::Main).await?;
                ctx.api
                    .say(channel_id, "Session cleared. Starting fresh conversation.")
                    .await?;
            }
            "!session" => {
                let reply = match ctx.sessions.read(&SessionTarget::Main).await {
                    Some(id) => format!("Current session: `{}`", id),
                    None => "No active session.".to_string(),
                };
                ctx.api.say(channel_id, &reply).await?;
            }
            _ => run_agent_step(ctx, payload, channel_id, message_u64, message).await?,
        }
        ctx.store.mark_processing_done(&payload.message_id).await?;
    }

    let check_applied = ctx
        .store
        .get_dm_state(&payload.message_id)
        .await?
        .map(|s| s.check_applied)
        .unwrap_or(false);
    if !check_applied {
        ctx.api.react(channel_id, message_u64, CHECK).await?;
        ctx.store.mark_check_applied(&payload.message_id).await?;
    }

    Ok(())
}

/// Invoke the agent through the empty-response retry wrapper and publish
/// the reply as an outbound event. Failures settle the DM with ❌ and a
/// user-visible line, then raise terminal.
async fn run_agent_step(
    ctx: &HandlerContext,
    payload: &DmIncomingPayload,
    channel_id: ChannelId,
    message_u64: u64,
    message: &Message,
) -> anyhow::Result<()> {
    let attachments = match download_attachments(payload, message).await {
        Ok(files) => files,
        Err(e) => {
            let line = format!("Attachment error: {}", e);
            publish_error_outbound(ctx, payload, &truncate_str(&line, ERROR_REPLY_LIMIT)).await;
            let _ = ctx.api.react(channel_id, message_u64, CROSS).await;
            return Err(AttachmentError::new(e.to_string()));
        }
    };

    let mut options = AgentCallOptions::new(AgentSource::Dm, SessionTarget::Main);
    options.author_id = Some(payload.author_id.clone());
    options.attachments = attachments;

    let agent = Arc::clone(&ctx.agent);
    let settings = Arc::clone(&ctx.settings);
    let content = message.content.clone();
    let call = move || {
        let agent = Arc::clone(&agent);
        let settings = Arc::clone(&settings);
        let options = options.clone();
        let content = content.clone();
        async move { agent.send_to_agent(&content, &settings, options).await }
    };

    match call_with_empty_retry(1 + EMPTY_RETRY_EXTRA, EMPTY_RETRY_DELAY, call).await {
        Ok((reply, attempts)) => {
            if attempts > 1 {
                info!(message_id = %payload.message_id, attempts, "Agent reply needed retries");
            }
            let outbound = OutboundPayload {
                request_id: uuid::Uuid::new_v4().to_string(),
                source: OutboundSource::DmReply,
                text: reply.response,
                user_id: None,
                channel_id: Some(payload.channel_id.clone()),
                files: vec![],
                context: Some(format!("reply to DM {}", payload.message_id)),
            };
            ctx.store
                .publish(
                    EventInput::new(
                        EventType::OutboundDmRequest,
                        Lane::Interactive,
                        0,
                        serde_json::to_value(&outbound)?,
                    )
                    .dedupe(format!("outbound:{}:reply", payload.message_id)),
                )
                .await?;
            Ok(())
        }
        Err(e) => {
            if crate::agent::is_auth_error(&e) {
                publish_error_outbound(
                    ctx,
                    payload,
                    &truncate_str(AUTH_RECOVERY_TEXT, ERROR_REPLY_LIMIT),
                )
                .await;
                let _ = ctx.api.react(channel_id, message_u64, CROSS).await;
                return Err(TerminalEventError::new(format!("agent auth error: {:#}", e)));
            }

            let _ = ctx.api.react(channel_id, message_u64, CROSS).await;
            let message = format!("{:#}", e);
            let _ = ctx
                .store
                .set_dm_last_error(&payload.message_id, &message)
                .await;
            Err(TerminalEventError::new(message))
        }
    }
}

/// Publish a user-facing error line with the `:error` dedupe key so a
/// replay cannot send it twice.
async fn publish_error_outbound(ctx: &HandlerContext, payload: &DmIncomingPayload, text: &str) {
    let outbound = OutboundPayload {
        request_id: uuid::Uuid::new_v4().to_string(),
        source: OutboundSource::AuthError,
        text: text.to_string(),
        user_id: None,
        channel_id: Some(payload.channel_id.clone()),
        files: vec![],
        context: Some(format!("error for DM {}", payload.message_id)),
    };
    let input = match serde_json::to_value(&outbound) {
        Ok(value) => EventInput::new(EventType::OutboundDmRequest, Lane::Interactive, 0, value)
            .dedupe(format!("outbound:{}:error", payload.message_id)),
        Err(e) => {
            warn!("Failed to encode error outbound: {}", e);
            return;
        }
    };
    if let Err(e) = ctx.store.publish(input).await {
        warn!(message_id = %payload.message_id, "Failed to publish error outbound: {}", e);
    }
}

/// Save the message's attachments under the per-message directory and
/// return descriptors for the agent prompt.
async fn download_attachments(
    payload: &DmIncomingPayload,
    message: &Message,
) -> anyhow::Result<Vec<FileDescriptor>> {
    if message.attachments.is_empty() {
        return Ok(vec![]);
    }

    let dir = crate::config::attachments_dir(&payload.message_id);
    tokio::fs::create_dir_all(&dir).await?;

    let mut files = Vec::new();
    for attachment in &message.attachments {
        let data = attachment
            .download()
            .await
            .map_err(|e| anyhow::anyhow!("download of {} failed: {}", attachment.filename, e))?;
        let dest = dir.join(&attachment.filename);
        tokio::fs::write(&dest, &data).await?;
        info!(
            file = %dest.display(),
            bytes = data.len(),
            "Saved DM attachment"
        );
        files.push(FileDescriptor {
            path: dest.display().to_string(),
            name: attachment.filename.clone(),
        });
    }
    Ok(files)
}

/// Periodic typing ping, first one immediate, until cancelled.
fn spawn_typing_indicator(api: DiscordApi, channel_id: ChannelId) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = api.broadcast_typing(channel_id).await {
                warn!("Typing indicator failed: {}", e);
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(TYPING_INTERVAL) => {}
            }
        }
    });
    cancel
}

/// Call `f` up to `attempts` times, returning the first reply whose trimmed
/// text is non-empty. Whitespace-only counts as empty. After the final
/// attempt the last reply is returned regardless; errors propagate
/// immediately. Also reports how many attempts ran.
pub(crate) async fn call_with_empty_retry<F, Fut>(
    attempts: usize,
    delay: Duration,
    mut f: F,
) -> anyhow::Result<(AgentReply, usize)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<AgentReply>>,
{
    debug_assert!(attempts >= 1);
    let mut last = None;
    for attempt in 1..=attempts {
        let reply = f().await?;
        if !reply.response.trim().is_empty() {
            return Ok((reply, attempt));
        }
        last = Some(reply);
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Ok((last.expect("at least one attempt"), attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(text: &str) -> AgentReply {
        AgentReply {
            response: text.to_string(),
            session_id: "s".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_retry_returns_first_nonempty() {
        let calls = AtomicUsize::new(0);
        let (result, attempts) = call_with_empty_retry(4, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match n {
                    0 | 1 => reply("  \n"),
                    _ => reply("finally"),
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(result.response, "finally");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_retry_returns_last_empty_reply() {
        let calls = AtomicUsize::new(0);
        let (result, attempts) = call_with_empty_retry(4, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(reply("   ")) }
        })
        .await
        .unwrap();

        assert_eq!(result.response.trim(), "");
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_retry_propagates_errors_immediately() {
        let calls = AtomicUsize::new(0);
        let result = call_with_empty_retry(4, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<AgentReply, _>(anyhow::anyhow!("agent exploded")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_nonempty_short_circuits_without_sleeping() {
        let (result, attempts) =
            call_with_empty_retry(4, Duration::from_secs(1), || async { Ok(reply("hi")) })
                .await
                .unwrap();
        assert_eq!(result.response, "hi");
        assert_eq!(attempts, 1);
    }
}
