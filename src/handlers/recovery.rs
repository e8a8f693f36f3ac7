//! Reconcile and recovery sweeps.
//!
//! Reconcile repairs half-applied reactions after a crash by republishing
//! the affected DMs. Recovery pages forward from each user's delivery
//! offset after a reconnect and enqueues anything missed while offline.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::events::{DmIncomingPayload, DmState, EventInput, EventType, Lane};

use super::HandlerContext;

/// Per-sweep cap on each repair listing.
const RECONCILE_LIMIT: i64 = 50;

/// Reconciled DMs jump ahead of fresh traffic within the interactive lane.
const RECONCILE_PRIORITY: i64 = 15;

const RECOVERY_PRIORITY: i64 = 5;

/// Platform page size for the catch-up cursor.
const RECOVERY_PAGE: u8 = 100;

/// Repair pass: republish DMs whose 👀 or ✅ never landed, unless they are
/// already live in the queue.
pub async fn handle_reconcile(ctx: &HandlerContext) -> anyhow::Result<()> {
    let mut candidates = ctx.store.list_dm_missing_eye(RECONCILE_LIMIT).await?;
    candidates.extend(ctx.store.list_dm_missing_check(RECONCILE_LIMIT).await?);

    let mut seen: HashSet<String> = HashSet::new();
    let mut republished = 0u32;
    for dm in candidates {
        if !seen.insert(dm.message_id.clone()) {
            continue;
        }
        if ctx
            .store
            .has_active_dm_incoming_event(&dm.message_id)
            .await?
        {
            continue;
        }
        republish(ctx, &dm).await?;
        republished += 1;
    }

    if republished > 0 {
        info!(republished, "Reconcile republished half-done DMs");
    }
    Ok(())
}

async fn republish(ctx: &HandlerContext, dm: &DmState) -> anyhow::Result<()> {
    let payload = DmIncomingPayload {
        message_id: dm.message_id.clone(),
        channel_id: dm.channel_id.clone(),
        author_id: dm.author_id.clone(),
    };
    ctx.store
        .publish(EventInput::new(
            EventType::DmIncoming,
            Lane::Interactive,
            RECONCILE_PRIORITY,
            serde_json::to_value(&payload)?,
        ))
        .await?;
    Ok(())
}

/// Catch-up pass: for every allowed user, either seed the offset (first
/// sight of the user) or page forward from it and enqueue missed DMs.
pub async fn handle_recover(ctx: &HandlerContext) -> anyhow::Result<()> {
    for &user_id in &ctx.config.allowed_user_ids {
        recover_user(ctx, user_id).await?;
    }
    Ok(())
}

async fn recover_user(ctx: &HandlerContext, user_id: u64) -> anyhow::Result<()> {
    let scope = format!("dm_user:{}", user_id);
    let channel_id = ctx.api.dm_channel_for_user(user_id).await?;

    let Some(offset) = ctx.store.get_offset(&scope).await? else {
        // First sight: seed the watermark at the newest message so history
        // is not replayed into the agent.
        if let Some(latest) = ctx.api.latest_message_id(channel_id).await? {
            ctx.store.update_offset(&scope, &latest.to_string()).await?;
            info!(%scope, latest, "Seeded delivery offset");
        }
        return Ok(());
    };

    let mut cursor: u64 = match offset.parse() {
        Ok(id) => id,
        Err(_) => {
            warn!(%scope, %offset, "Offset is not numeric; skipping user");
            return Ok(());
        }
    };

    let mut enqueued = 0u32;
    loop {
        let page = ctx
            .api
            .messages_after(channel_id, cursor, RECOVERY_PAGE)
            .await?;
        if page.is_empty() {
            break;
        }
        let page_len = page.len();

        for msg in page {
            cursor = msg.id.get();
            ctx.store.update_offset(&scope, &cursor.to_string()).await?;

            if msg.author.id.get() != user_id || msg.author.bot {
                continue;
            }
            if msg.content.trim().is_empty() && msg.attachments.is_empty() {
                continue;
            }

            let message_id = cursor.to_string();
            if let Some(state) = ctx.store.get_dm_state(&message_id).await? {
                if state.processing_done || state.terminal_failed {
                    continue;
                }
            }
            if ctx.store.has_active_dm_incoming_event(&message_id).await? {
                continue;
            }

            let payload = DmIncomingPayload {
                message_id: message_id.clone(),
                channel_id: channel_id.get().to_string(),
                author_id: user_id.to_string(),
            };
            ctx.store
                .publish(EventInput::new(
                    EventType::DmIncoming,
                    Lane::Recovery,
                    RECOVERY_PRIORITY,
                    serde_json::to_value(&payload)?,
                ))
                .await?;
            enqueued += 1;
        }

        if page_len < RECOVERY_PAGE as usize {
            break;
        }
    }

    if enqueued > 0 {
        info!(user_id, enqueued, "Recovery enqueued missed DMs");
    }
    Ok(())
}
