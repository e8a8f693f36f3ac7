//! Scheduler-triggered handler: render the schedule's prompt, invoke the
//! agent, and deliver (or skip) the result.

use chrono::{Local, Utc};
use tracing::{info, warn};

use crate::agent::{AgentCallOptions, AgentSource, SessionTarget};
use crate::channels::formatting::{is_skip_response, strip_think_tags};
use crate::config::{handoff_path, SessionMode, Settings};
use crate::events::{
    Event, EventInput, EventType, Lane, OutboundPayload, OutboundSource, SchedulerPayload,
};
use crate::utils::truncate_str;
use crate::worker::TerminalEventError;

use super::HandlerContext;

pub async fn handle(ctx: &HandlerContext, event: &Event) -> anyhow::Result<()> {
    let payload: SchedulerPayload = serde_json::from_value(event.payload.clone())
        .map_err(|e| TerminalEventError::new(format!("bad scheduler payload: {}", e)))?;

    // Back-pressure: a firing that sat in the queue through an outage is
    // stale, not worth running late.
    if Utc::now() > payload.expires_at {
        warn!(
            schedule = %payload.schedule_name,
            triggered_at = %payload.triggered_at,
            "Dropping expired schedule firing"
        );
        return Ok(());
    }

    // Reload so settings edits apply without a daemon restart.
    let settings = Settings::load(&ctx.settings_path)?;
    let Some(schedule) = settings.schedule(&payload.schedule_name) else {
        return Err(TerminalEventError::new(format!(
            "schedule '{}' no longer exists",
            payload.schedule_name
        )));
    };

    let prompt_text = match &schedule.prompt_file {
        Some(file) => tokio::fs::read_to_string(file).await.map_err(|e| {
            anyhow::anyhow!("prompt_file '{}' for '{}': {}", file, schedule.name, e)
        })?,
        None => schedule.prompt.clone(),
    };

    let session = match schedule.session_mode {
        SessionMode::Main => SessionTarget::Main,
        SessionMode::Isolated => SessionTarget::Isolated(schedule.name.clone()),
    };
    let options = AgentCallOptions::new(AgentSource::Scheduler, session);

    let reply = match ctx.agent.send_to_agent(&prompt_text, &settings, options).await {
        Ok(reply) => reply,
        Err(e) => {
            // Scheduler failures stay in the logs; only the auth path is
            // surfaced, and only when the schedule notifies at all.
            if crate::agent::is_auth_error(&e) && schedule.discord_notify {
                publish_notification(
                    ctx,
                    schedule.name.as_str(),
                    &payload,
                    OutboundSource::AuthError,
                    &truncate_str(
                        "Scheduled task failed: the agent CLI is not logged in. Run `claude /login` in the sandbox.",
                        1900,
                    ),
                )
                .await;
            }
            return Err(e);
        }
    };

    let cleaned = strip_think_tags(&reply.response);

    if schedule.skippable && is_skip_response(&cleaned) {
        info!(schedule = %schedule.name, "Schedule output marked [SKIP]; dropping");
        return Ok(());
    }

    if let Err(e) = write_handoff(&schedule.name, &cleaned).await {
        warn!(schedule = %schedule.name, "Failed to write handoff: {}", e);
    }

    if schedule.discord_notify {
        publish_notification(
            ctx,
            schedule.name.as_str(),
            &payload,
            OutboundSource::Scheduler,
            &cleaned,
        )
        .await;
    }

    Ok(())
}

async fn publish_notification(
    ctx: &HandlerContext,
    schedule_name: &str,
    payload: &SchedulerPayload,
    source: OutboundSource,
    text: &str,
) {
    // Scheduled output goes to the primary allowlisted user's DMs.
    let Some(user_id) = ctx.config.allowed_user_ids.first() else {
        warn!(schedule = schedule_name, "No allowed users to notify");
        return;
    };

    let outbound = OutboundPayload {
        request_id: uuid::Uuid::new_v4().to_string(),
        source,
        text: text.to_string(),
        user_id: Some(user_id.to_string()),
        channel_id: None,
        files: vec![],
        context: Some(format!("schedule {}", schedule_name)),
    };
    let value = match serde_json::to_value(&outbound) {
        Ok(v) => v,
        Err(e) => {
            warn!(schedule = schedule_name, "Failed to encode outbound: {}", e);
            return;
        }
    };
    let input = EventInput::new(EventType::OutboundDmRequest, Lane::Scheduled, 0, value).dedupe(
        format!(
            "outbound:schedule:{}:{}",
            schedule_name,
            payload.triggered_at.to_rfc3339()
        ),
    );
    if let Err(e) = ctx.store.publish(input).await {
        warn!(schedule = schedule_name, "Failed to publish outbound: {}", e);
    }
}

/// Persist the run's output as a dated markdown handoff.
async fn write_handoff(schedule_name: &str, text: &str) -> anyhow::Result<()> {
    let now = Local::now();
    let path = handoff_path(schedule_name, now);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = format!(
        "# {} ({})\n\n{}\n",
        schedule_name,
        now.format("%Y-%m-%d %H:%M"),
        text
    );
    tokio::fs::write(&path, content).await?;
    info!(path = %path.display(), "Schedule handoff written");
    Ok(())
}
