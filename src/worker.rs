//! The single event-worker loop: claim, dispatch, retry, dead-letter.
//!
//! Outbound work is gated on the connection supervisor's readiness barrier;
//! the retry policy lives here so handlers only decide *whether* an error
//! is terminal, not what to do about it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serenity::all::ChannelId;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channels::discord::{discord_error_code, is_terminal_discord_code};
use crate::connection::ConnectionSupervisor;
use crate::events::{backoff_ms, DmIncomingPayload, Event, EventStore, EventType};
use crate::handlers::{self, HandlerContext};

pub const MAX_ATTEMPTS: i64 = 20;

/// Locks older than this are reclaimed; holders are assumed dead.
const LOCK_TIMEOUT_MS: u64 = 120_000;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

const READY_WAIT: Duration = Duration::from_secs(60);

/// Marker for failures no retry can fix. The worker dead-letters the event
/// and settles DM side effects instead of retrying.
#[derive(Debug)]
pub struct TerminalEventError(pub String);

impl TerminalEventError {
    /// Convenience constructor producing an `anyhow::Error` directly.
    pub fn new(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(TerminalEventError(message.into()))
    }
}

impl fmt::Display for TerminalEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TerminalEventError {}

/// Marker carrying a handler's advisory retry delay.
#[derive(Debug)]
pub struct RetryAfterError {
    pub delay_ms: u64,
    pub message: String,
}

impl fmt::Display for RetryAfterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (retry after {}ms)", self.message, self.delay_ms)
    }
}

impl std::error::Error for RetryAfterError {}

/// Marker for attachment download failures; surfaced to the user with a
/// specific error line.
#[derive(Debug)]
pub struct AttachmentError(pub String);

impl AttachmentError {
    pub fn new(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(AttachmentError(message.into()))
    }
}

impl fmt::Display for AttachmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attachment error: {}", self.0)
    }
}

impl std::error::Error for AttachmentError {}

/// A failure is terminal when a handler raised one of the markers or the
/// platform answered with an error code retries cannot fix.
pub fn is_terminal(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if cause.downcast_ref::<TerminalEventError>().is_some() {
            return true;
        }
        if cause.downcast_ref::<AttachmentError>().is_some() {
            return true;
        }
    }
    if let Some(code) = discord_error_code(err) {
        return is_terminal_discord_code(code);
    }
    false
}

pub fn advisory_delay_ms(err: &anyhow::Error) -> Option<u64> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RetryAfterError>())
        .map(|e| e.delay_ms)
}

pub struct EventWorker {
    store: Arc<EventStore>,
    supervisor: Arc<ConnectionSupervisor>,
    ctx: Arc<HandlerContext>,
    worker_id: String,
    cancel: CancellationToken,
}

impl EventWorker {
    pub fn new(
        store: Arc<EventStore>,
        supervisor: Arc<ConnectionSupervisor>,
        ctx: Arc<HandlerContext>,
        cancel: CancellationToken,
    ) -> Self {
        let worker_id = format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        Self {
            store,
            supervisor,
            ctx,
            worker_id,
            cancel,
        }
    }

    /// Run until cancelled. Unexpected dispatch errors never kill the loop;
    /// they feed the retry policy.
    pub async fn run(self) {
        info!(worker_id = %self.worker_id, "Event worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Readiness gate: no claims while the gateway is down, so
            // half-processed work is not burned on a dead connection.
            if !self.supervisor.is_ready() {
                info!("Worker waiting for gateway readiness");
                let ready = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    ready = self.supervisor.wait_until_ready(READY_WAIT) => ready,
                };
                if ready {
                    info!("Gateway ready; worker resuming");
                }
                continue;
            }

            if let Err(e) = self.store.requeue_stale_processing(LOCK_TIMEOUT_MS).await {
                error!("Stale-lock requeue failed: {}", e);
            }

            match self.store.claim_next(&self.worker_id).await {
                Ok(Some(event)) => self.process(event).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    error!("Claim failed: {}", e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Event worker stopped");
    }

    async fn process(&self, event: Event) {
        let event_id = event.id;
        info!(
            event_id,
            event_type = %event.event_type,
            lane = %event.lane,
            attempt = event.attempt_count + 1,
            "Dispatching event"
        );

        match self.dispatch(&event).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_done(event_id).await {
                    error!(event_id, "mark_done failed: {}", e);
                }
            }
            Err(e) => self.settle_failure(&event, e).await,
        }
    }

    async fn dispatch(&self, event: &Event) -> anyhow::Result<()> {
        let event_type = EventType::parse(&event.event_type).ok_or_else(|| {
            TerminalEventError::new(format!("unknown event type '{}'", event.event_type))
        })?;

        match event_type {
            EventType::DmIncoming => handlers::dm::handle(&self.ctx, event).await,
            EventType::OutboundDmRequest => handlers::outbound::handle(&self.ctx, event)
                .await
                .map(|_| ()),
            EventType::SchedulerTriggered => handlers::schedule::handle(&self.ctx, event).await,
            EventType::DmRecoverRun => handlers::recovery::handle_recover(&self.ctx).await,
            EventType::DmReconcileRun => handlers::recovery::handle_reconcile(&self.ctx).await,
        }
    }

    async fn settle_failure(&self, event: &Event, err: anyhow::Error) {
        let message = format!("{:#}", err);

        if is_terminal(&err) {
            warn!(event_id = event.id, "Terminal failure: {}", message);
            self.settle_terminal_dm(event, &message).await;
            if let Err(e) = self.store.mark_dead(event.id, &message).await {
                error!(event_id = event.id, "mark_dead failed: {}", e);
            }
            return;
        }

        let next_attempt = event.attempt_count + 1;
        if next_attempt >= MAX_ATTEMPTS {
            warn!(event_id = event.id, "Max attempts reached: {}", message);
            self.settle_terminal_dm(event, "max attempts reached").await;
            if let Err(e) = self.store.mark_dead(event.id, "max attempts reached").await {
                error!(event_id = event.id, "mark_dead failed: {}", e);
            }
            return;
        }

        let delay = advisory_delay_ms(&err).unwrap_or_else(|| backoff_ms(next_attempt as u32));
        warn!(
            event_id = event.id,
            attempt = next_attempt,
            delay_ms = delay,
            "Retryable failure: {}",
            message
        );
        if let Err(e) = self.store.mark_retry(event.id, &message, delay).await {
            error!(event_id = event.id, "mark_retry failed: {}", e);
        }
    }

    /// When a `dm.incoming` event dies, the DM row is settled: ❌ so the
    /// user sees the failure, `terminal_failed` so nothing reprocesses it.
    async fn settle_terminal_dm(&self, event: &Event, error: &str) {
        if event.event_type != EventType::DmIncoming.as_str() {
            return;
        }
        let Ok(payload) = serde_json::from_value::<DmIncomingPayload>(event.payload.clone())
        else {
            return;
        };

        if let Err(e) = self
            .store
            .mark_dm_terminal_failure(&payload.message_id, error)
            .await
        {
            error!(message_id = %payload.message_id, "Failed to settle DM row: {}", e);
        }

        if let (Ok(channel_id), Ok(message_id)) = (
            payload.channel_id.parse::<u64>(),
            payload.message_id.parse::<u64>(),
        ) {
            if let Err(e) = self
                .ctx
                .api
                .react(ChannelId::new(channel_id), message_id, handlers::dm::CROSS)
                .await
            {
                warn!(message_id, "Failed to apply ❌ while settling: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_marker_is_terminal_even_when_wrapped() {
        let err = TerminalEventError::new("no fixing this");
        assert!(is_terminal(&err));

        let wrapped = err.context("while reacting");
        assert!(is_terminal(&wrapped));
    }

    #[test]
    fn ordinary_errors_are_retryable() {
        let err = anyhow::anyhow!("socket closed");
        assert!(!is_terminal(&err));
        assert_eq!(advisory_delay_ms(&err), None);
    }

    #[test]
    fn advisory_delay_is_read_from_the_chain() {
        let err = anyhow::Error::new(RetryAfterError {
            delay_ms: 7_500,
            message: "rate limited".to_string(),
        })
        .context("sending chunk");
        assert!(!is_terminal(&err));
        assert_eq!(advisory_delay_ms(&err), Some(7_500));
    }

    #[test]
    fn attachment_error_is_terminal_with_user_facing_prefix() {
        let err = AttachmentError::new("file too large");
        assert_eq!(
            format!("{}", err),
            "Attachment error: file too large"
        );
        assert!(is_terminal(&err));
        assert!(is_terminal(&err.context("while downloading")));
    }
}
