//! Event bus types: lanes, statuses, payloads, and the backoff law.
//!
//! Every unit of queued work in the daemon is an [`Event`]. The store
//! (`events::store`) persists them; the worker claims and dispatches them.

pub mod store;

pub use store::{DmState, EventStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse priority bucket. Lane rank dominates numeric priority:
/// `interactive` beats `recovery` beats `scheduled` beats `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Interactive,
    Recovery,
    Scheduled,
    System,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Interactive => "interactive",
            Lane::Recovery => "recovery",
            Lane::Scheduled => "scheduled",
            Lane::System => "system",
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Lane::Interactive => 0,
            Lane::Recovery => 1,
            Lane::Scheduled => 2,
            Lane::System => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processing,
    Retry,
    Done,
    Dead,
}

impl EventStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "retry" => Some(EventStatus::Retry),
            "done" => Some(EventStatus::Done),
            "dead" => Some(EventStatus::Dead),
            _ => None,
        }
    }
}

/// The tag set the dispatcher is exhaustive over. Unknown tags read back
/// from the store are a terminal error in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    DmIncoming,
    OutboundDmRequest,
    SchedulerTriggered,
    DmRecoverRun,
    DmReconcileRun,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DmIncoming => "dm.incoming",
            EventType::OutboundDmRequest => "outbound.dm.request",
            EventType::SchedulerTriggered => "scheduler.triggered",
            EventType::DmRecoverRun => "dm.recover.run",
            EventType::DmReconcileRun => "dm.reconcile.run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dm.incoming" => Some(EventType::DmIncoming),
            "outbound.dm.request" => Some(EventType::OutboundDmRequest),
            "scheduler.triggered" => Some(EventType::SchedulerTriggered),
            "dm.recover.run" => Some(EventType::DmRecoverRun),
            "dm.reconcile.run" => Some(EventType::DmReconcileRun),
            _ => None,
        }
    }
}

/// Payload of a `dm.incoming` event. Snowflakes travel as decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmIncomingPayload {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundSource {
    DmReply,
    Scheduler,
    ManualSend,
    AuthError,
}

impl OutboundSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundSource::DmReply => "dm_reply",
            OutboundSource::Scheduler => "scheduler",
            OutboundSource::ManualSend => "manual_send",
            OutboundSource::AuthError => "auth_error",
        }
    }
}

/// A file to attach to an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: String,
    pub name: String,
}

/// Payload of an `outbound.dm.request` event. Exactly one of `user_id` /
/// `channel_id` is set; the sender resolves the target accordingly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub request_id: String,
    pub source: OutboundSource,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Payload of a `scheduler.triggered` event. Firings older than
/// `expires_at` are rejected by the handler (back-pressure after outages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerPayload {
    pub schedule_name: String,
    pub triggered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A row claimed from the bus. `event_type` stays a raw string so the
/// worker can reject unknown tags instead of failing the read.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub lane: String,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub attempt_count: i64,
    pub status: EventStatus,
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`EventStore::publish`].
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: EventType,
    pub lane: Lane,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    /// When set, the event is not claimable before this moment.
    pub available_at: Option<DateTime<Utc>>,
}

impl EventInput {
    pub fn new(event_type: EventType, lane: Lane, priority: i64, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            lane,
            priority,
            payload,
            dedupe_key: None,
            available_at: None,
        }
    }

    pub fn dedupe(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Exponential retry backoff: 1 s for the first attempt, doubling from
/// there, capped at 60 s. The reconnect loop follows the same law.
pub fn backoff_ms(attempt: u32) -> u64 {
    if attempt <= 1 {
        return 1_000;
    }
    let exp = attempt.min(10) - 1;
    (1_000u64 << exp).min(60_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(1), 1_000);
        assert_eq!(backoff_ms(2), 2_000);
        assert_eq!(backoff_ms(3), 4_000);
        assert_eq!(backoff_ms(6), 32_000);
        assert_eq!(backoff_ms(7), 60_000);
        assert_eq!(backoff_ms(10), 60_000);
        assert_eq!(backoff_ms(100), 60_000);
    }

    #[test]
    fn backoff_zero_attempt_is_floor() {
        assert_eq!(backoff_ms(0), 1_000);
    }

    #[test]
    fn lane_rank_order() {
        assert!(Lane::Interactive.rank() < Lane::Recovery.rank());
        assert!(Lane::Recovery.rank() < Lane::Scheduled.rank());
        assert!(Lane::Scheduled.rank() < Lane::System.rank());
    }

    #[test]
    fn event_type_round_trip() {
        for t in [
            EventType::DmIncoming,
            EventType::OutboundDmRequest,
            EventType::SchedulerTriggered,
            EventType::DmRecoverRun,
            EventType::DmReconcileRun,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("dm.unknown"), None);
    }

    #[test]
    fn outbound_payload_omits_empty_fields() {
        let payload = OutboundPayload {
            request_id: "r1".to_string(),
            source: OutboundSource::DmReply,
            text: "hi".to_string(),
            user_id: None,
            channel_id: Some("123".to_string()),
            files: vec![],
            context: None,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert!(v.get("user_id").is_none());
        assert!(v.get("files").is_none());
        assert_eq!(v["source"], "dm_reply");
    }
}
