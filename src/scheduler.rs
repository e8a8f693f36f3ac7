//! Cron scheduler: one task per configured schedule, each firing published
//! as a `scheduler.triggered` event for the worker to claim.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ScheduleConfig;
use crate::events::{EventInput, EventStore, EventType, Lane, SchedulerPayload};

/// Firings older than this when claimed are dropped by the handler.
const FIRING_TTL_MINUTES: i64 = 15;

/// Build the payload for a firing at `triggered_at`.
pub fn firing_payload(schedule_name: &str, triggered_at: DateTime<Utc>) -> SchedulerPayload {
    SchedulerPayload {
        schedule_name: schedule_name.to_string(),
        triggered_at,
        expires_at: triggered_at + ChronoDuration::minutes(FIRING_TTL_MINUTES),
    }
}

/// Register every schedule as a background cron task.
pub fn spawn_schedules(
    store: Arc<EventStore>,
    schedules: &[ScheduleConfig],
    cancel: CancellationToken,
) {
    for schedule in schedules {
        let store = Arc::clone(&store);
        let schedule = schedule.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_schedule(store, schedule, cancel).await;
        });
    }
}

async fn run_schedule(store: Arc<EventStore>, schedule: ScheduleConfig, cancel: CancellationToken) {
    // Both parsed successfully at settings validation.
    let tz: Tz = match schedule.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            error!(schedule = %schedule.name, "Timezone no longer parses; not scheduling");
            return;
        }
    };
    let cron: Cron = match schedule.cron.parse() {
        Ok(cron) => cron,
        Err(e) => {
            error!(schedule = %schedule.name, "Cron no longer parses: {}", e);
            return;
        }
    };

    info!(
        schedule = %schedule.name,
        cron = %schedule.cron,
        timezone = %schedule.timezone,
        "Schedule registered"
    );

    loop {
        let now = Utc::now().with_timezone(&tz);
        let next = match cron.find_next_occurrence(&now, false) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule = %schedule.name, "No next occurrence: {}", e);
                return;
            }
        };

        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let triggered_at = next.with_timezone(&Utc);
        let payload = firing_payload(&schedule.name, triggered_at);
        let input = match serde_json::to_value(&payload) {
            Ok(value) => EventInput::new(EventType::SchedulerTriggered, Lane::Scheduled, 0, value),
            Err(e) => {
                error!(schedule = %schedule.name, "Failed to encode firing: {}", e);
                continue;
            }
        };

        match store.publish(input).await {
            Ok(event_id) => {
                info!(schedule = %schedule.name, event_id, %triggered_at, "Schedule fired");
            }
            Err(e) => {
                error!(schedule = %schedule.name, "Failed to publish firing: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firing_expires_fifteen_minutes_after_trigger() {
        let at = Utc::now();
        let payload = firing_payload("morning-plan", at);
        assert_eq!(payload.schedule_name, "morning-plan");
        assert_eq!(payload.expires_at - payload.triggered_at, ChronoDuration::minutes(15));
    }

    #[test]
    fn cron_next_occurrence_is_in_the_future() {
        let cron: Cron = "* * * * *".parse().unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = Utc::now().with_timezone(&tz);
        let next = cron.find_next_occurrence(&now, false).unwrap();
        assert!(next > now);
    }
}
