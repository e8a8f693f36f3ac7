//! Durable event store backed by SQLite.
//!
//! One database file holds the prioritized work queue (`events`), the DM
//! lifecycle state (`dm_messages`), and the per-scope delivery watermarks
//! (`dm_offsets`). All writers go through this type; the single worker is
//! the only claimer.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::{Event, EventInput, EventStatus};

/// Transient contention with schema-migrating readers resolves well under
/// this budget; anything longer indicates a real problem.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// One row per user DM message ever seen. Flags only move false -> true.
#[derive(Debug, Clone)]
pub struct DmState {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub eye_applied: bool,
    pub processing_done: bool,
    pub check_applied: bool,
    pub terminal_failed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct EventStore {
    pool: SqlitePool,
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Compare two snowflakes, numerically when both parse, else as strings.
fn snowflake_newer(candidate: &str, existing: &str) -> bool {
    match (candidate.parse::<u64>(), existing.parse::<u64>()) {
        (Ok(c), Ok(e)) => c > e,
        _ => candidate > existing,
    }
}

impl EventStore {
    /// Open (creating if missing) the bus database and run migrations.
    pub async fn open(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        crate::db::migrations::migrate_bus(&pool).await?;
        info!(db_path, "Event store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // =========================================================================
    // Queue operations
    // =========================================================================

    /// Insert a new pending event. A dedupe-key collision is not an error:
    /// the existing event's id is returned and no new row appears.
    pub async fn publish(&self, input: EventInput) -> anyhow::Result<i64> {
        let now = Utc::now();
        let available_at = input.available_at.unwrap_or(now);
        let payload = serde_json::to_string(&input.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events
                (event_type, lane, priority, payload, dedupe_key, attempt_count,
                 status, available_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, 'pending', ?, ?, ?)
            ON CONFLICT(dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(input.event_type.as_str())
        .bind(input.lane.as_str())
        .bind(input.priority)
        .bind(&payload)
        .bind(&input.dedupe_key)
        .bind(available_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            let id = result.last_insert_rowid();
            debug!(
                id,
                event_type = input.event_type.as_str(),
                lane = input.lane.as_str(),
                "Published event"
            );
            return Ok(id);
        }

        // Collision path: hand back the id that already owns the key.
        let key = input
            .dedupe_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("insert affected no rows without a dedupe key"))?;
        let row = sqlx::query("SELECT id FROM events WHERE dedupe_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        let id: i64 = row.get("id");
        debug!(id, dedupe_key = key, "Publish deduplicated to existing event");
        Ok(id)
    }

    /// Atomically claim the best claimable event for `worker_id`.
    ///
    /// Ordering: lane rank ascending, then priority descending, then
    /// created_at ascending. The lock is taken with a conditional update so
    /// two claimers can never win the same row.
    pub async fn claim_next(&self, worker_id: &str) -> anyhow::Result<Option<Event>> {
        // A concurrent claimer may steal the selected row between the SELECT
        // and the UPDATE; the guard makes that visible and we re-select.
        for _ in 0..3 {
            let now = Utc::now();
            let candidate = sqlx::query(
                r#"
                SELECT id FROM events
                WHERE status IN ('pending', 'retry') AND available_at <= ?
                ORDER BY
                    CASE lane
                        WHEN 'interactive' THEN 0
                        WHEN 'recovery' THEN 1
                        WHEN 'scheduled' THEN 2
                        ELSE 3
                    END ASC,
                    priority DESC,
                    created_at ASC
                LIMIT 1
                "#,
            )
            .bind(now.to_rfc3339())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = candidate else {
                return Ok(None);
            };
            let id: i64 = row.get("id");

            let claimed = sqlx::query(
                r#"
                UPDATE events
                SET status = 'processing', locked_by = ?, locked_at = ?, updated_at = ?
                WHERE id = ? AND status IN ('pending', 'retry')
                "#,
            )
            .bind(worker_id)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return Ok(Some(self.get_event(id).await?));
            }
        }
        Ok(None)
    }

    async fn get_event(&self, id: i64) -> anyhow::Result<Event> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Self::row_to_event(&row)
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Event> {
        let status_raw: String = row.get("status");
        let status = EventStatus::parse(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown event status '{}'", status_raw))?;
        let payload_raw: String = row.get("payload");

        Ok(Event {
            id: row.get("id"),
            event_type: row.get("event_type"),
            lane: row.get("lane"),
            priority: row.get("priority"),
            payload: serde_json::from_str(&payload_raw)?,
            dedupe_key: row.get("dedupe_key"),
            attempt_count: row.get("attempt_count"),
            status,
            available_at: parse_ts(&row.get::<String, _>("available_at")),
            locked_by: row.get("locked_by"),
            locked_at: row
                .get::<Option<String>, _>("locked_at")
                .map(|s| parse_ts(&s)),
            last_error: row.get("last_error"),
            created_at: parse_ts(&row.get::<String, _>("created_at")),
            updated_at: parse_ts(&row.get::<String, _>("updated_at")),
        })
    }

    /// Terminal success. The row stays for audit until pruned.
    pub async fn mark_done(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE events
             SET status = 'done', locked_by = NULL, locked_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Schedule another attempt after `delay_ms`.
    pub async fn mark_retry(&self, id: i64, error: &str, delay_ms: u64) -> anyhow::Result<()> {
        let now = Utc::now();
        let available_at = now + Duration::milliseconds(delay_ms as i64);
        sqlx::query(
            "UPDATE events
             SET status = 'retry', attempt_count = attempt_count + 1,
                 available_at = ?, last_error = ?,
                 locked_by = NULL, locked_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(available_at.to_rfc3339())
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Dead-letter the event; it is never claimed again.
    pub async fn mark_dead(&self, id: i64, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE events
             SET status = 'dead', attempt_count = attempt_count + 1, last_error = ?,
                 locked_by = NULL, locked_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        warn!(id, error, "Event dead-lettered");
        Ok(())
    }

    /// Reset `processing` rows whose lock is older than `lock_timeout_ms`
    /// back to `retry`. Covers workers that died mid-dispatch.
    pub async fn requeue_stale_processing(&self, lock_timeout_ms: u64) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - Duration::milliseconds(lock_timeout_ms as i64);
        let result = sqlx::query(
            "UPDATE events
             SET status = 'retry', locked_by = NULL, locked_at = NULL, updated_at = ?
             WHERE status = 'processing' AND locked_at IS NOT NULL AND locked_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            warn!(count, "Requeued stale processing events");
        }
        Ok(count)
    }

    /// True iff a `dm.incoming` event for this message id is live in the
    /// queue (`pending`, `processing`, or `retry`). Used by the reconcile
    /// and recovery sweeps to avoid double-enqueueing.
    pub async fn has_active_dm_incoming_event(&self, message_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM events
             WHERE event_type = 'dm.incoming'
               AND status IN ('pending', 'processing', 'retry')
               AND json_extract(payload, '$.message_id') = ?",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    // =========================================================================
    // DM state
    // =========================================================================

    /// Create the row for a message on first observation; later calls keep
    /// the existing flags.
    pub async fn upsert_dm(
        &self,
        message_id: &str,
        channel_id: &str,
        author_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO dm_messages (message_id, channel_id, author_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(channel_id)
        .bind(author_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_dm_state(&self, message_id: &str) -> anyhow::Result<Option<DmState>> {
        let row = sqlx::query("SELECT * FROM dm_messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_dm_state(&r)))
    }

    fn row_to_dm_state(row: &sqlx::sqlite::SqliteRow) -> DmState {
        DmState {
            message_id: row.get("message_id"),
            channel_id: row.get("channel_id"),
            author_id: row.get("author_id"),
            eye_applied: row.get::<i64, _>("eye_applied") != 0,
            processing_done: row.get::<i64, _>("processing_done") != 0,
            check_applied: row.get::<i64, _>("check_applied") != 0,
            terminal_failed: row.get::<i64, _>("terminal_failed") != 0,
            last_error: row.get("last_error"),
            created_at: parse_ts(&row.get::<String, _>("created_at")),
            updated_at: parse_ts(&row.get::<String, _>("updated_at")),
        }
    }

    async fn set_dm_flag(&self, message_id: &str, column: &str) -> anyhow::Result<()> {
        // Column names come from the callers below, never from input.
        let query = format!(
            "UPDATE dm_messages SET {} = 1, updated_at = ? WHERE message_id = ?",
            column
        );
        sqlx::query(&query)
            .bind(Utc::now().to_rfc3339())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_eye_applied(&self, message_id: &str) -> anyhow::Result<()> {
        self.set_dm_flag(message_id, "eye_applied").await
    }

    pub async fn mark_processing_done(&self, message_id: &str) -> anyhow::Result<()> {
        self.set_dm_flag(message_id, "processing_done").await
    }

    pub async fn mark_check_applied(&self, message_id: &str) -> anyhow::Result<()> {
        self.set_dm_flag(message_id, "check_applied").await
    }

    pub async fn mark_dm_terminal_failure(
        &self,
        message_id: &str,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE dm_messages SET terminal_failed = 1, last_error = ?, updated_at = ?
             WHERE message_id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_dm_last_error(&self, message_id: &str, error: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE dm_messages SET last_error = ?, updated_at = ? WHERE message_id = ?")
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// DMs whose 👀 never landed (and are not terminally failed).
    pub async fn list_dm_missing_eye(&self, limit: i64) -> anyhow::Result<Vec<DmState>> {
        let rows = sqlx::query(
            "SELECT * FROM dm_messages
             WHERE eye_applied = 0 AND terminal_failed = 0
             ORDER BY updated_at ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_dm_state).collect())
    }

    /// DMs fully processed but still missing the ✅.
    pub async fn list_dm_missing_check(&self, limit: i64) -> anyhow::Result<Vec<DmState>> {
        let rows = sqlx::query(
            "SELECT * FROM dm_messages
             WHERE processing_done = 1 AND check_applied = 0 AND terminal_failed = 0
             ORDER BY updated_at ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_dm_state).collect())
    }

    // =========================================================================
    // Delivery offsets
    // =========================================================================

    pub async fn get_offset(&self, scope: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT message_id FROM dm_offsets WHERE scope = ?")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("message_id")))
    }

    /// Advance the high-watermark for `scope`. The watermark never
    /// regresses: snowflakes compare as integers, with a string fallback
    /// for non-numeric ids. Returns whether a write happened.
    pub async fn update_offset(&self, scope: &str, message_id: &str) -> anyhow::Result<bool> {
        let existing = self.get_offset(scope).await?;
        if let Some(current) = &existing {
            if !snowflake_newer(message_id, current) {
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO dm_offsets (scope, message_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(scope) DO UPDATE SET
                 message_id = excluded.message_id,
                 updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(message_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Prune settled DM rows and terminal events older than `days`.
    /// Returns (dm rows, event rows) removed.
    pub async fn prune_settled(&self, days: i64) -> anyhow::Result<(u64, u64)> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();

        let dms = sqlx::query(
            "DELETE FROM dm_messages
             WHERE (check_applied = 1 OR terminal_failed = 1) AND updated_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let events = sqlx::query(
            "DELETE FROM events WHERE status IN ('done', 'dead') AND updated_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if dms > 0 || events > 0 {
            info!(dms, events, "Pruned settled rows");
        }
        Ok((dms, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, Lane};
    use serde_json::json;

    async fn setup_store() -> (EventStore, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = EventStore::open(db_file.path().to_str().unwrap())
            .await
            .unwrap();
        (store, db_file)
    }

    fn dm_input(message_id: &str) -> EventInput {
        EventInput::new(
            EventType::DmIncoming,
            Lane::Interactive,
            10,
            json!({"message_id": message_id, "channel_id": "C", "author_id": "111"}),
        )
    }

    #[tokio::test]
    async fn publish_with_dedupe_key_is_idempotent() {
        let (store, _db) = setup_store().await;

        let first = store
            .publish(dm_input("1").dedupe("outbound:1:reply"))
            .await
            .unwrap();
        let second = store
            .publish(dm_input("1").dedupe("outbound:1:reply"))
            .await
            .unwrap();
        assert_eq!(first, second);

        // Still idempotent after the event settles.
        store.claim_next("w1").await.unwrap().unwrap();
        store.mark_done(first).await.unwrap();
        let third = store
            .publish(dm_input("1").dedupe("outbound:1:reply"))
            .await
            .unwrap();
        assert_eq!(first, third);
        assert!(store.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_mutually_exclusive() {
        let (store, _db) = setup_store().await;
        store.publish(dm_input("1")).await.unwrap();

        let first = store.claim_next("w1").await.unwrap();
        assert!(first.is_some());
        let second = store.claim_next("w2").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_lane_then_priority_then_age() {
        let (store, _db) = setup_store().await;

        let scheduled = store
            .publish(EventInput::new(
                EventType::SchedulerTriggered,
                Lane::Scheduled,
                50,
                json!({}),
            ))
            .await
            .unwrap();
        let recovery = store
            .publish(EventInput::new(
                EventType::DmIncoming,
                Lane::Recovery,
                5,
                json!({"message_id": "2"}),
            ))
            .await
            .unwrap();
        let low_interactive = store
            .publish(EventInput::new(
                EventType::DmIncoming,
                Lane::Interactive,
                5,
                json!({"message_id": "3"}),
            ))
            .await
            .unwrap();
        let high_interactive = store
            .publish(EventInput::new(
                EventType::DmIncoming,
                Lane::Interactive,
                15,
                json!({"message_id": "4"}),
            ))
            .await
            .unwrap();

        let order: Vec<i64> = {
            let mut ids = Vec::new();
            while let Some(ev) = store.claim_next("w1").await.unwrap() {
                ids.push(ev.id);
                store.mark_done(ev.id).await.unwrap();
            }
            ids
        };
        assert_eq!(order, vec![high_interactive, low_interactive, recovery, scheduled]);
    }

    #[tokio::test]
    async fn retry_increments_attempts_and_delays_availability() {
        let (store, _db) = setup_store().await;
        let id = store.publish(dm_input("1")).await.unwrap();

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, EventStatus::Processing);
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));

        let before = Utc::now();
        store.mark_retry(id, "boom", 5_000).await.unwrap();

        // Not claimable while the delay is pending.
        assert!(store.claim_next("w1").await.unwrap().is_none());

        let row = store.get_event(id).await.unwrap();
        assert_eq!(row.status, EventStatus::Retry);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
        assert!(row.available_at >= before + Duration::milliseconds(5_000));
        assert!(row.locked_by.is_none());
    }

    #[tokio::test]
    async fn retry_becomes_claimable_after_delay() {
        let (store, _db) = setup_store().await;
        let id = store.publish(dm_input("1")).await.unwrap();
        store.claim_next("w1").await.unwrap().unwrap();
        store.mark_retry(id, "boom", 0).await.unwrap();

        let reclaimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempt_count, 1);
    }

    #[tokio::test]
    async fn dead_is_terminal() {
        let (store, _db) = setup_store().await;
        let id = store.publish(dm_input("1")).await.unwrap();
        store.claim_next("w1").await.unwrap().unwrap();
        store.mark_dead(id, "max attempts reached").await.unwrap();

        assert!(store.claim_next("w1").await.unwrap().is_none());
        let row = store.get_event(id).await.unwrap();
        assert_eq!(row.status, EventStatus::Dead);
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn stale_locks_are_requeued() {
        let (store, _db) = setup_store().await;
        let id = store.publish(dm_input("1")).await.unwrap();
        store.claim_next("w1").await.unwrap().unwrap();

        // Fresh lock survives.
        assert_eq!(store.requeue_stale_processing(120_000).await.unwrap(), 0);

        // Age the lock behind the timeout.
        let past = (Utc::now() - Duration::seconds(600)).to_rfc3339();
        sqlx::query("UPDATE events SET locked_at = ? WHERE id = ?")
            .bind(&past)
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.requeue_stale_processing(120_000).await.unwrap(), 1);
        let row = store.get_event(id).await.unwrap();
        assert_eq!(row.status, EventStatus::Retry);
        assert!(row.locked_by.is_none());
        assert!(row.locked_at.is_none());
    }

    #[tokio::test]
    async fn active_dm_incoming_detection() {
        let (store, _db) = setup_store().await;
        assert!(!store.has_active_dm_incoming_event("42").await.unwrap());

        let id = store.publish(dm_input("42")).await.unwrap();
        assert!(store.has_active_dm_incoming_event("42").await.unwrap());
        assert!(!store.has_active_dm_incoming_event("43").await.unwrap());

        store.claim_next("w1").await.unwrap().unwrap();
        assert!(store.has_active_dm_incoming_event("42").await.unwrap());

        store.mark_done(id).await.unwrap();
        assert!(!store.has_active_dm_incoming_event("42").await.unwrap());
    }

    #[tokio::test]
    async fn dm_state_flags_are_monotonic() {
        let (store, _db) = setup_store().await;
        store.upsert_dm("42", "C", "111").await.unwrap();

        // Re-upsert does not reset flags.
        store.mark_eye_applied("42").await.unwrap();
        store.upsert_dm("42", "C", "111").await.unwrap();
        let state = store.get_dm_state("42").await.unwrap().unwrap();
        assert!(state.eye_applied);
        assert!(!state.processing_done);

        store.mark_processing_done("42").await.unwrap();
        store.mark_check_applied("42").await.unwrap();
        let state = store.get_dm_state("42").await.unwrap().unwrap();
        assert!(state.processing_done);
        assert!(state.check_applied);
        assert!(!state.terminal_failed);

        store.mark_dm_terminal_failure("42", "bad").await.unwrap();
        let state = store.get_dm_state("42").await.unwrap().unwrap();
        assert!(state.terminal_failed);
        assert_eq!(state.last_error.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn reconcile_listings() {
        let (store, _db) = setup_store().await;

        store.upsert_dm("1", "C", "111").await.unwrap();
        store.upsert_dm("2", "C", "111").await.unwrap();
        store.mark_eye_applied("2").await.unwrap();
        store.mark_processing_done("2").await.unwrap();
        store.upsert_dm("3", "C", "111").await.unwrap();
        store.mark_dm_terminal_failure("3", "gone").await.unwrap();

        let missing_eye = store.list_dm_missing_eye(50).await.unwrap();
        assert_eq!(
            missing_eye.iter().map(|d| d.message_id.as_str()).collect::<Vec<_>>(),
            vec!["1"]
        );

        let missing_check = store.list_dm_missing_check(50).await.unwrap();
        assert_eq!(
            missing_check.iter().map(|d| d.message_id.as_str()).collect::<Vec<_>>(),
            vec!["2"]
        );
    }

    #[tokio::test]
    async fn offsets_never_regress() {
        let (store, _db) = setup_store().await;
        assert!(store.get_offset("dm_user:111").await.unwrap().is_none());

        assert!(store.update_offset("dm_user:111", "100").await.unwrap());
        assert!(!store.update_offset("dm_user:111", "99").await.unwrap());
        assert!(!store.update_offset("dm_user:111", "100").await.unwrap());
        assert!(store.update_offset("dm_user:111", "101").await.unwrap());
        assert_eq!(
            store.get_offset("dm_user:111").await.unwrap().as_deref(),
            Some("101")
        );

        // Numeric compare, not lexicographic: "9" < "10".
        assert!(store.update_offset("dm_user:222", "9").await.unwrap());
        assert!(store.update_offset("dm_user:222", "10").await.unwrap());
    }

    #[tokio::test]
    async fn prune_removes_only_settled_rows() {
        let (store, _db) = setup_store().await;
        store.upsert_dm("1", "C", "111").await.unwrap();
        store.mark_check_applied("1").await.unwrap();
        store.upsert_dm("2", "C", "111").await.unwrap();

        let old = (Utc::now() - Duration::days(30)).to_rfc3339();
        sqlx::query("UPDATE dm_messages SET updated_at = ?")
            .bind(&old)
            .execute(&store.pool)
            .await
            .unwrap();

        let (dms, _) = store.prune_settled(7).await.unwrap();
        assert_eq!(dms, 1);
        assert!(store.get_dm_state("1").await.unwrap().is_none());
        assert!(store.get_dm_state("2").await.unwrap().is_some());
    }

    #[test]
    fn snowflake_ordering() {
        assert!(snowflake_newer("10", "9"));
        assert!(!snowflake_newer("9", "10"));
        assert!(!snowflake_newer("10", "10"));
        // Non-numeric falls back to string comparison.
        assert!(snowflake_newer("b", "a"));
    }
}
