use sqlx::SqlitePool;
use tracing::info;

/// Centralized migrations for the event-bus database.
///
/// Each statement is idempotent (`IF NOT EXISTS`), so running migrations on
/// every boot is safe.
pub(crate) async fn migrate_bus(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            lane TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL,
            dedupe_key TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            available_at TEXT NOT NULL,
            locked_by TEXT,
            locked_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Claim scans filter on status + availability and order by creation time.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_claim
         ON events(status, available_at, created_at)",
    )
    .execute(pool)
    .await?;

    // Dedupe keys are unique only when present.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedupe
         ON events(dedupe_key) WHERE dedupe_key IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dm_messages (
            message_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            eye_applied INTEGER NOT NULL DEFAULT 0,
            processing_done INTEGER NOT NULL DEFAULT 0,
            check_applied INTEGER NOT NULL DEFAULT 0,
            terminal_failed INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Reconcile sweeps: half-applied eye reactions ...
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dm_missing_eye
         ON dm_messages(eye_applied, terminal_failed, updated_at)",
    )
    .execute(pool)
    .await?;

    // ... and finished-but-uncheckmarked rows.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dm_missing_check
         ON dm_messages(processing_done, check_applied, terminal_failed, updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dm_offsets (
            scope TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Event bus migrations complete");
    Ok(())
}
