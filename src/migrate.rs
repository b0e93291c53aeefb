use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::SyncMode;

/// Creates the backend schema and seeds the singleton sync state.
///
/// Idempotent: existing tables and the existing state row are left alone.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sierra_items (
            item_record_id INTEGER PRIMARY KEY,
            item_number TEXT,
            barcode TEXT,
            bib_record_id INTEGER,
            bib_number TEXT,
            best_author TEXT,
            best_title TEXT,
            itype_code_num INTEGER,
            item_type_name TEXT,
            material_code TEXT,
            material_name TEXT,
            classification TEXT,
            main_entry_json TEXT,
            shelfmark TEXT NOT NULL,
            record_last_updated INTEGER NOT NULL,
            synced_at INTEGER NOT NULL,
            in_update_queue INTEGER NOT NULL DEFAULT 0,
            queued_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Exactly one row, enforced by the CHECK on id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            sync_mode TEXT NOT NULL,
            last_synced_id INTEGER NOT NULL DEFAULT 0,
            sync_changes_since INTEGER,
            initialized_at INTEGER NOT NULL,
            full_sync_completed_at INTEGER,
            last_sync_run_completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sierra_items_barcode ON sierra_items(barcode)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sierra_items_queue ON sierra_items(in_update_queue) WHERE in_update_queue = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO sync_state (id, sync_mode, last_synced_id, initialized_at) VALUES (1, ?, 0, ?)",
    )
    .bind(SyncMode::SyncFull.as_str())
    .bind(Utc::now().timestamp_micros())
    .execute(pool)
    .await?;

    Ok(())
}
