//! Backend side of the sync pull: applies an uploaded batch to the store.
//!
//! A batch is decoded completely before anything is written. The upserts and
//! the watermark advance then share one transaction, so the store either
//! holds the whole batch plus the moved cursor, or neither. Rows of a batch
//! read for a cursor the state has since moved past are still stored; only
//! the cursor stays put.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::codec;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{BackendItemRecord, SourceItemRecord, SyncMode};
use crate::shelfmark;
use crate::watermark::{self, from_micros, to_micros, BatchOrigin, BatchSummary};

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub received: usize,
    /// Rows written. Rows already merged from a newer batch are not
    /// counted.
    pub upserted: usize,
    pub mode_before: SyncMode,
    pub mode_after: SyncMode,
    pub watermark_advanced: bool,
}

pub async fn merge(
    pool: &SqlitePool,
    payload: &[u8],
    as_of: DateTime<Utc>,
    origin: BatchOrigin,
    sync: &SyncConfig,
) -> Result<MergeReport, SyncError> {
    let rows = codec::decode(payload)?;
    let summary = BatchSummary {
        origin,
        row_count: rows.len(),
        max_item_record_id: rows.iter().map(|r| r.item_record_id).max(),
        as_of,
    };

    let mut tx = pool.begin().await?;
    let mut upserted = 0;
    for row in &rows {
        upserted += upsert_item(&mut tx, row, as_of).await?;
    }
    let advance = watermark::advance(&mut tx, &summary, sync, Utc::now()).await?;
    tx.commit().await?;

    tracing::info!(
        received = summary.row_count,
        upserted,
        mode = %advance.after.sync_mode,
        last_synced_id = advance.after.last_synced_id,
        watermark_advanced = advance.applied,
        "merged sync batch"
    );
    if advance.before.sync_mode != advance.after.sync_mode {
        tracing::info!(
            from = %advance.before.sync_mode,
            to = %advance.after.sync_mode,
            "sync mode changed"
        );
    }

    Ok(MergeReport {
        received: summary.row_count,
        upserted,
        mode_before: advance.before.sync_mode,
        mode_after: advance.after.sync_mode,
        watermark_advanced: advance.applied,
    })
}

/// Insert-or-update by `item_record_id`. Leaves the write-back queue columns
/// alone and never overwrites a row merged from a newer batch.
async fn upsert_item(
    conn: &mut SqliteConnection,
    row: &SourceItemRecord,
    as_of: DateTime<Utc>,
) -> Result<usize, SyncError> {
    let shelfmark = shelfmark::derive(row.main_entry_json.as_deref());

    let result = sqlx::query(
        r#"
        INSERT INTO sierra_items (
            item_record_id, item_number, barcode, bib_record_id, bib_number,
            best_author, best_title, itype_code_num, item_type_name,
            material_code, material_name, classification, main_entry_json,
            shelfmark, record_last_updated, synced_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_record_id) DO UPDATE SET
            item_number = excluded.item_number,
            barcode = excluded.barcode,
            bib_record_id = excluded.bib_record_id,
            bib_number = excluded.bib_number,
            best_author = excluded.best_author,
            best_title = excluded.best_title,
            itype_code_num = excluded.itype_code_num,
            item_type_name = excluded.item_type_name,
            material_code = excluded.material_code,
            material_name = excluded.material_name,
            classification = excluded.classification,
            main_entry_json = excluded.main_entry_json,
            shelfmark = excluded.shelfmark,
            record_last_updated = excluded.record_last_updated,
            synced_at = excluded.synced_at
        WHERE excluded.synced_at >= sierra_items.synced_at
        "#,
    )
    .bind(row.item_record_id)
    .bind(&row.item_number)
    .bind(&row.barcode)
    .bind(row.bib_record_id)
    .bind(&row.bib_number)
    .bind(&row.best_author)
    .bind(&row.best_title)
    .bind(row.itype_code_num)
    .bind(&row.item_type_name)
    .bind(&row.material_code)
    .bind(&row.material_name)
    .bind(&row.classification)
    .bind(&row.main_entry_json)
    .bind(&shelfmark)
    .bind(to_micros(row.record_last_updated))
    .bind(to_micros(as_of))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() as usize)
}

const ITEM_SELECT: &str = r#"
    SELECT item_record_id, item_number, barcode, bib_record_id, bib_number,
           best_author, best_title, itype_code_num, item_type_name,
           material_code, material_name, classification, main_entry_json,
           shelfmark, record_last_updated, synced_at, in_update_queue
    FROM sierra_items
"#;

fn item_from_row(row: &SqliteRow) -> Result<BackendItemRecord, SyncError> {
    Ok(BackendItemRecord {
        item_record_id: row.try_get("item_record_id")?,
        item_number: row.try_get("item_number")?,
        barcode: row.try_get("barcode")?,
        bib_record_id: row.try_get("bib_record_id")?,
        bib_number: row.try_get("bib_number")?,
        best_author: row.try_get("best_author")?,
        best_title: row.try_get("best_title")?,
        itype_code_num: row.try_get("itype_code_num")?,
        item_type_name: row.try_get("item_type_name")?,
        material_code: row.try_get("material_code")?,
        material_name: row.try_get("material_name")?,
        classification: row.try_get("classification")?,
        main_entry_json: row.try_get("main_entry_json")?,
        shelfmark: row.try_get("shelfmark")?,
        record_last_updated: from_micros(row.try_get("record_last_updated")?)?,
        synced_at: from_micros(row.try_get("synced_at")?)?,
        in_update_queue: row.try_get("in_update_queue")?,
    })
}

pub async fn get_item_by_barcode(
    pool: &SqlitePool,
    barcode: &str,
) -> Result<Option<BackendItemRecord>, SyncError> {
    let sql = format!("{} WHERE barcode = ? ORDER BY item_record_id LIMIT 1", ITEM_SELECT);
    let row = sqlx::query(&sql).bind(barcode).fetch_optional(pool).await?;
    row.as_ref().map(item_from_row).transpose()
}

pub async fn get_item(
    pool: &SqlitePool,
    item_record_id: i64,
) -> Result<Option<BackendItemRecord>, SyncError> {
    let sql = format!("{} WHERE item_record_id = ?", ITEM_SELECT);
    let row = sqlx::query(&sql)
        .bind(item_record_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(item_from_row).transpose()
}

pub async fn item_count(pool: &SqlitePool) -> Result<i64, SyncError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sierra_items")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
