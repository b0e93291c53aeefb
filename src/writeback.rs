//! Write-back scheduler: pushes queued item updates to the Sierra REST API.
//!
//! `PUT /itemdata/` marks an item with `in_update_queue = 1` and stamps
//! `queued_at`. Each tick takes up to `batch_size_limit` queued items and
//! pushes them one call per item, retrying each up to `retries` times. The
//! flag is cleared only when the push succeeded *and* the item was not
//! queued again in the meantime.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::clock::{self, JobHandle};
use crate::config::SierraConfig;
use crate::error::SyncError;
use crate::watermark::to_micros;

/// Fixed field holding the "internal use" counter in Sierra item records.
const IUSE3_FIELD: &str = "93";
/// Sent when the item has no field 93 yet.
const IUSE3_DEFAULT_LABEL: &str = "";

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub item_record_id: i64,
    pub item_number: Option<String>,
    pub barcode: Option<String>,
    pub queued_at: Option<i64>,
}

/// Pushes one item update upstream.
#[async_trait]
pub trait ItemUpdater: Send + Sync {
    async fn push_update(&self, item: &QueuedItem) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritebackReport {
    pub attempted: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Sierra record number of a record id: the id without its record type
/// and campus bits.
pub fn record_number(item_record_id: i64) -> i64 {
    item_record_id & 0xFFFF_FFFF
}

/// Marks an item for write-back. Returns `false` if the item is unknown.
pub async fn queue_item(pool: &SqlitePool, item_record_id: i64) -> Result<bool, SyncError> {
    // queued_at must change on every call, even within one microsecond.
    let result = sqlx::query(
        r#"
        UPDATE sierra_items
        SET in_update_queue = 1,
            queued_at = MAX(?, COALESCE(queued_at, 0) + 1)
        WHERE item_record_id = ?
        "#,
    )
    .bind(to_micros(Utc::now()))
    .bind(item_record_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn queued_count(pool: &SqlitePool) -> Result<i64, SyncError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sierra_items WHERE in_update_queue = 1")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

async fn load_queue(pool: &SqlitePool, limit: i64) -> Result<Vec<QueuedItem>, SyncError> {
    // LIMIT -1 is unlimited in SQLite.
    let limit = if limit > 0 { limit } else { -1 };
    let rows = sqlx::query(
        r#"
        SELECT item_record_id, item_number, barcode, queued_at
        FROM sierra_items
        WHERE in_update_queue = 1
        ORDER BY queued_at, item_record_id
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<QueuedItem, SyncError> {
            Ok(QueuedItem {
                item_record_id: row.try_get("item_record_id")?,
                item_number: row.try_get("item_number")?,
                barcode: row.try_get("barcode")?,
                queued_at: row.try_get("queued_at")?,
            })
        })
        .collect()
}

/// Clears the flag unless the item was queued again after `item` was read.
async fn clear_queued(pool: &SqlitePool, item: &QueuedItem) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sierra_items
        SET in_update_queue = 0, queued_at = NULL
        WHERE item_record_id = ? AND in_update_queue = 1 AND queued_at IS ?
        "#,
    )
    .bind(item.item_record_id)
    .bind(item.queued_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Runs one write-back tick.
///
/// Per-item failures are logged and leave the item queued for the next
/// tick. Only a failure to read or update the queue itself is returned.
pub async fn run_tick(
    pool: &SqlitePool,
    updater: &dyn ItemUpdater,
    config: &SierraConfig,
) -> Result<WritebackReport, SyncError> {
    let queue = load_queue(pool, config.batch_size_limit).await?;
    let mut report = WritebackReport::default();
    if queue.is_empty() {
        return Ok(report);
    }

    let attempts = config.retries + 1;
    for item in &queue {
        report.attempted += 1;

        let mut last_error = None;
        for attempt in 1..=attempts {
            match updater.push_update(item).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        item_record_id = item.item_record_id,
                        attempt,
                        error = %e,
                        "write-back attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => {
                report.updated += 1;
                if !clear_queued(pool, item).await? {
                    tracing::info!(
                        item_record_id = item.item_record_id,
                        "item re-queued during write-back, keeping it queued"
                    );
                }
            }
            Some(e) => {
                report.failed += 1;
                tracing::error!(
                    item_record_id = item.item_record_id,
                    barcode = item.barcode.as_deref().unwrap_or(""),
                    attempts,
                    error = %e,
                    "write-back failed, item stays queued"
                );
            }
        }
    }

    tracing::info!(
        attempted = report.attempted,
        updated = report.updated,
        failed = report.failed,
        "write-back tick finished"
    );
    Ok(report)
}

/// Starts the periodic write-back loop.
pub fn spawn_scheduler(pool: SqlitePool, config: SierraConfig) -> Result<JobHandle, SyncError> {
    let updater = Arc::new(SierraApiClient::new(&config)?);
    let config = Arc::new(config);
    let schedule = config.schedule();

    let handle = clock::spawn_periodic("writeback_push", schedule, move || {
        let pool = pool.clone();
        let updater = updater.clone();
        let config = config.clone();
        async move {
            if let Err(e) = run_tick(&pool, updater.as_ref(), &config).await {
                tracing::error!(code = e.code(), error = %e, "write-back tick aborted");
            }
        }
    });
    tracing::info!(
        interval_secs = schedule.interval.as_secs(),
        "write-back scheduler started"
    );
    Ok(handle)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Sierra REST API client authenticated with client credentials.
pub struct SierraApiClient {
    http: reqwest::Client,
    base_url: String,
    basic_auth: String,
    set_iuse3: bool,
    set_inventory_date: bool,
    token: Mutex<Option<CachedToken>>,
}

impl SierraApiClient {
    pub fn new(config: &SierraConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_size)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Writeback {
                item_record_id: 0,
                reason: format!("http client: {}", e),
            })?;
        let credentials = format!("{}:{}", config.client_key, config.client_secret);

        Ok(Self {
            http,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            basic_auth: format!("Basic {}", STANDARD.encode(credentials)),
            set_iuse3: config.set_iuse3,
            set_inventory_date: config.set_inventory_date,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/token", self.base_url))
            .header(reqwest::header::AUTHORIZATION, &self.basic_auth)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| format!("token request: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("token request returned {}", resp.status()));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("token response: {}", e))?;

        // Renew a little before Sierra expires it.
        let lifetime = token.expires_in.unwrap_or(3600).saturating_sub(30);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(token.access_token)
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, String> {
        let token = self.access_token().await?;
        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| format!("{} {}: {}", method, url, e))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("{} {} returned {}: {}", method, url, status, text));
        }
        Ok(resp)
    }

    async fn iuse3_label(&self, item_url: &str) -> Result<String, String> {
        let resp = self
            .call(Method::GET, &format!("{}?fields=fixedFields", item_url), None)
            .await?;
        let item: Value = resp
            .json()
            .await
            .map_err(|e| format!("item response: {}", e))?;
        Ok(item
            .pointer(&format!("/fixedFields/{}/label", IUSE3_FIELD))
            .and_then(Value::as_str)
            .unwrap_or(IUSE3_DEFAULT_LABEL)
            .to_string())
    }

    async fn update(&self, item: &QueuedItem) -> Result<(), String> {
        let item_url = format!("{}/items/{}", self.base_url, record_number(item.item_record_id));
        let mut body = Map::new();

        if self.set_iuse3 {
            let label = self.iuse3_label(&item_url).await?;
            body.insert(
                "fixedFields".to_string(),
                json!({ IUSE3_FIELD: { "label": label, "value": "1" } }),
            );
        }
        if self.set_inventory_date {
            body.insert(
                "inventoryDate".to_string(),
                json!(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            );
        }

        self.call(Method::PUT, &item_url, Some(&Value::Object(body)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ItemUpdater for SierraApiClient {
    async fn push_update(&self, item: &QueuedItem) -> Result<(), SyncError> {
        if !self.set_iuse3 && !self.set_inventory_date {
            tracing::debug!(
                item_record_id = item.item_record_id,
                "no write-back fields enabled, nothing to push"
            );
            return Ok(());
        }
        self.update(item).await.map_err(|reason| SyncError::Writeback {
            item_record_id: item.item_record_id,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_number_strips_type_bits() {
        assert_eq!(record_number(450_971_566_080 + 1_234_567), 1_234_567);
        assert_eq!(record_number(0x0000_0069_0012_D687), 0x0012_D687);
        assert_eq!(record_number(42), 42);
    }
}
