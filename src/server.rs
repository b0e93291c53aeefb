//! Backend HTTP API.
//!
//! Serves job parameters to the ETL worker, accepts its batches, and
//! exposes items to the circulation client, which can queue them for
//! write-back to Sierra. `serve` also runs the write-back scheduler.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/sync/` | Parameters for the next ETL run |
//! | `POST` | `/sync/` | Multipart batch upload (`file`, `timestamp`, `sync_mode`, `last_synced_id`) |
//! | `GET`  | `/itemdata/?barcode=` | One item by barcode |
//! | `PUT`  | `/itemdata/` | Queue an item for write-back (`{"item_record_id": n}`) |
//! | `GET`  | `/status` | Sync state and queue size |
//! | `GET`  | `/healthz` | Liveness |
//! | `GET`  | `/readiness` | Store reachable |
//!
//! Errors use the body `{ "error": { "code": "...", "message": "..." } }`.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::db;
use crate::error::SyncError;
use crate::merge;
use crate::migrate;
use crate::models::{BackendItemRecord, SyncJobParameters, SyncMode};
use crate::watermark::{self, BatchOrigin};
use crate::writeback;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::PayloadDecode(_) => StatusCode::BAD_REQUEST,
            SyncError::StaleCursor { .. } => StatusCode::CONFLICT,
            SyncError::SourceUnavailable(_) | SyncError::BackendUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        } else {
            tracing::warn!(code = err.code(), error = %err, "request rejected");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Router ============

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.config.server.max_upload_bytes);

    Router::new()
        .route("/sync", get(handle_get_sync).post(handle_post_sync))
        .route("/sync/", get(handle_get_sync).post(handle_post_sync))
        .route("/itemdata", get(handle_get_item).put(handle_queue_item))
        .route("/itemdata/", get(handle_get_item).put(handle_queue_item))
        .route("/status", get(handle_status))
        .route("/healthz", get(handle_healthz))
        .route("/readiness", get(handle_readiness))
        .layer(upload_limit)
        .with_state(state)
}

/// `sierra-sync serve`: runs the API until Ctrl-C, plus the write-back
/// scheduler when `[sierra]` is configured.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;

    let scheduler = match &config.sierra {
        Some(sierra) => Some(writeback::spawn_scheduler(pool.clone(), sierra.clone())?),
        None => {
            tracing::warn!("no [sierra] section, write-back scheduler disabled");
            None
        }
    };

    let state = AppState {
        pool: pool.clone(),
        config: Arc::new(config.clone()),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down backend");
        })
        .await?;

    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    pool.close().await;
    Ok(())
}

// ============ Handlers ============

async fn handle_get_sync(
    State(state): State<AppState>,
) -> Result<Json<SyncJobParameters>, AppError> {
    let params = watermark::job_parameters(&state.pool, &state.config.sync, Utc::now()).await?;
    tracing::debug!(?params, "served job parameters");
    Ok(Json(params))
}

#[derive(Serialize)]
struct UploadResponse {
    received: usize,
    upserted: usize,
    sync_mode: SyncMode,
    watermark_advanced: bool,
}

async fn text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, AppError> {
    let text = field
        .text()
        .await
        .map_err(|e| bad_request(format!("invalid {} part: {}", name, e)))?;
    Ok(text.trim().to_string())
}

async fn handle_post_sync(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut payload: Option<Vec<u8>> = None;
    let mut as_of: Option<DateTime<Utc>> = None;
    let mut sync_mode: Option<SyncMode> = None;
    let mut last_synced_id: Option<i64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("invalid file part: {}", e)))?;
                payload = Some(bytes.to_vec());
            }
            Some("timestamp") => {
                let text = text_field(field, "timestamp").await?;
                let parsed = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| bad_request(format!("invalid timestamp {:?}: {}", text, e)))?;
                as_of = Some(parsed.with_timezone(&Utc));
            }
            Some("sync_mode") => {
                let text = text_field(field, "sync_mode").await?;
                sync_mode = Some(text.parse::<SyncMode>().map_err(bad_request)?);
            }
            Some("last_synced_id") => {
                let text = text_field(field, "last_synced_id").await?;
                let id = text
                    .parse::<i64>()
                    .map_err(|e| bad_request(format!("invalid last_synced_id {:?}: {}", text, e)))?;
                last_synced_id = Some(id);
            }
            _ => {}
        }
    }

    let payload = payload.ok_or_else(|| bad_request("missing multipart field: file"))?;
    let as_of = as_of.ok_or_else(|| bad_request("missing multipart field: timestamp"))?;
    let origin = match sync_mode {
        Some(SyncMode::SyncFull) => BatchOrigin::Full {
            last_synced_id: last_synced_id
                .ok_or_else(|| bad_request("missing multipart field: last_synced_id"))?,
        },
        Some(SyncMode::SyncChanges) => BatchOrigin::Changes,
        None => return Err(bad_request("missing multipart field: sync_mode")),
    };

    let report = merge::merge(&state.pool, &payload, as_of, origin, &state.config.sync).await?;
    Ok(Json(UploadResponse {
        received: report.received,
        upserted: report.upserted,
        sync_mode: report.mode_after,
        watermark_advanced: report.watermark_advanced,
    }))
}

#[derive(Deserialize)]
struct ItemQuery {
    barcode: Option<String>,
}

fn barcode_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{14,16}\w?$").expect("static regex"))
}

async fn handle_get_item(
    State(state): State<AppState>,
    Query(query): Query<ItemQuery>,
) -> Result<Json<BackendItemRecord>, AppError> {
    let barcode = query
        .barcode
        .ok_or_else(|| bad_request("barcode is required"))?;
    if !barcode_pattern().is_match(&barcode) {
        return Err(bad_request(format!("invalid barcode: {}", barcode)));
    }

    merge::get_item_by_barcode(&state.pool, &barcode)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no item with barcode {}", barcode)))
}

#[derive(Deserialize)]
struct QueueRequest {
    item_record_id: i64,
}

async fn handle_queue_item(
    State(state): State<AppState>,
    body: Result<Json<QueueRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(format!("invalid body: {}", e.body_text())))?;
    if !writeback::queue_item(&state.pool, req.item_record_id).await? {
        return Err(not_found(format!("no item {}", req.item_record_id)));
    }
    tracing::info!(item_record_id = req.item_record_id, "item queued for write-back");
    Ok(Json(json!({
        "item_record_id": req.item_record_id,
        "in_update_queue": true,
    })))
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let sync_state = watermark::load_state(&state.pool).await?;
    let items = merge::item_count(&state.pool).await?;
    let queued = writeback::queued_count(&state.pool).await?;
    Ok(Json(json!({
        "sync_state": sync_state,
        "items": items,
        "queued_for_writeback": queued,
    })))
}

async fn handle_healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_readiness(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "store not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barcode_pattern() {
        assert!(barcode_pattern().is_match("12345678901234"));
        assert!(barcode_pattern().is_match("1234567890123456"));
        assert!(barcode_pattern().is_match("123456789012345X"));
        assert!(!barcode_pattern().is_match("1234567890123"));
        assert!(!barcode_pattern().is_match("12345678901234567X"));
        assert!(!barcode_pattern().is_match("abc45678901234"));
    }

    #[test]
    fn test_stale_cursor_maps_to_conflict() {
        let err: AppError = SyncError::StaleCursor {
            lag_minutes: 90,
            max_minutes: 60,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "stale_cursor");
    }

    #[test]
    fn test_decode_error_maps_to_bad_request() {
        let err: AppError = SyncError::PayloadDecode("bad".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
