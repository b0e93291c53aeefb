use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sierra_sync::config::SierraConfig;
use sierra_sync::error::SyncError;
use sierra_sync::models::SourceItemRecord;
use sierra_sync::watermark::BatchOrigin;
use sierra_sync::writeback::{
    queue_item, queued_count, run_tick, ItemUpdater, QueuedItem, SierraApiClient,
};
use sierra_sync::{codec, config::SyncConfig, merge, migrate};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============ Store fixtures ============

async fn store_with_items(ids: &[i64]) -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let rows: Vec<SourceItemRecord> = ids
        .iter()
        .map(|&id| SourceItemRecord {
            item_record_id: id,
            item_number: Some(format!("i{}", id)),
            barcode: Some(format!("{:016}", id)),
            bib_record_id: None,
            bib_number: None,
            best_author: None,
            best_title: Some("Kalevala".to_string()),
            itype_code_num: None,
            item_type_name: None,
            material_code: None,
            material_name: None,
            classification: None,
            main_entry_json: None,
            record_last_updated: Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
        })
        .collect();
    let payload = codec::encode(&rows).unwrap();
    let origin = BatchOrigin::Full { last_synced_id: 0 };
    merge::merge(&pool, &payload, Utc::now(), origin, &SyncConfig::default())
        .await
        .unwrap();
    pool
}

fn sierra_config(endpoint: &str, extra: &str) -> SierraConfig {
    toml::from_str(&format!(
        "endpoint = \"{}\"\nclient_key = \"key\"\nclient_secret = \"secret\"\n{}",
        endpoint, extra
    ))
    .unwrap()
}

async fn is_queued(pool: &SqlitePool, id: i64) -> bool {
    merge::get_item(pool, id)
        .await
        .unwrap()
        .unwrap()
        .in_update_queue
}

// ============ Fake updaters ============

#[derive(Default)]
struct FakeUpdater {
    failing: Mutex<HashSet<i64>>,
    calls: Mutex<HashMap<i64, usize>>,
}

impl FakeUpdater {
    fn failing(ids: &[i64]) -> Self {
        Self {
            failing: Mutex::new(ids.iter().copied().collect()),
            calls: Mutex::default(),
        }
    }

    fn calls(&self, id: i64) -> usize {
        self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ItemUpdater for FakeUpdater {
    async fn push_update(&self, item: &QueuedItem) -> Result<(), SyncError> {
        *self.calls.lock().unwrap().entry(item.item_record_id).or_default() += 1;
        if self.failing.lock().unwrap().contains(&item.item_record_id) {
            return Err(SyncError::Writeback {
                item_record_id: item.item_record_id,
                reason: "503 Service Unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Queues the item again while its push is in flight.
struct RequeueingUpdater {
    pool: SqlitePool,
}

#[async_trait]
impl ItemUpdater for RequeueingUpdater {
    async fn push_update(&self, item: &QueuedItem) -> Result<(), SyncError> {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        queue_item(&self.pool, item.item_record_id).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_item_stays_queued_until_success() {
    let pool = store_with_items(&[1, 2]).await;
    queue_item(&pool, 1).await.unwrap();
    queue_item(&pool, 2).await.unwrap();
    let config = sierra_config("http://unused", "retries = 2\n");
    let updater = FakeUpdater::failing(&[2]);

    let report = run_tick(&pool, &updater, &config).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(updater.calls(1), 1);
    assert_eq!(updater.calls(2), 3);
    assert!(!is_queued(&pool, 1).await);
    assert!(is_queued(&pool, 2).await);

    // Next tick retries it; after a success the flag clears.
    updater.failing.lock().unwrap().clear();
    let report = run_tick(&pool, &updater, &config).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.updated, 1);
    assert!(!is_queued(&pool, 2).await);
    assert_eq!(queued_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tick_respects_batch_size_limit() {
    let pool = store_with_items(&[1, 2, 3]).await;
    for id in [1, 2, 3] {
        queue_item(&pool, id).await.unwrap();
    }
    let updater = FakeUpdater::default();

    let limited = sierra_config("http://unused", "batch_size_limit = 2\n");
    let report = run_tick(&pool, &updater, &limited).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(queued_count(&pool).await.unwrap(), 1);

    let unlimited = sierra_config("http://unused", "batch_size_limit = 0\n");
    let report = run_tick(&pool, &updater, &unlimited).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(queued_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_requeue_during_push_is_kept() {
    let pool = store_with_items(&[5]).await;
    queue_item(&pool, 5).await.unwrap();
    let updater = RequeueingUpdater { pool: pool.clone() };

    let report = run_tick(&pool, &updater, &sierra_config("http://unused", ""))
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert!(is_queued(&pool, 5).await);
}

#[tokio::test]
async fn test_queue_unknown_item() {
    let pool = store_with_items(&[1]).await;
    assert!(!queue_item(&pool, 999).await.unwrap());
    assert!(queue_item(&pool, 1).await.unwrap());
}

#[tokio::test]
async fn test_empty_queue_does_nothing() {
    let pool = store_with_items(&[1]).await;
    let updater = FakeUpdater::default();
    let report = run_tick(&pool, &updater, &sierra_config("http://unused", ""))
        .await
        .unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(updater.calls(1), 0);
}

// ============ Mock Sierra REST API ============

#[derive(Default)]
struct MockSierra {
    token_requests: AtomicUsize,
    item_reads: AtomicUsize,
    reject_next_put: AtomicBool,
    without_iuse3: AtomicBool,
    puts: Mutex<Vec<(String, Value)>>,
}

async fn mock_token(State(mock): State<Arc<MockSierra>>, headers: HeaderMap) -> Response {
    // base64("key:secret")
    let expected = "Basic a2V5OnNlY3JldA==";
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = mock.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "access_token": format!("tok-{}", n),
        "token_type": "bearer",
        "expires_in": 3600
    }))
    .into_response()
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer tok-"))
}

async fn mock_get_item(
    State(mock): State<Arc<MockSierra>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    mock.item_reads.fetch_add(1, Ordering::SeqCst);
    if mock.without_iuse3.load(Ordering::SeqCst) {
        return Json(json!({ "id": id, "fixedFields": {} })).into_response();
    }
    Json(json!({
        "id": id,
        "fixedFields": {
            "93": { "label": "INTERNAL USE COUNT", "value": 0 }
        }
    }))
    .into_response()
}

async fn mock_put_item(
    State(mock): State<Arc<MockSierra>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if !bearer_ok(&headers) || mock.reject_next_put.swap(false, Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED;
    }
    mock.puts.lock().unwrap().push((id, body));
    StatusCode::NO_CONTENT
}

async fn start_mock_sierra() -> (Arc<MockSierra>, String) {
    let mock = Arc::new(MockSierra::default());
    let app = Router::new()
        .route("/v6/token", post(mock_token))
        .route("/v6/items/{id}", get(mock_get_item).put(mock_put_item))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{}/v6", addr))
}

fn queued(item_record_id: i64) -> QueuedItem {
    QueuedItem {
        item_record_id,
        item_number: None,
        barcode: None,
        queued_at: Some(1),
    }
}

#[tokio::test]
async fn test_sierra_client_puts_iuse3_and_inventory_date() {
    let (mock, endpoint) = start_mock_sierra().await;
    let client = SierraApiClient::new(&sierra_config(&endpoint, "")).unwrap();

    // 'i' record type in the high bits, record number 77.
    client.push_update(&queued(450_971_566_080 + 77)).await.unwrap();
    client.push_update(&queued(450_971_566_080 + 78)).await.unwrap();

    assert_eq!(mock.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(mock.item_reads.load(Ordering::SeqCst), 2);
    let puts = mock.puts.lock().unwrap();
    assert_eq!(puts.len(), 2);
    let (id, body) = &puts[0];
    assert_eq!(id, "77");
    assert_eq!(body["fixedFields"]["93"]["label"], "INTERNAL USE COUNT");
    assert_eq!(body["fixedFields"]["93"]["value"], "1");
    let date = body["inventoryDate"].as_str().unwrap();
    assert_eq!(date.len(), 20);
    assert!(date.ends_with('Z'));
}

#[tokio::test]
async fn test_missing_iuse3_field_sends_empty_label() {
    let (mock, endpoint) = start_mock_sierra().await;
    mock.without_iuse3.store(true, Ordering::SeqCst);
    let client = SierraApiClient::new(&sierra_config(&endpoint, "")).unwrap();

    client.push_update(&queued(12)).await.unwrap();

    let puts = mock.puts.lock().unwrap();
    assert_eq!(puts[0].1["fixedFields"]["93"]["label"], "");
    assert_eq!(puts[0].1["fixedFields"]["93"]["value"], "1");
}

#[tokio::test]
async fn test_sierra_client_respects_field_toggles() {
    let (mock, endpoint) = start_mock_sierra().await;

    let client =
        SierraApiClient::new(&sierra_config(&endpoint, "set_iuse3 = false\n")).unwrap();
    client.push_update(&queued(3)).await.unwrap();
    {
        let puts = mock.puts.lock().unwrap();
        assert!(puts[0].1.get("fixedFields").is_none());
        assert!(puts[0].1.get("inventoryDate").is_some());
    }
    assert_eq!(mock.item_reads.load(Ordering::SeqCst), 0);

    let client = SierraApiClient::new(&sierra_config(
        &endpoint,
        "set_iuse3 = false\nset_inventory_date = false\n",
    ))
    .unwrap();
    client.push_update(&queued(4)).await.unwrap();
    assert_eq!(mock.puts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unauthorized_drops_cached_token() {
    let (mock, endpoint) = start_mock_sierra().await;
    let client = SierraApiClient::new(&sierra_config(&endpoint, "set_iuse3 = false\n")).unwrap();

    mock.reject_next_put.store(true, Ordering::SeqCst);
    let err = client.push_update(&queued(9)).await.unwrap_err();
    assert!(matches!(err, SyncError::Writeback { item_record_id: 9, .. }));

    client.push_update(&queued(9)).await.unwrap();
    assert_eq!(mock.token_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_tick_against_mock_sierra_retries_and_clears() {
    let (mock, endpoint) = start_mock_sierra().await;
    let config = sierra_config(&endpoint, "retries = 1\n");
    let client = SierraApiClient::new(&config).unwrap();
    let pool = store_with_items(&[11]).await;
    queue_item(&pool, 11).await.unwrap();

    // First attempt is refused, the retry succeeds within the same tick.
    mock.reject_next_put.store(true, Ordering::SeqCst);
    let report = run_tick(&pool, &client, &config).await.unwrap();

    assert_eq!(report.updated, 1);
    assert!(!is_queued(&pool, 11).await);
    assert_eq!(mock.puts.lock().unwrap().len(), 1);
}
