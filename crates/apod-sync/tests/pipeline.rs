use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apod_core::LoadOutcome;
use apod_storage::{ApodStore, MemoryApodStore};
use apod_sync::{ApodPipeline, ErrorKind, SyncConfig};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Clone)]
struct Stub {
    payload: Value,
    hits: Arc<AtomicUsize>,
}

async fn apod_handler(
    State(stub): State<Stub>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    if params.get("api_key").map(String::as_str) != Some("test-key") {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "API_KEY_INVALID"}))).into_response();
    }
    Json(stub.payload.clone()).into_response()
}

async fn spawn_apod_stub(payload: Value) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/planetary/apod", get(apod_handler))
        .with_state(Stub {
            payload,
            hits: Arc::clone(&hits),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve stub");
    });
    (addr, hits)
}

fn config_for(addr: SocketAddr, api_key: &str) -> SyncConfig {
    let env = HashMap::from([
        ("APOD_API_BASE_URL".to_string(), format!("http://{addr}")),
        ("NASA_API_KEY".to_string(), api_key.to_string()),
        ("APOD_MAX_RETRIES".to_string(), "0".to_string()),
    ]);
    SyncConfig::from_lookup(|key| env.get(key).cloned())
}

#[tokio::test]
async fn daily_run_loads_then_skips_same_date() {
    let payload = json!({
        "title": "T",
        "explanation": "E",
        "url": "u",
        "hdurl": "h",
        "date": "2024-01-01",
        "media_type": "image",
        "copyright": "NASA",
        "service_version": "v1"
    });
    let (addr, hits) = spawn_apod_stub(payload).await;
    let store = Arc::new(MemoryApodStore::new());
    let pipeline =
        ApodPipeline::new(config_for(addr, "test-key"), store.clone()).expect("pipeline");

    let first = pipeline.run_with_retry().await.expect("first run");
    assert!(matches!(first.outcome, LoadOutcome::Inserted { .. }));
    assert_eq!(first.outcome.to_string(), "Data loaded successfully");

    let second = pipeline.run_with_retry().await.expect("second run");
    assert_eq!(second.outcome, LoadOutcome::AlreadyExists);
    assert_eq!(second.outcome.to_string(), "Record already exists");

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(store.count().await.expect("count"), 1);

    let latest = second.verification.latest.expect("latest row");
    assert_eq!(latest.title, "T");
    assert_eq!(latest.hdurl, "h");
    assert_eq!(latest.media_type, "image");
}

#[tokio::test]
async fn empty_api_response_fails_without_loading() {
    let (addr, _hits) = spawn_apod_stub(json!({})).await;
    let store = Arc::new(MemoryApodStore::new());
    let pipeline =
        ApodPipeline::new(config_for(addr, "test-key"), store.clone()).expect("pipeline");

    let err = pipeline.run_once().await.expect_err("empty payload");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(store.rows().await.is_empty());
}

#[tokio::test]
async fn rejected_api_key_is_a_transport_failure() {
    let (addr, hits) = spawn_apod_stub(json!({"date": "2024-01-01"})).await;
    let store = Arc::new(MemoryApodStore::new());
    let pipeline = ApodPipeline::new(config_for(addr, "wrong"), store.clone()).expect("pipeline");

    let err = pipeline.run_with_retry().await.expect_err("403");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(!err.to_string().contains("wrong"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(store.rows().await.is_empty());
}
