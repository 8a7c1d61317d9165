//! HTTP tests for the chunk cache gateway: a bound axum server, a real
//! client, and a scripted chunk store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::time::Duration;

use pixelhive_sync::{ChunkCacheGateway, ChunkStore, ChunkStoreError, EventBus, ShardRole};

struct ScriptedStore {
    chunks: Mutex<HashMap<(u8, u8, u8), Bytes>>,
    reads: AtomicUsize,
    fail: AtomicBool,
}

impl ScriptedStore {
    fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn put(&self, canvas_id: u8, i: u8, j: u8, bytes: &[u8]) {
        self.chunks
            .lock()
            .insert((canvas_id, i, j), Bytes::copy_from_slice(bytes));
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkStore for ScriptedStore {
    async fn get_chunk(
        &self,
        canvas_id: u8,
        i: u8,
        j: u8,
    ) -> Result<Option<Bytes>, ChunkStoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChunkStoreError("store is down".into()));
        }
        Ok(self.chunks.lock().get(&(canvas_id, i, j)).cloned())
    }
}

struct HttpHarness {
    bus: Arc<EventBus>,
    store: Arc<ScriptedStore>,
    base_url: String,
    // dropping the gateway would cancel the invalidation listener
    _gateway: ChunkCacheGateway,
}

async fn start_gateway() -> HttpHarness {
    let bus = Arc::new(EventBus::new(ShardRole::Primary));
    let store = Arc::new(ScriptedStore::new());
    let gateway = ChunkCacheGateway::new(store.clone(), &bus);
    let router = gateway.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    HttpHarness {
        bus,
        store,
        base_url: format!("http://{addr}"),
        _gateway: gateway,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conditional_flow_serves_from_validator_cache() {
    let harness = start_gateway().await;
    harness.store.put(0, 1, 2, b"chunk bytes v1");
    let client = reqwest::Client::new();
    let url = format!("{}/chunks/0/1/2", harness.base_url);

    // first read computes and caches the validator
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first
        .headers()
        .get(CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("s-maxage=60"));
    let validator = first.headers().get(ETAG).unwrap().to_str().unwrap().to_string();
    assert!(validator.starts_with("W/\""));
    assert_eq!(first.bytes().await.unwrap().as_ref(), b"chunk bytes v1");
    assert_eq!(harness.store.reads(), 1);

    // conditional hit: 304, empty body, no store read at all
    let second = client
        .get(&url)
        .header(IF_NONE_MATCH, &validator)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert!(second.bytes().await.unwrap().is_empty());
    assert_eq!(harness.store.reads(), 1);

    // a different client revalidator misses the header check but the
    // freshly computed validator still matches its own cache entry
    let third = client.get(&url).send().await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    assert_eq!(harness.store.reads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chunk_update_forces_recomputation() {
    let harness = start_gateway().await;
    harness.store.put(3, 4, 5, b"before");
    let client = reqwest::Client::new();
    let url = format!("{}/chunks/3/4/5", harness.base_url);

    let first = client.get(&url).send().await.unwrap();
    let old_validator = first.headers().get(ETAG).unwrap().to_str().unwrap().to_string();
    assert_eq!(harness.store.reads(), 1);

    // live write: the tile changes and the bus says so
    harness.store.put(3, 4, 5, b"after");
    harness.bus.broadcast_chunk_update(3, 4, 5);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the stale validator can never produce a 304 again
    let second = client
        .get(&url)
        .header(IF_NONE_MATCH, &old_validator)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let new_validator = second.headers().get(ETAG).unwrap().to_str().unwrap().to_string();
    assert_ne!(new_validator, old_validator);
    assert_eq!(second.bytes().await.unwrap().as_ref(), b"after");
    assert_eq!(harness.store.reads(), 2);

    // and the new validator is cached again
    let third = client
        .get(&url)
        .header(IF_NONE_MATCH, &new_validator)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(harness.store.reads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_strings_are_rejected() {
    let harness = start_gateway().await;
    harness.store.put(0, 0, 0, b"bytes");
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/chunks/0/0/0?cachebreaker=1", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // the store was never consulted
    assert_eq!(harness.store.reads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_coordinates_fall_through() {
    let harness = start_gateway().await;
    let client = reqwest::Client::new();

    for path in ["/chunks/abc/0/0", "/chunks/0/999/0", "/chunks/0/0/x.bmp"] {
        let response = client
            .get(format!("{}{path}", harness.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "for {path}");
    }
    assert_eq!(harness.store.reads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_extension_on_last_coordinate_is_accepted() {
    let harness = start_gateway().await;
    harness.store.put(7, 8, 9, b"tiles");
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/chunks/7/8/9.bmp", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"tiles");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_chunk_returns_empty_body_and_caches_nothing() {
    let harness = start_gateway().await;
    let client = reqwest::Client::new();
    let url = format!("{}/chunks/0/9/9", harness.base_url);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(ETAG).is_none());
    assert!(response.bytes().await.unwrap().is_empty());
    assert_eq!(harness.store.reads(), 1);

    // nothing was cached, so the next read hits the store again
    let again = client.get(&url).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(harness.store.reads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_errors_surface_as_retry_later() {
    let harness = start_gateway().await;
    harness.store.put(0, 1, 1, b"bytes");
    harness.store.fail.store(true, Ordering::SeqCst);
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/chunks/0/1/1", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // recovery: the same request works once the store is back
    harness.store.fail.store(false, Ordering::SeqCst);
    let response = client
        .get(format!("{}/chunks/0/1/1", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
