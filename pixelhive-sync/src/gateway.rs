//! HTTP gateway serving binary chunk snapshots with a validator cache.
//!
//! ```text
//! GET /chunks/{canvas}/{i}/{j}
//!        │
//!        ├── query string?        → 400
//!        ├── bad coordinates      → 404 (fall through, never 500)
//!        ├── validator cache hit
//!        │   └── If-None-Match =  → 304, no store read
//!        └── chunk store fetch (timed)
//!            ├── error            → 503 (retry later)
//!            ├── empty chunk      → 200, empty body, nothing cached
//!            └── bytes            → weak validator cached, 200
//!                                   (or 304 if it matches the header)
//! ```
//!
//! Only the validator is ever cached, never the chunk bytes; the
//! authoritative store is read on every miss. A chunk-update
//! notification on the bus deletes the validator for exactly that chunk,
//! forcing one fresh computation on the next read and no speculative
//! work for untouched tiles. Presence in the map therefore always means
//! "fresh since the last write"; a stale hit is impossible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::{Duration, Instant};

use crate::bus::{BusEvent, EventBus};

/// Short public cache lifetime so intermediaries absorb read bursts
/// without meaningfully extending staleness.
const CACHE_CONTROL: &str = "public, s-maxage=60, max-age=40";

/// Store reads slower than this are logged even when they succeed.
const SLOW_READ: Duration = Duration::from_secs(6);

/// The authoritative chunk store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fetch a chunk's bytes; `None` for a chunk that was never written.
    async fn get_chunk(&self, canvas_id: u8, i: u8, j: u8) -> Result<Option<Bytes>, ChunkStoreError>;
}

/// Chunk store failure, surfaced to HTTP callers as 503.
#[derive(Debug, Clone, thiserror::Error)]
#[error("chunk store error: {0}")]
pub struct ChunkStoreError(pub String);

type EtagMap = Arc<Mutex<HashMap<(u8, u8, u8), String>>>;

#[derive(Clone)]
struct GatewayState {
    store: Arc<dyn ChunkStore>,
    etags: EtagMap,
}

/// HTTP tile cache bound to a bus for invalidation.
pub struct ChunkCacheGateway {
    state: GatewayState,
    invalidation: tokio::task::JoinHandle<()>,
}

impl ChunkCacheGateway {
    /// Wire the gateway to a chunk store and subscribe it to chunk
    /// updates on the bus.
    pub fn new(store: Arc<dyn ChunkStore>, bus: &EventBus) -> Self {
        let etags: EtagMap = Arc::new(Mutex::new(HashMap::new()));
        let invalidation_map = etags.clone();
        let invalidation = bus.on_async(move |event| {
            if let BusEvent::ChunkUpdate { canvas_id, i, j } = event {
                invalidation_map.lock().remove(&(canvas_id, i, j));
            }
        });
        Self {
            state: GatewayState { store, etags },
            invalidation,
        }
    }

    /// Router serving `GET /chunks/{canvasId}/{i}/{j}[.ext]`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/chunks/{canvas_id}/{i}/{j}", get(serve_chunk))
            .with_state(self.state.clone())
    }

    /// Number of cached validators, for monitoring.
    pub fn cached_validators(&self) -> usize {
        self.state.etags.lock().len()
    }
}

impl Drop for ChunkCacheGateway {
    fn drop(&mut self) {
        self.invalidation.abort();
    }
}

async fn serve_chunk(
    Path((canvas_id, i, j)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    // cache breakers were abused to force store reads
    if query.is_some() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(key) = parse_coords(&canvas_id, &i, &j) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (canvas_id, i, j) = key;

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let cached = state.etags.lock().get(&key).cloned();
    if let (Some(validator), Some(client)) = (&cached, &if_none_match) {
        if validator == client {
            return not_modified(validator);
        }
    }

    let started = Instant::now();
    let chunk = state.store.get_chunk(canvas_id, i, j).await;
    let elapsed = started.elapsed();
    if elapsed > SLOW_READ {
        log::warn!(
            "long store response time of {}ms for chunk {canvas_id}:{i},{j}",
            elapsed.as_millis()
        );
    }

    let chunk = match chunk {
        Ok(chunk) => chunk,
        Err(e) => {
            log::error!("error reading chunk {canvas_id}:{i},{j}: {e}");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let Some(bytes) = chunk.filter(|b| !b.is_empty()) else {
        // never-written chunk: empty body, no validator to cache
        return (
            StatusCode::OK,
            [
                (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
                (
                    header::CONTENT_TYPE,
                    "application/octet-stream".to_string(),
                ),
            ],
        )
            .into_response();
    };

    let validator = weak_validator(&bytes);
    state.etags.lock().insert(key, validator.clone());
    if if_none_match.as_deref() == Some(validator.as_str()) {
        return not_modified(&validator);
    }

    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::ETAG, validator),
        ],
        Body::from(bytes),
    )
        .into_response()
}

fn not_modified(validator: &str) -> Response {
    (
        StatusCode::NOT_MODIFIED,
        [
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            (header::ETAG, validator.to_string()),
        ],
    )
        .into_response()
}

/// Parse path coordinates; the last segment may carry a file extension
/// (`3.bmp`). Anything unparsable falls through as "not found".
fn parse_coords(canvas_id: &str, i: &str, j: &str) -> Option<(u8, u8, u8)> {
    let j = j.split('.').next().unwrap_or(j);
    Some((
        canvas_id.parse().ok()?,
        i.parse().ok()?,
        j.parse().ok()?,
    ))
}

/// Weak validator over the chunk bytes: length plus a truncated sha256.
fn weak_validator(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut head = String::with_capacity(16);
    for byte in &digest[..8] {
        head.push_str(&format!("{byte:02x}"));
    }
    format!("W/\"{}-{}\"", bytes.len(), head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ShardRole;

    struct MapStore {
        chunks: Mutex<HashMap<(u8, u8, u8), Bytes>>,
    }

    #[async_trait]
    impl ChunkStore for MapStore {
        async fn get_chunk(
            &self,
            canvas_id: u8,
            i: u8,
            j: u8,
        ) -> Result<Option<Bytes>, ChunkStoreError> {
            Ok(self.chunks.lock().get(&(canvas_id, i, j)).cloned())
        }
    }

    #[test]
    fn test_parse_coords() {
        assert_eq!(parse_coords("0", "12", "3"), Some((0, 12, 3)));
        assert_eq!(parse_coords("7", "0", "3.bmp"), Some((7, 0, 3)));
        assert_eq!(parse_coords("x", "0", "0"), None);
        assert_eq!(parse_coords("0", "-1", "0"), None);
        assert_eq!(parse_coords("0", "300", "0"), None);
        assert_eq!(parse_coords("0", "0", ".bmp"), None);
    }

    #[test]
    fn test_weak_validator_tracks_content() {
        let a = weak_validator(b"pixels");
        let b = weak_validator(b"pixels");
        let c = weak_validator(b"other pixels");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("W/\""));
    }

    #[tokio::test]
    async fn test_invalidation_deletes_exactly_one_key() {
        let bus = EventBus::new(ShardRole::Primary);
        let store = Arc::new(MapStore {
            chunks: Mutex::new(HashMap::new()),
        });
        let gateway = ChunkCacheGateway::new(store, &bus);
        gateway
            .state
            .etags
            .lock()
            .insert((0, 1, 2), "W/\"a\"".into());
        gateway
            .state
            .etags
            .lock()
            .insert((0, 3, 4), "W/\"b\"".into());

        bus.broadcast_chunk_update(0, 1, 2);
        // deferred consumer needs a few turns
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let etags = gateway.state.etags.lock();
        assert!(!etags.contains_key(&(0, 1, 2)));
        assert!(etags.contains_key(&(0, 3, 4)));
    }

    #[tokio::test]
    async fn test_cached_validator_count() {
        let bus = EventBus::new(ShardRole::Primary);
        let store = Arc::new(MapStore {
            chunks: Mutex::new(HashMap::new()),
        });
        let gateway = ChunkCacheGateway::new(store, &bus);
        assert_eq!(gateway.cached_validators(), 0);
    }
}
