//! Process-local event bus with cross-shard request/response.
//!
//! Producers (pixel writes, moderation actions, periodic jobs) never talk
//! to consumers (broadcasters, cache invalidators) directly:
//! ```text
//! pixel authority ──┐                        ┌── ConnectionManager
//! moderation    ────┼── EventBus ── fan-out ─┼── ChunkCacheGateway
//! online snapshot ──┘                        └── shard transport
//! ```
//! Two delivery paths exist. Synchronous listeners run inline with
//! [`EventBus::emit`], in registration order. Deferred consumers
//! ([`EventBus::subscribe`] / [`EventBus::on_async`]) receive events on a
//! later scheduling turn, so a listener that emits re-entrantly can never
//! have its event processed ahead of the original event's remaining
//! deliveries, and a failing consumer never blocks its siblings.
//!
//! Requests ([`EventBus::req`]) look synchronous to the caller but are
//! answered by whichever shard registered a responder and chose to answer;
//! a responder returning `None` silently declines, which is how replica
//! shards defer to the primary. A request with no answer always times out
//! after [`REQUEST_TIMEOUT`] — it can never hang.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Duration;
use uuid::Uuid;

use crate::protocol::{unpack_chunk_id, ChannelEntry, ChatMessage, OnlineCounter, Packet,
                      PixelCell};

/// How long a request waits for an answer before rejecting.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// Buffered events per deferred consumer before it starts lagging.
const EVENT_CAPACITY: usize = 512;

/// Role of this process in a horizontally scaled deployment.
///
/// Exactly one shard is configured as [`ShardRole::Primary`]; it is the
/// only one that answers coordinator queries on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    Primary,
    Replica,
}

/// Everything that travels over the bus.
///
/// Each variant maps to a stable channel name (see [`BusEvent::channel`])
/// so any external pub/sub transport can carry it between shards.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Pixel cells changed in one chunk; `frame` is the already-encoded
    /// PIXEL_UPDATE packet, serialized exactly once for all consumers.
    PixelUpdate {
        canvas_id: u8,
        chunk_id: u16,
        frame: Bytes,
    },
    /// A chunk's bytes changed (pixel write, image upload, rollback).
    ChunkUpdate { canvas_id: u8, i: u8, j: u8 },
    /// Fresh viewer counts, replacing the previous snapshot wholesale.
    OnlineCounter(OnlineCounter),
    /// Chat message; `to_api` steers whether API bridges re-deliver it,
    /// so a bridge never echoes a message back to its own source.
    ChatMessage { message: ChatMessage, to_api: bool },
    /// Somebody started or stopped typing in a channel.
    Typing {
        name: String,
        channel_id: u32,
        user_id: u32,
        is_typing: bool,
    },
    /// Site-wide announcement.
    Announcement {
        text: String,
        sent_at: u64,
        by: String,
    },
    /// A chat channel became visible to a user.
    AddChatChannel {
        user_id: u32,
        channel: ChannelEntry,
    },
    /// A chat channel was taken away from a user.
    RemoveChatChannel { user_id: u32, channel_id: u32 },
    /// Connections of this user must re-fetch their identity.
    ReloadUser { user_id: u32 },
    /// Global cooldown factor changed.
    CoolDownFactor { factor: f64 },
    /// Temporary per-IP cooldown modifier.
    IpCooldownModifier {
        ip: String,
        factor: f64,
        end_time_ms: u64,
    },
    /// Rate limit tripped for an IP.
    RateLimitTrigger { ip: String, block_time_ms: u64 },
    /// A fish appeared for all connections of an IP.
    FishAppears {
        ip: String,
        fish_type: u8,
        size_kg: u16,
    },
    /// A fish was caught; broadcast to all connections of the IP.
    FishCatched {
        ip: String,
        fish_type: u8,
        size_kg: u16,
    },
}

impl BusEvent {
    /// Stable channel name for shard transports.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::PixelUpdate { .. } => "pixelUpdate",
            Self::ChunkUpdate { .. } => "chunkUpdate",
            Self::OnlineCounter(_) => "onlineCounter",
            Self::ChatMessage { .. } => "chatMessage",
            Self::Typing { .. } => "typing",
            Self::Announcement { .. } => "announcement",
            Self::AddChatChannel { .. } => "addChatChannel",
            Self::RemoveChatChannel { .. } => "remChatChannel",
            Self::ReloadUser { .. } => "reloadUser",
            Self::CoolDownFactor { .. } => "setCoolDownFactor",
            Self::IpCooldownModifier { .. } => "ipCooldownModifier",
            Self::RateLimitTrigger { .. } => "rateLimitTrigger",
            Self::FishAppears { .. } => "sendFish",
            Self::FishCatched { .. } => "catchedFish",
        }
    }
}

/// Request kinds answered over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    PublicChannels,
    OnlineCount,
}

impl RequestKind {
    /// Stable channel name (`req:<name>`) for shard transports.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::PublicChannels => "req:publicChannels",
            Self::OnlineCount => "req:onlineCount",
        }
    }
}

/// A request travelling over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusRequest {
    PublicChannels,
    OnlineCount { canvas_id: u8 },
}

impl BusRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::PublicChannels => RequestKind::PublicChannels,
            Self::OnlineCount { .. } => RequestKind::OnlineCount,
        }
    }
}

/// Answers to [`BusRequest`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum BusResponse {
    PublicChannels(Vec<ChannelEntry>),
    OnlineCount(u16),
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("request {0:?} timed out after {secs}s", secs = REQUEST_TIMEOUT.as_secs())]
    Timeout(RequestKind),
    #[error("request {0:?} was dropped without a response")]
    Dropped(RequestKind),
}

type SyncListener = Arc<dyn Fn(&BusEvent) + Send + Sync>;
type Responder = Arc<dyn Fn(BusRequest) -> BoxFuture<'static, Option<BusResponse>> + Send + Sync>;
type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<BusResponse>>>>;

/// The event bus.
pub struct EventBus {
    role: ShardRole,
    sync_listeners: RwLock<Vec<SyncListener>>,
    events: broadcast::Sender<BusEvent>,
    responders: RwLock<HashMap<RequestKind, Vec<Responder>>>,
    pending: PendingMap,
    /// Latest viewer snapshot; replaced wholesale, never patched.
    online: RwLock<OnlineCounter>,
}

impl EventBus {
    pub fn new(role: ShardRole) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            role,
            sync_listeners: RwLock::new(Vec::new()),
            events,
            responders: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            online: RwLock::new(OnlineCounter::default()),
        }
    }

    pub fn role(&self) -> ShardRole {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == ShardRole::Primary
    }

    /// Register a synchronous listener, invoked inline with every `emit`
    /// in registration order.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.sync_listeners.write().push(Arc::new(listener));
    }

    /// Subscribe for deferred delivery. Events arrive in emit order on a
    /// later scheduling turn, independently per receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Spawn a consumer task invoking `listener` for every event.
    ///
    /// The returned handle can be aborted on shutdown. A lagging consumer
    /// drops its oldest events and keeps going.
    pub fn on_async<F>(&self, listener: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(BusEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("bus listener lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Deliver an event: synchronous listeners first, inline and in
    /// order, then the deferred channel.
    ///
    /// Listeners are cloned out of the registry before invocation, so a
    /// listener may register others or emit re-entrantly without
    /// deadlocking. A panicking listener is isolated and logged; its
    /// siblings still run.
    pub fn emit(&self, event: BusEvent) {
        let listeners: Vec<SyncListener> = self.sync_listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::error!("bus listener panicked on {}", event.channel());
            }
        }
        // no deferred subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a responder for one request kind.
    ///
    /// The handler runs on its own task per request. Returning `None`
    /// declines silently — the way a replica shard leaves coordinator
    /// queries to the primary.
    pub fn on_req<F, Fut>(&self, kind: RequestKind, handler: F)
    where
        F: Fn(BusRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<BusResponse>> + Send + 'static,
    {
        let responder: Responder =
            Arc::new(move |request| -> BoxFuture<'static, Option<BusResponse>> {
                Box::pin(handler(request))
            });
        self.responders.write().entry(kind).or_default().push(responder);
    }

    /// Ask the bus and wait for the first answer.
    ///
    /// The pending entry is removed on every path — first answer, caller
    /// timeout, or all responders declining — so it can never leak, and
    /// the one-shot channel makes double resolution structurally
    /// impossible.
    pub async fn req(&self, request: BusRequest) -> Result<BusResponse, BusError> {
        let kind = request.kind();
        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation, tx);

        let responders: Vec<Responder> = self
            .responders
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for responder in responders {
            let request = request.clone();
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                if let Some(response) = responder(request).await {
                    // first answer wins; the entry is gone for everyone else
                    if let Some(tx) = pending.lock().remove(&correlation) {
                        let _ = tx.send(response);
                    }
                }
            });
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&correlation);
                Err(BusError::Dropped(kind))
            }
            Err(_) => {
                self.pending.lock().remove(&correlation);
                Err(BusError::Timeout(kind))
            }
        }
    }

    /// Request against all shards. The bus itself is transport-agnostic;
    /// without a shard transport attached this is exactly [`EventBus::req`].
    pub async fn req_all(&self, request: BusRequest) -> Result<BusResponse, BusError> {
        self.req(request).await
    }

    // ───────────────────────────────────────────────────────────────
    // Typed producer surface
    // ───────────────────────────────────────────────────────────────

    /// Broadcast changed pixel cells of one chunk.
    ///
    /// The PIXEL_UPDATE frame is encoded exactly once here; every
    /// consumer down the line clones the same buffer. Also notifies chunk
    /// observers (the HTTP cache) that the tile changed.
    pub fn broadcast_pixels(&self, canvas_id: u8, chunk_id: u16, cells: Vec<PixelCell>) {
        let (i, j) = unpack_chunk_id(chunk_id);
        let frame = Bytes::from(Packet::PixelUpdate { i, j, cells }.encode());
        self.emit(BusEvent::PixelUpdate {
            canvas_id,
            chunk_id,
            frame,
        });
        self.emit(BusEvent::ChunkUpdate { canvas_id, i, j });
    }

    /// Chunk changed through something that is not a pixel stream
    /// (image upload, rollback, cleanup job).
    pub fn broadcast_chunk_update(&self, canvas_id: u8, i: u8, j: u8) {
        self.emit(BusEvent::ChunkUpdate { canvas_id, i, j });
    }

    pub fn broadcast_chat_message(&self, message: ChatMessage, to_api: bool) {
        self.emit(BusEvent::ChatMessage { message, to_api });
    }

    pub fn reload_user(&self, user_id: u32) {
        self.emit(BusEvent::ReloadUser { user_id });
    }

    pub fn announce(&self, text: impl Into<String>, sent_at: u64, by: impl Into<String>) {
        self.emit(BusEvent::Announcement {
            text: text.into(),
            sent_at,
            by: by.into(),
        });
    }

    pub fn set_cool_down_factor(&self, factor: f64) {
        self.emit(BusEvent::CoolDownFactor { factor });
    }

    pub fn send_fish(&self, ip: impl Into<String>, fish_type: u8, size_kg: u16) {
        self.emit(BusEvent::FishAppears {
            ip: ip.into(),
            fish_type,
            size_kg,
        });
    }

    pub fn catched_fish(&self, ip: impl Into<String>, fish_type: u8, size_kg: u16) {
        self.emit(BusEvent::FishCatched {
            ip: ip.into(),
            fish_type,
            size_kg,
        });
    }

    /// Replace the viewer snapshot from per-canvas IP lists and broadcast
    /// the new counts. The total deduplicates IPs watching several
    /// canvases at once.
    pub fn set_online_users(&self, per_canvas_ips: std::collections::BTreeMap<u8, Vec<String>>) {
        let mut counter = OnlineCounter::default();
        let mut unique_ips = std::collections::HashSet::new();
        for (canvas_id, ips) in &per_canvas_ips {
            counter.per_canvas.insert(*canvas_id, ips.len() as u16);
            for ip in ips {
                unique_ips.insert(ip.as_str());
            }
        }
        counter.total = unique_ips.len() as u16;
        *self.online.write() = counter;
        self.broadcast_online_counter();
    }

    /// Current viewer snapshot.
    pub fn online_counter(&self) -> OnlineCounter {
        self.online.read().clone()
    }

    pub fn broadcast_online_counter(&self) {
        let counter = self.online.read().clone();
        self.emit(BusEvent::OnlineCounter(counter));
    }
}
