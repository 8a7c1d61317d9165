//! WebSocket connection manager: subscriptions, heartbeat, fan-out.
//!
//! ```text
//! client A ──┐                       ┌── sub pxl / chunk regs
//! client B ──┼── SyncServer ── state ┼── sub chat/online/reloadUser
//! bridge  ───┘        │              └── liveness flag
//!                     │
//!             EventBus events ── encode once ── write to every
//!                                               filter-matching socket
//! ```
//!
//! Every connection starts with all subscription flags false and is only
//! ever mutated by its own inbound handling. A heartbeat sweep pings all
//! connections on a fixed interval and terminates any that stayed silent
//! for a full interval — two strikes, no more, so half-open sockets are
//! bounded without punishing jitter.
//!
//! Broadcast frames are serialized exactly once; the same bytes are
//! cloned (refcounted) into every matching connection's outbound queue.
//! A failing socket is logged and skipped, never allowed to stall the
//! others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use uuid::Uuid;

use crate::bus::{BusEvent, BusRequest, BusResponse, EventBus, RequestKind};
use crate::protocol::{parse_captcha_solution, split_tagged, ChannelEntry, Packet, PixelReturn,
                      ServerCommand, TextMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret for the upgrade handshake; empty rejects everyone
    pub api_key: String,
    /// Heartbeat sweep interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Online-counter snapshot interval in seconds
    pub online_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9310".to_string(),
            api_key: String::new(),
            heartbeat_interval_secs: 45,
            online_interval_secs: 15,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub frames_broadcast: u64,
}

/// Per-connection subscription flags. All false until the connection
/// subscribes itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub chat: bool,
    pub pixel_stream: bool,
    pub online_counter: bool,
    pub user_reload: bool,
}

/// Verdict of the pixel authority for one placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelPlacement {
    /// 0 = accepted
    pub ret_code: u8,
    pub wait_ms: u32,
    pub cool_down_s: i16,
}

/// Authority over pixel writes. Implementations are expected to announce
/// accepted pixels through [`EventBus::broadcast_pixels`], which is what
/// fans them out to watchers and invalidates the chunk cache.
#[async_trait]
pub trait PixelAuthority: Send + Sync {
    /// Place a pixel addressed by absolute canvas coordinates.
    async fn set_pixel_by_coords(&self, canvas_id: u8, color: u8, x: i64, y: i64)
        -> PixelPlacement;
    /// Place a pixel addressed by chunk and in-chunk offset.
    async fn set_pixel_in_chunk(&self, canvas_id: u8, i: u8, j: u8, offset: u16, color: u8)
        -> PixelPlacement;
}

/// The two public channel registries. Queried fresh on every snapshot so
/// channel changes are visible immediately.
pub trait ChannelRegistry: Send + Sync {
    fn default_channels(&self) -> Vec<ChannelEntry>;
    fn lang_channels(&self) -> Vec<ChannelEntry>;
}

/// Captcha checking; returns the protocol return code (0 = solved).
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, solution: &str, captcha_id: &str) -> u8;
}

/// Per-country cooldown modifier authority.
#[async_trait]
pub trait CooldownAuthority: Send + Sync {
    async fn set_country_cooldown_factor(&self, country: &str, factor: f64, end_time_ms: u64);
    async fn reset_country_cooldown_factor(&self, country: &str);
}

/// External collaborators the manager consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub pixels: Arc<dyn PixelAuthority>,
    pub channels: Arc<dyn ChannelRegistry>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub cooldown: Arc<dyn CooldownAuthority>,
}

struct ConnState {
    subs: Subscriptions,
    alive: bool,
    canvas_id: u8,
    chunks: HashSet<u16>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            subs: Subscriptions::default(),
            alive: true,
            canvas_id: 0,
            chunks: HashSet::new(),
        }
    }
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<Mutex<ConnState>>,
    ip: String,
}

struct Shared {
    config: ServerConfig,
    bus: Arc<EventBus>,
    collab: Collaborators,
    connections: RwLock<HashMap<Uuid, Connection>>,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, bus: Arc<EventBus>, collab: Collaborators) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                collab,
                connections: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Run the accept loop. Background tasks (bus fan-out, heartbeat,
    /// online snapshot) live exactly as long as this future.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.register_responders();
        let fanout = Shared::spawn_bus_fanout(self.shared.clone());
        let heartbeat = Shared::spawn_heartbeat(self.shared.clone());
        let online = Shared::spawn_online_tracker(self.shared.clone());

        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.shared.config.bind_addr);

        let result = loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("new tcp connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Shared::handle_connection(shared, stream, addr).await {
                            log::debug!("connection from {addr} ended: {e}");
                        }
                    });
                }
                Err(e) => break Err(e.into()),
            }
        };

        fanout.abort();
        heartbeat.abort();
        online.abort();
        result
    }

    /// Register the coordinator responders. Only the primary shard
    /// answers; replicas decline with the no-answer sentinel.
    fn register_responders(&self) {
        let shared = self.shared.clone();
        self.shared.bus.on_req(RequestKind::PublicChannels, move |_| {
            let shared = shared.clone();
            async move {
                if !shared.bus.is_primary() {
                    return None;
                }
                Some(BusResponse::PublicChannels(shared.public_channels()))
            }
        });

        let shared = self.shared.clone();
        self.shared.bus.on_req(RequestKind::OnlineCount, move |request| {
            let shared = shared.clone();
            async move {
                if !shared.bus.is_primary() {
                    return None;
                }
                let BusRequest::OnlineCount { canvas_id } = request else {
                    return None;
                };
                let connections = shared.connections.read().await;
                let count = connections
                    .values()
                    .filter(|c| c.state.lock().canvas_id == canvas_id)
                    .count() as u16;
                Some(BusResponse::OnlineCount(count))
            }
        });
    }
}

impl Shared {
    /// Merge both channel registries. Built fresh on every call so a
    /// channel created after startup is visible in the next snapshot.
    fn public_channels(&self) -> Vec<ChannelEntry> {
        let mut channels = self.collab.channels.default_channels();
        channels.extend(self.collab.channels.lang_channels());
        channels
    }

    async fn broadcast_binary<F>(&self, frame: Bytes, filter: F, exclude: Option<Uuid>)
    where
        F: Fn(&Connection, &ConnState) -> bool,
    {
        let connections = self.connections.read().await;
        let mut delivered = 0u64;
        for (id, conn) in connections.iter() {
            if Some(*id) == exclude {
                continue;
            }
            let matching = {
                let state = conn.state.lock();
                filter(conn, &state)
            };
            if !matching {
                continue;
            }
            // same refcounted bytes for every receiver
            if let Err(e) = conn.tx.send(Message::Binary(frame.clone())) {
                log::error!("websocket broadcast error: {e}");
            } else {
                delivered += 1;
            }
        }
        drop(connections);
        self.stats.write().await.frames_broadcast += delivered;
    }

    async fn broadcast_text<F>(&self, text: Utf8Bytes, filter: F, exclude: Option<Uuid>)
    where
        F: Fn(&Connection, &ConnState) -> bool,
    {
        let connections = self.connections.read().await;
        let mut delivered = 0u64;
        for (id, conn) in connections.iter() {
            if Some(*id) == exclude {
                continue;
            }
            let matching = {
                let state = conn.state.lock();
                filter(conn, &state)
            };
            if !matching {
                continue;
            }
            if let Err(e) = conn.tx.send(Message::Text(text.clone())) {
                log::error!("websocket broadcast error: {e}");
            } else {
                delivered += 1;
            }
        }
        drop(connections);
        self.stats.write().await.frames_broadcast += delivered;
    }

    fn spawn_bus_fanout(shared: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = shared.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => shared.dispatch_bus_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("server fan-out lagged by {n} bus events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::OnlineCounter(counter) => {
                let frame = Bytes::from(Packet::OnlineCounter(counter).encode());
                self.broadcast_binary(frame, |_, st| st.subs.online_counter, None)
                    .await;
            }
            BusEvent::PixelUpdate {
                canvas_id,
                chunk_id,
                frame,
            } => {
                self.broadcast_binary(
                    frame,
                    move |_, st| {
                        st.subs.pixel_stream
                            || (st.canvas_id == canvas_id && st.chunks.contains(&chunk_id))
                    },
                    None,
                )
                .await;
            }
            BusEvent::ChatMessage { message, to_api } => {
                if to_api {
                    let text: Utf8Bytes = TextMessage::Chat(message).encode().into();
                    self.broadcast_text(text, |_, st| st.subs.chat, None).await;
                }
            }
            BusEvent::Typing {
                name,
                channel_id,
                user_id,
                is_typing,
            } => {
                let text: Utf8Bytes = TextMessage::Typing {
                    name,
                    channel_id,
                    user_id,
                    is_typing,
                }
                .encode()
                .into();
                self.broadcast_text(text, |_, st| st.subs.chat, None).await;
            }
            BusEvent::Announcement { text, sent_at, by } => {
                let text: Utf8Bytes = TextMessage::Announcement { text, sent_at, by }
                    .encode()
                    .into();
                self.broadcast_text(text, |_, _| true, None).await;
            }
            BusEvent::AddChatChannel { channel, .. } => {
                let text: Utf8Bytes = TextMessage::ChannelAdded(channel).encode().into();
                self.broadcast_text(text, |_, st| st.subs.chat, None).await;
            }
            BusEvent::RemoveChatChannel { channel_id, .. } => {
                let text: Utf8Bytes = TextMessage::ChannelRemoved { channel_id }.encode().into();
                self.broadcast_text(text, |_, st| st.subs.chat, None).await;
            }
            BusEvent::ReloadUser { user_id } => {
                let text: Utf8Bytes = TextMessage::UserReload { user_id }.encode().into();
                self.broadcast_text(text, |_, st| st.subs.user_reload, None).await;
            }
            BusEvent::FishAppears {
                ip,
                fish_type,
                size_kg,
            } => {
                let frame = Bytes::from(Packet::FishAppears { fish_type, size_kg }.encode());
                self.broadcast_binary(frame, move |conn, _| conn.ip == ip, None)
                    .await;
            }
            BusEvent::FishCatched {
                ip,
                fish_type,
                size_kg,
            } => {
                let frame = Bytes::from(Packet::FishCatched { fish_type, size_kg }.encode());
                self.broadcast_binary(frame, move |conn, _| conn.ip == ip, None)
                    .await;
            }
            // consumed elsewhere (cache gateway, game logic)
            BusEvent::ChunkUpdate { .. }
            | BusEvent::CoolDownFactor { .. }
            | BusEvent::IpCooldownModifier { .. }
            | BusEvent::RateLimitTrigger { .. } => {}
        }
    }

    /// Two-strike sweep: ping everyone, terminate whoever never answered
    /// since the previous sweep.
    fn spawn_heartbeat(shared: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                shared.config.heartbeat_interval_secs,
            ));
            loop {
                ticker.tick().await;
                let mut dead = Vec::new();
                {
                    let connections = shared.connections.read().await;
                    for (id, conn) in connections.iter() {
                        let mut state = conn.state.lock();
                        if !state.alive {
                            dead.push(*id);
                        } else {
                            state.alive = false;
                            let _ = conn.tx.send(Message::Ping(Bytes::new()));
                        }
                    }
                }
                if dead.is_empty() {
                    continue;
                }
                let mut connections = shared.connections.write().await;
                for id in dead {
                    if let Some(conn) = connections.remove(&id) {
                        log::info!("terminating unresponsive connection {id}");
                        let _ = conn.tx.send(Message::Close(None));
                    }
                }
            }
        })
    }

    /// Snapshot per-canvas viewer IPs and hand them to the bus, which
    /// rebuilds the online counter wholesale and broadcasts it.
    fn spawn_online_tracker(shared: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(shared.config.online_interval_secs));
            loop {
                ticker.tick().await;
                let mut per_canvas: BTreeMap<u8, Vec<String>> = BTreeMap::new();
                {
                    let connections = shared.connections.read().await;
                    for conn in connections.values() {
                        let canvas_id = conn.state.lock().canvas_id;
                        per_canvas.entry(canvas_id).or_default().push(conn.ip.clone());
                    }
                }
                shared.bus.set_online_users(per_canvas);
            }
        })
    }

    async fn handle_connection(
        shared: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let api_key = shared.config.api_key.clone();
        let expected = format!("Bearer {api_key}");
        let auth = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let presented = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            if !api_key.is_empty() && presented == Some(expected.as_str()) {
                log::debug!("upgrade from {addr} authenticated");
                Ok(response)
            } else {
                log::warn!("upgrade from {addr} not authenticated");
                let mut reject = ErrorResponse::new(Some("Unauthorized".to_string()));
                *reject.status_mut() = StatusCode::UNAUTHORIZED;
                Err(reject)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, auth).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let state = Arc::new(Mutex::new(ConnState::new()));
        shared.connections.write().await.insert(
            id,
            Connection {
                tx: tx.clone(),
                state: state.clone(),
                ip: addr.ip().to_string(),
            },
        );
        {
            let mut stats = shared.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }
        log::info!("connection {id} established from {addr}");

        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(message)) => {
                        // any inbound traffic counts as liveness
                        state.lock().alive = true;
                        shared.stats.write().await.messages_received += 1;
                        match message {
                            Message::Binary(data) => {
                                shared.handle_packet(id, &state, &tx, &data).await;
                            }
                            Message::Text(text) => {
                                shared.handle_text(id, &tx, text.as_str()).await;
                            }
                            Message::Ping(payload) => {
                                let _ = tx.send(Message::Pong(payload));
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("websocket error on connection {id}: {e}");
                        break;
                    }
                    None => break,
                },
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if ws_tx.send(message).await.is_err() {
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    // all senders gone: the heartbeat removed us
                    None => break,
                },
            }
        }

        shared.connections.write().await.remove(&id);
        shared.stats.write().await.active_connections -= 1;
        log::info!("connection {id} closed");
        Ok(())
    }

    async fn handle_packet(
        &self,
        id: Uuid,
        state: &Arc<Mutex<ConnState>>,
        tx: &mpsc::UnboundedSender<Message>,
        data: &[u8],
    ) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("undecipherable frame from connection {id}: {e}");
                return;
            }
        };
        match packet {
            Packet::RegCanvas { canvas_id } => {
                let mut state = state.lock();
                state.canvas_id = canvas_id;
                state.chunks.clear();
            }
            Packet::RegChunk { chunk_id } => {
                state.lock().chunks.insert(chunk_id);
            }
            Packet::DeRegChunk { chunk_id } => {
                state.lock().chunks.remove(&chunk_id);
            }
            Packet::RegMChunks { chunk_ids } => {
                state.lock().chunks.extend(chunk_ids);
            }
            Packet::DeRegMChunks { chunk_ids } => {
                let mut state = state.lock();
                for chunk_id in chunk_ids {
                    state.chunks.remove(&chunk_id);
                }
            }
            Packet::PixelUpdate { i, j, cells } => {
                let canvas_id = state.lock().canvas_id;
                let mut placed = 0u8;
                let mut verdict = PixelPlacement::default();
                for cell in &cells {
                    verdict = self
                        .collab
                        .pixels
                        .set_pixel_in_chunk(canvas_id, i, j, cell.offset, cell.color)
                        .await;
                    if verdict.ret_code != 0 {
                        break;
                    }
                    placed += 1;
                }
                let ret = Packet::PixelReturn(PixelReturn {
                    ret_code: verdict.ret_code,
                    wait_ms: verdict.wait_ms,
                    cool_down_s: verdict.cool_down_s,
                    pixel_count: placed,
                });
                let _ = tx.send(Message::Binary(ret.encode().into()));
                let _ = tx.send(Message::Binary(
                    Packet::CoolDown {
                        wait_ms: verdict.wait_ms,
                    }
                    .encode()
                    .into(),
                ));
            }
            // liveness was already refreshed; a ping has no reply opcode
            Packet::Ping => {}
            other => {
                log::debug!(
                    "unexpected {:?} frame from connection {id}",
                    other.opcode()
                );
            }
        }
    }

    async fn handle_text(&self, id: Uuid, tx: &mpsc::UnboundedSender<Message>, text: &str) {
        let trimmed = text.trim();
        if trimmed.starts_with('[') {
            match ServerCommand::parse(trimmed) {
                Ok(command) => self.handle_command(id, tx, command).await,
                Err(e) => log::warn!("undecipherable command from connection {id}: {e}"),
            }
            return;
        }
        match split_tagged(trimmed) {
            Some(("cs", payload)) => match parse_captcha_solution(payload) {
                Ok((solution, captcha_id)) => {
                    let ret_code = self.collab.captcha.verify(&solution, &captcha_id).await;
                    let _ = tx.send(Message::Binary(
                        Packet::CaptchaReturn { ret_code }.encode().into(),
                    ));
                }
                Err(e) => log::warn!("undecipherable captcha solution from {id}: {e}"),
            },
            Some((tag, _)) => {
                log::debug!("ignoring {tag} message from connection {id}");
            }
            None => log::warn!("undecipherable message from connection {id}"),
        }
    }

    async fn handle_command(
        &self,
        id: Uuid,
        tx: &mpsc::UnboundedSender<Message>,
        command: ServerCommand,
    ) {
        match command {
            ServerCommand::Sub(channel) => {
                let state = {
                    let connections = self.connections.read().await;
                    connections.get(&id).map(|c| c.state.clone())
                };
                let Some(state) = state else { return };
                match channel.as_str() {
                    "chat" => {
                        state.lock().subs.chat = true;
                        // merged fresh from both registries on every sub
                        let reply = TextMessage::ChannelList(self.public_channels()).encode();
                        let _ = tx.send(Message::Text(reply.into()));
                    }
                    "pxl" => state.lock().subs.pixel_stream = true,
                    "online" => state.lock().subs.online_counter = true,
                    "reloadUser" => state.lock().subs.user_reload = true,
                    other => {
                        log::info!("connection {id} wanted to sub to nonexistent {other}");
                        return;
                    }
                }
                log::info!("connection {id} subscribed to {channel}");
            }
            ServerCommand::SetPixel {
                actor,
                ip,
                x,
                y,
                color,
            } => {
                if actor.is_some() || ip.is_some() {
                    log::debug!("setpxl with actor/ip routing is not supported anymore");
                    return;
                }
                let placement = self.collab.pixels.set_pixel_by_coords(0, color, x, y).await;
                let reply = TextMessage::PixelVerdict {
                    success: placement.ret_code == 0,
                    wait_ms: placement.wait_ms,
                    cool_down_s: placement.cool_down_s,
                }
                .encode();
                let _ = tx.send(Message::Text(reply.into()));
            }
            ServerCommand::Chat(message) => {
                // hand to the bus for the user-facing side and other
                // shards; api bridges get it below, minus the source
                self.bus.broadcast_chat_message(message.clone(), false);
                let text: Utf8Bytes = TextMessage::Chat(message).encode().into();
                self.broadcast_text(text, |_, st| st.subs.chat, Some(id)).await;
            }
            ServerCommand::SetCooldownFactor {
                country,
                factor,
                end_time_ms,
            } => match factor {
                Some(factor) => {
                    self.collab
                        .cooldown
                        .set_country_cooldown_factor(&country, factor, end_time_ms.unwrap_or(0))
                        .await;
                }
                None => {
                    self.collab
                        .cooldown
                        .reset_country_cooldown_factor(&country)
                        .await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ShardRole;

    struct NoopPixels;

    #[async_trait]
    impl PixelAuthority for NoopPixels {
        async fn set_pixel_by_coords(&self, _: u8, _: u8, _: i64, _: i64) -> PixelPlacement {
            PixelPlacement::default()
        }
        async fn set_pixel_in_chunk(&self, _: u8, _: u8, _: u8, _: u16, _: u8) -> PixelPlacement {
            PixelPlacement {
                ret_code: 0,
                wait_ms: 1000,
                cool_down_s: 0,
            }
        }
    }

    struct MutableChannels {
        channels: Mutex<Vec<ChannelEntry>>,
    }

    impl ChannelRegistry for MutableChannels {
        fn default_channels(&self) -> Vec<ChannelEntry> {
            self.channels.lock().clone()
        }
        fn lang_channels(&self) -> Vec<ChannelEntry> {
            vec![ChannelEntry(100, "de".into())]
        }
    }

    struct NoopCaptcha;

    #[async_trait]
    impl CaptchaVerifier for NoopCaptcha {
        async fn verify(&self, _: &str, _: &str) -> u8 {
            0
        }
    }

    struct NoopCooldown;

    #[async_trait]
    impl CooldownAuthority for NoopCooldown {
        async fn set_country_cooldown_factor(&self, _: &str, _: f64, _: u64) {}
        async fn reset_country_cooldown_factor(&self, _: &str) {}
    }

    fn test_server(registry: Arc<MutableChannels>) -> SyncServer {
        let bus = Arc::new(EventBus::new(ShardRole::Primary));
        let collab = Collaborators {
            pixels: Arc::new(NoopPixels),
            channels: registry,
            captcha: Arc::new(NoopCaptcha),
            cooldown: Arc::new(NoopCooldown),
        };
        SyncServer::new(ServerConfig::default(), bus, collab)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9310");
        assert!(config.api_key.is_empty());
        assert_eq!(config.heartbeat_interval_secs, 45);
        assert_eq!(config.online_interval_secs, 15);
    }

    #[test]
    fn test_subscriptions_start_false() {
        let state = ConnState::new();
        assert_eq!(state.subs, Subscriptions::default());
        assert!(!state.subs.chat);
        assert!(!state.subs.pixel_stream);
        assert!(state.alive);
        assert_eq!(state.canvas_id, 0);
        assert!(state.chunks.is_empty());
    }

    #[test]
    fn test_channel_snapshot_merges_fresh_every_time() {
        let registry = Arc::new(MutableChannels {
            channels: Mutex::new(vec![ChannelEntry(0, "en".into())]),
        });
        let server = test_server(registry.clone());

        let first = server.shared.public_channels();
        assert_eq!(
            first,
            vec![ChannelEntry(0, "en".into()), ChannelEntry(100, "de".into())]
        );

        // registries changed after startup; the next snapshot sees it
        registry
            .channels
            .lock()
            .push(ChannelEntry(1, "int".into()));
        let second = server.shared.public_channels();
        assert_eq!(second.len(), 3);
        assert!(second.contains(&ChannelEntry(1, "int".into())));
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let registry = Arc::new(MutableChannels {
            channels: Mutex::new(Vec::new()),
        });
        let server = test_server(registry);
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.frames_broadcast, 0);
    }

    #[tokio::test]
    async fn test_replica_declines_coordinator_queries() {
        let bus = Arc::new(EventBus::new(ShardRole::Replica));
        let collab = Collaborators {
            pixels: Arc::new(NoopPixels),
            channels: Arc::new(MutableChannels {
                channels: Mutex::new(vec![ChannelEntry(0, "en".into())]),
            }),
            captcha: Arc::new(NoopCaptcha),
            cooldown: Arc::new(NoopCooldown),
        };
        let server = SyncServer::new(ServerConfig::default(), bus.clone(), collab);
        server.register_responders();

        tokio::time::pause();
        let result = bus.req(BusRequest::PublicChannels).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_primary_answers_public_channels() {
        let registry = Arc::new(MutableChannels {
            channels: Mutex::new(vec![ChannelEntry(0, "en".into())]),
        });
        let server = test_server(registry);
        server.register_responders();

        let response = server.shared.bus.req(BusRequest::PublicChannels).await.unwrap();
        assert_eq!(
            response,
            BusResponse::PublicChannels(vec![
                ChannelEntry(0, "en".into()),
                ChannelEntry(100, "de".into())
            ])
        );
    }
}
