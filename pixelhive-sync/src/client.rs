//! Reconnecting sync client mirroring the wire protocol.
//!
//! ```text
//! CONNECTING ──ok──► OPEN ──error/silence──► CLOSED ──backoff──┐
//!     ▲                │                                       │
//!     └────────────────┴── CHANGE_ME: immediate ◄──────────────┘
//! ```
//!
//! A freshly opened socket is self-healing: the agent re-announces its
//! canvas selection and every chunk the local view registered, then
//! flushes messages queued while offline, in their original order. No
//! server-side session stickiness is needed.
//!
//! Captcha and pixel submissions are matched to their response frames by
//! kind only, oldest first. There is no correlation id on the wire, so
//! two outstanding requests of the same kind can be answered out of order
//! if the server reorders; this mirrors the deployed protocol and is
//! covered by tests rather than silently redesigned.
//!
//! The liveness loop runs every 2s: 30s without any inbound traffic
//! closes the socket (the server is presumed half-dead), 23s without
//! outbound traffic sends a heartbeat — both deliberately below the ~60s
//! idle timeout of common intermediaries.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{encode_captcha_solution, ChannelEntry, ChatMessage, OnlineCounter, Packet,
                      PixelCell, PixelReturn, ServerCommand, TextMessage};

/// Liveness check cadence.
pub const HEALTH_TICK: Duration = Duration::from_secs(2);
/// Inbound silence after which the server is presumed half-dead.
pub const INBOUND_SILENCE_LIMIT: Duration = Duration::from_secs(30);
/// Outbound idle time after which a heartbeat is sent.
pub const OUTBOUND_IDLE_LIMIT: Duration = Duration::from_secs(23);
/// How long a captcha or pixel submission waits for its response frame.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(20);

/// A connection that lived at least this long failed for transient
/// reasons; shorter-lived ones look like a rejecting endpoint.
const STABLE_CONNECTION: Duration = Duration::from_secs(7);
const QUICK_RETRY: Duration = Duration::from_secs(1);
const SLOW_RETRY: Duration = Duration::from_secs(5);

/// Delay before the next connection attempt, from how long the previous
/// attempt survived.
pub fn reconnect_delay(connected_for: Duration) -> Duration {
    if connected_for >= STABLE_CONNECTION {
        QUICK_RETRY
    } else {
        SLOW_RETRY
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9310`
    pub url: String,
    /// Bearer credential for the upgrade handshake
    pub api_key: String,
    /// Canvas announced on every (re)connect
    pub canvas_id: u8,
    /// Chat identity
    pub name: String,
    pub user_id: u32,
    pub country: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9310".to_string(),
            api_key: String::new(),
            canvas_id: 0,
            name: "anonymous".to_string(),
            user_id: 0,
            country: "xx".to_string(),
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Transport is open and the view state was re-announced
    Open,
    /// Transport closed; the agent will reconnect by itself
    Closed,
    /// Pixels changed in a watched chunk
    PixelUpdate { i: u8, j: u8, cells: Vec<PixelCell> },
    OnlineCounter(OnlineCounter),
    CoolDown { wait_ms: u32 },
    /// Server pushed an identity reload; the transport is already being
    /// torn down and reopened without backoff
    IdentityChanged,
    Refresh,
    FishAppears { fish_type: u8, size_kg: u16 },
    FishCatched { fish_type: u8, size_kg: u16 },
    Chat(ChatMessage),
    Typing {
        name: String,
        channel_id: u32,
        is_typing: bool,
    },
    Announcement { text: String, by: String },
    ChannelAdded(ChannelEntry),
    ChannelRemoved { channel_id: u32 },
    /// Snapshot of all public channels, sent after `sub chat`
    ChannelList(Vec<ChannelEntry>),
    UserReload { user_id: u32 },
}

/// Agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request timed out")]
    Timeout,
    #[error("agent is shut down")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
}

enum AgentCommand {
    Subscribe(String),
    SetCanvas(u8),
    RegisterChunk(u16),
    RegisterChunks(Vec<u16>),
    DeregisterChunks(Vec<u16>),
    PlacePixels {
        i: u8,
        j: u8,
        cells: Vec<PixelCell>,
        reply: oneshot::Sender<Result<PixelReturn, AgentError>>,
    },
    SubmitCaptcha {
        solution: String,
        captcha_id: String,
        reply: oneshot::Sender<Result<u8, AgentError>>,
    },
    SendChat {
        message: String,
        channel_id: u32,
    },
    Shutdown,
}

/// Resolver for one outstanding request, matched by kind only.
enum PendingReply {
    Pixel(oneshot::Sender<Result<PixelReturn, AgentError>>),
    Captcha(oneshot::Sender<Result<u8, AgentError>>),
}

impl PendingReply {
    fn reject(self, error: AgentError) {
        match self {
            Self::Pixel(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Captcha(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingRequest {
    reply: PendingReply,
    queued_at: Instant,
}

/// Handle to a running sync agent.
///
/// Cheap to clone; the background task lives until [`SyncAgent::shutdown`]
/// or until every handle and the event receiver are gone.
#[derive(Clone)]
pub struct SyncAgent {
    cmd_tx: mpsc::UnboundedSender<AgentCommand>,
    state: Arc<Mutex<ConnectionState>>,
}

impl SyncAgent {
    /// Spawn the agent and its reconnect loop.
    pub fn spawn(config: AgentConfig) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let task = AgentTask {
            canvas_id: config.canvas_id,
            config,
            cmd_rx,
            events: event_tx,
            state: state.clone(),
            subs: BTreeSet::new(),
            chunks: BTreeSet::new(),
            msg_queue: VecDeque::new(),
            req_queue: VecDeque::new(),
            last_inbound: Instant::now(),
            last_sent: Instant::now(),
        };
        tokio::spawn(task.run());
        (Self { cmd_tx, state }, event_rx)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Subscribe to a server-side event stream (`chat`, `pxl`, `online`,
    /// `reloadUser`); re-announced on every reconnect.
    pub fn subscribe(&self, channel: impl Into<String>) {
        let _ = self.cmd_tx.send(AgentCommand::Subscribe(channel.into()));
    }

    /// Announce a canvas switch; also re-announced on every reconnect.
    pub fn set_canvas(&self, canvas_id: u8) {
        let _ = self.cmd_tx.send(AgentCommand::SetCanvas(canvas_id));
    }

    pub fn register_chunk(&self, chunk_id: u16) {
        let _ = self.cmd_tx.send(AgentCommand::RegisterChunk(chunk_id));
    }

    pub fn register_chunks(&self, chunk_ids: Vec<u16>) {
        let _ = self.cmd_tx.send(AgentCommand::RegisterChunks(chunk_ids));
    }

    pub fn deregister_chunks(&self, chunk_ids: Vec<u16>) {
        let _ = self.cmd_tx.send(AgentCommand::DeregisterChunks(chunk_ids));
    }

    pub fn send_chat_message(&self, message: impl Into<String>, channel_id: u32) {
        let _ = self.cmd_tx.send(AgentCommand::SendChat {
            message: message.into(),
            channel_id,
        });
    }

    /// Submit pixels for placement and wait for the verdict.
    ///
    /// Queued for delivery after reconnect if currently offline. The
    /// response is matched FIFO-by-kind, not by correlation id.
    pub async fn place_pixels(
        &self,
        i: u8,
        j: u8,
        cells: Vec<PixelCell>,
    ) -> Result<PixelReturn, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(AgentCommand::PlacePixels { i, j, cells, reply })
            .map_err(|_| AgentError::Closed)?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    /// Submit a captcha solution and wait for the return code.
    pub async fn submit_captcha(
        &self,
        solution: impl Into<String>,
        captcha_id: impl Into<String>,
    ) -> Result<u8, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(AgentCommand::SubmitCaptcha {
                solution: solution.into(),
                captcha_id: captcha_id.into(),
                reply,
            })
            .map_err(|_| AgentError::Closed)?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Shutdown);
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

enum SessionEnd {
    Lost,
    Reconnect,
    Shutdown,
}

enum Flow {
    Continue,
    Lost,
    Reconnect,
}

struct AgentTask {
    config: AgentConfig,
    cmd_rx: mpsc::UnboundedReceiver<AgentCommand>,
    events: mpsc::Sender<AgentEvent>,
    state: Arc<Mutex<ConnectionState>>,
    canvas_id: u8,
    /// Active `sub` channels; re-announced on every reconnect
    subs: BTreeSet<String>,
    /// Chunks the local view needs; re-announced on every reconnect
    chunks: BTreeSet<u16>,
    /// Outbound messages queued while offline, flushed in order on open
    msg_queue: VecDeque<Message>,
    /// Outstanding captcha/pixel submissions, oldest first
    req_queue: VecDeque<PendingRequest>,
    last_inbound: Instant,
    last_sent: Instant,
}

impl AgentTask {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt_started = Instant::now();
            let outcome = match self.connect().await {
                Ok(ws) => {
                    let end = self.session(ws).await;
                    self.set_state(ConnectionState::Closed);
                    self.emit(AgentEvent::Closed).await;
                    end
                }
                Err(e) => {
                    log::warn!("connect to {} failed: {e}", self.config.url);
                    self.set_state(ConnectionState::Closed);
                    SessionEnd::Lost
                }
            };
            match outcome {
                SessionEnd::Shutdown => break,
                // identity reload bypasses the backoff schedule
                SessionEnd::Reconnect => continue,
                SessionEnd::Lost => {
                    let delay = reconnect_delay(attempt_started.elapsed());
                    log::warn!("socket closed, reconnecting in {}s", delay.as_secs());
                    if !self.wait_for_reconnect(delay).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Closed);
        // nothing outstanding survives shutdown
        while let Some(pending) = self.req_queue.pop_front() {
            pending.reply.reject(AgentError::Closed);
        }
    }

    async fn connect(&self) -> Result<WsStream, AgentError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        let bearer = format!("Bearer {}", self.config.api_key);
        let value =
            HeaderValue::from_str(&bearer).map_err(|e| AgentError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        Ok(ws)
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let now = Instant::now();
        self.last_inbound = now;
        self.last_sent = now;

        // re-announce the view state, then flush what piled up offline
        let reg = Packet::RegCanvas {
            canvas_id: self.canvas_id,
        };
        if self.send(&mut ws_tx, Message::Binary(reg.encode().into())).await.is_err() {
            return SessionEnd::Lost;
        }
        if !self.chunks.is_empty() {
            let reg = Packet::RegMChunks {
                chunk_ids: self.chunks.iter().copied().collect(),
            };
            log::info!("re-registering {} chunks", self.chunks.len());
            if self.send(&mut ws_tx, Message::Binary(reg.encode().into())).await.is_err() {
                return SessionEnd::Lost;
            }
        }
        for channel in self.subs.clone() {
            let text = ServerCommand::Sub(channel).encode();
            if self.send(&mut ws_tx, Message::Text(text.into())).await.is_err() {
                return SessionEnd::Lost;
            }
        }
        while let Some(queued) = self.msg_queue.pop_front() {
            if self.send(&mut ws_tx, queued).await.is_err() {
                return SessionEnd::Lost;
            }
        }

        self.set_state(ConnectionState::Open);
        self.emit(AgentEvent::Open).await;

        let mut health = tokio::time::interval(HEALTH_TICK);
        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(message)) => {
                        self.last_inbound = Instant::now();
                        match self.handle_inbound(message).await {
                            Flow::Continue => {}
                            Flow::Lost => return SessionEnd::Lost,
                            Flow::Reconnect => return SessionEnd::Reconnect,
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("websocket error: {e}");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                command = self.cmd_rx.recv() => match command {
                    Some(AgentCommand::Shutdown) | None => {
                        self.set_state(ConnectionState::Closing);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(command) => {
                        if self.handle_command(&mut ws_tx, command).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                },
                _ = health.tick() => {
                    let now = Instant::now();
                    if now.duration_since(self.last_inbound) > INBOUND_SILENCE_LIMIT {
                        log::warn!("server is silent, killing the websocket");
                        self.set_state(ConnectionState::Closing);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return SessionEnd::Lost;
                    }
                    if now.duration_since(self.last_sent) > OUTBOUND_IDLE_LIMIT {
                        let ping = Message::Binary(Packet::Ping.encode().into());
                        if self.send(&mut ws_tx, ping).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    self.expire_requests();
                }
            }
        }
    }

    /// Wait out the reconnect delay, still accepting commands (they are
    /// applied to local state or queued). Returns false on shutdown.
    async fn wait_for_reconnect(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut health = tokio::time::interval(HEALTH_TICK);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.cmd_rx.recv() => match command {
                    Some(AgentCommand::Shutdown) | None => return false,
                    Some(command) => self.handle_command_offline(command),
                },
                _ = health.tick() => self.expire_requests(),
            }
        }
    }

    async fn send(&mut self, ws_tx: &mut WsSink, message: Message) -> Result<(), ()> {
        match ws_tx.send(message).await {
            Ok(()) => {
                self.last_sent = Instant::now();
                Ok(())
            }
            Err(e) => {
                log::warn!("websocket send failed: {e}");
                Err(())
            }
        }
    }

    async fn handle_command(
        &mut self,
        ws_tx: &mut WsSink,
        command: AgentCommand,
    ) -> Result<(), ()> {
        match command {
            AgentCommand::Subscribe(channel) => {
                self.subs.insert(channel.clone());
                let text = ServerCommand::Sub(channel).encode();
                self.send(ws_tx, Message::Text(text.into())).await
            }
            AgentCommand::SetCanvas(canvas_id) => {
                self.canvas_id = canvas_id;
                log::info!("notifying server of canvas switch to {canvas_id}");
                let packet = Packet::RegCanvas { canvas_id };
                self.send(ws_tx, Message::Binary(packet.encode().into())).await
            }
            AgentCommand::RegisterChunk(chunk_id) => {
                self.chunks.insert(chunk_id);
                let packet = Packet::RegChunk { chunk_id };
                self.send(ws_tx, Message::Binary(packet.encode().into())).await
            }
            AgentCommand::RegisterChunks(chunk_ids) => {
                self.chunks.extend(chunk_ids.iter().copied());
                let packet = Packet::RegMChunks { chunk_ids };
                self.send(ws_tx, Message::Binary(packet.encode().into())).await
            }
            AgentCommand::DeregisterChunks(chunk_ids) => {
                for chunk_id in &chunk_ids {
                    self.chunks.remove(chunk_id);
                }
                let packet = Packet::DeRegMChunks { chunk_ids };
                self.send(ws_tx, Message::Binary(packet.encode().into())).await
            }
            AgentCommand::PlacePixels { i, j, cells, reply } => {
                self.req_queue.push_back(PendingRequest {
                    reply: PendingReply::Pixel(reply),
                    queued_at: Instant::now(),
                });
                let packet = Packet::PixelUpdate { i, j, cells };
                self.send(ws_tx, Message::Binary(packet.encode().into())).await
            }
            AgentCommand::SubmitCaptcha {
                solution,
                captcha_id,
                reply,
            } => {
                self.req_queue.push_back(PendingRequest {
                    reply: PendingReply::Captcha(reply),
                    queued_at: Instant::now(),
                });
                let text = encode_captcha_solution(&solution, &captcha_id);
                self.send(ws_tx, Message::Text(text.into())).await
            }
            AgentCommand::SendChat {
                message,
                channel_id,
            } => {
                let text = self.chat_command(message, channel_id);
                self.send(ws_tx, Message::Text(text.into())).await
            }
            AgentCommand::Shutdown => Ok(()),
        }
    }

    /// Offline variant: registrations only touch local state (they are
    /// re-announced on open), submissions and chat are queued.
    fn handle_command_offline(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Subscribe(channel) => {
                self.subs.insert(channel);
            }
            AgentCommand::SetCanvas(canvas_id) => self.canvas_id = canvas_id,
            AgentCommand::RegisterChunk(chunk_id) => {
                self.chunks.insert(chunk_id);
            }
            AgentCommand::RegisterChunks(chunk_ids) => self.chunks.extend(chunk_ids),
            AgentCommand::DeregisterChunks(chunk_ids) => {
                for chunk_id in &chunk_ids {
                    self.chunks.remove(chunk_id);
                }
            }
            AgentCommand::PlacePixels { i, j, cells, reply } => {
                self.req_queue.push_back(PendingRequest {
                    reply: PendingReply::Pixel(reply),
                    queued_at: Instant::now(),
                });
                let packet = Packet::PixelUpdate { i, j, cells };
                self.msg_queue.push_back(Message::Binary(packet.encode().into()));
            }
            AgentCommand::SubmitCaptcha {
                solution,
                captcha_id,
                reply,
            } => {
                self.req_queue.push_back(PendingRequest {
                    reply: PendingReply::Captcha(reply),
                    queued_at: Instant::now(),
                });
                let text = encode_captcha_solution(&solution, &captcha_id);
                self.msg_queue.push_back(Message::Text(text.into()));
            }
            AgentCommand::SendChat {
                message,
                channel_id,
            } => {
                let text = self.chat_command(message, channel_id);
                self.msg_queue.push_back(Message::Text(text.into()));
            }
            AgentCommand::Shutdown => {}
        }
    }

    fn chat_command(&self, message: String, channel_id: u32) -> String {
        ServerCommand::Chat(ChatMessage {
            name: self.config.name.clone(),
            user_id: self.config.user_id,
            message,
            country: self.config.country.clone(),
            channel_id,
        })
        .encode()
    }

    async fn handle_inbound(&mut self, message: Message) -> Flow {
        match message {
            Message::Binary(data) => self.handle_packet(&data).await,
            Message::Text(text) => {
                match TextMessage::parse(text.as_str()) {
                    Ok(parsed) => self.emit(text_event(parsed)).await,
                    Err(e) => log::warn!("error parsing websocket message: {e}"),
                }
                Flow::Continue
            }
            Message::Close(_) => Flow::Lost,
            // protocol pings are answered by the websocket layer
            _ => Flow::Continue,
        }
    }

    async fn handle_packet(&mut self, data: &[u8]) -> Flow {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("error parsing websocket frame: {e}");
                return Flow::Continue;
            }
        };
        match packet {
            Packet::PixelUpdate { i, j, cells } => {
                self.emit(AgentEvent::PixelUpdate { i, j, cells }).await;
            }
            Packet::PixelReturn(verdict) => self.resolve_pixel(verdict),
            Packet::OnlineCounter(counter) => {
                self.emit(AgentEvent::OnlineCounter(counter)).await;
            }
            Packet::CoolDown { wait_ms } => {
                self.emit(AgentEvent::CoolDown { wait_ms }).await;
            }
            Packet::ChangeMe => {
                log::info!("server requested an identity reload, restarting websocket");
                self.emit(AgentEvent::IdentityChanged).await;
                return Flow::Reconnect;
            }
            Packet::CaptchaReturn { ret_code } => self.resolve_captcha(ret_code),
            Packet::Refresh => self.emit(AgentEvent::Refresh).await,
            Packet::FishAppears { fish_type, size_kg } => {
                self.emit(AgentEvent::FishAppears { fish_type, size_kg }).await;
            }
            Packet::FishCatched { fish_type, size_kg } => {
                self.emit(AgentEvent::FishCatched { fish_type, size_kg }).await;
            }
            other => {
                log::warn!("unexpected {:?} frame from server", other.opcode());
            }
        }
        Flow::Continue
    }

    /// Resolve the oldest outstanding pixel submission.
    fn resolve_pixel(&mut self, verdict: PixelReturn) {
        let position = self
            .req_queue
            .iter()
            .position(|p| matches!(p.reply, PendingReply::Pixel(_)));
        match position.and_then(|pos| self.req_queue.remove(pos)) {
            Some(PendingRequest {
                reply: PendingReply::Pixel(tx),
                ..
            }) => {
                let _ = tx.send(Ok(verdict));
            }
            _ => log::debug!("pixel verdict with no outstanding request"),
        }
    }

    /// Resolve the oldest outstanding captcha submission.
    fn resolve_captcha(&mut self, ret_code: u8) {
        let position = self
            .req_queue
            .iter()
            .position(|p| matches!(p.reply, PendingReply::Captcha(_)));
        match position.and_then(|pos| self.req_queue.remove(pos)) {
            Some(PendingRequest {
                reply: PendingReply::Captcha(tx),
                ..
            }) => {
                let _ = tx.send(Ok(ret_code));
            }
            _ => log::debug!("captcha verdict with no outstanding request"),
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.req_queue.len() {
            if now.duration_since(self.req_queue[index].queued_at) >= REQUEST_EXPIRY {
                if let Some(expired) = self.req_queue.remove(index) {
                    expired.reply.reject(AgentError::Timeout);
                }
            } else {
                index += 1;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    async fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event).await;
    }
}

fn text_event(message: TextMessage) -> AgentEvent {
    match message {
        TextMessage::Chat(chat) => AgentEvent::Chat(chat),
        TextMessage::Typing {
            name,
            channel_id,
            is_typing,
            ..
        } => AgentEvent::Typing {
            name,
            channel_id,
            is_typing,
        },
        TextMessage::Announcement { text, by, .. } => AgentEvent::Announcement { text, by },
        TextMessage::ChannelAdded(entry) => AgentEvent::ChannelAdded(entry),
        TextMessage::ChannelRemoved { channel_id } => AgentEvent::ChannelRemoved { channel_id },
        TextMessage::ChannelList(entries) => AgentEvent::ChannelList(entries),
        TextMessage::UserReload { user_id } => AgentEvent::UserReload { user_id },
        TextMessage::PixelVerdict { wait_ms, .. } => AgentEvent::CoolDown { wait_ms },
    }
}
