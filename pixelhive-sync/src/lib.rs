//! # pixelhive-sync — real-time synchronization core for a shared canvas
//!
//! Thousands of viewers watch the same canvas; every pixel write has to
//! reach them with minimal latency, survive network churn, and keep the
//! HTTP tile cache honest.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌──────────────┐
//! │ SyncAgent   │ ◄─────────────────► │ SyncServer   │
//! │ (per viewer)│   binary + tagged   │ (fan-out)    │
//! └──────┬──────┘        text         └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! reconnect loop,                      ┌───────────┐     ┌──────────────┐
//! FIFO request queues                  │ EventBus  │ ──► │ ChunkCache   │
//!                                      │ pub/sub + │     │ Gateway      │
//! pixel authority ───────────────────► │ RPC       │     │ (HTTP, ETag) │
//! moderation / jobs ─────────────────► └───────────┘     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — opcodes, fixed binary layouts, tagged text codec
//! - [`bus`] — local pub/sub plus cross-shard request/response
//! - [`server`] — per-connection subscriptions, heartbeat, broadcast
//! - [`gateway`] — chunk-snapshot HTTP cache keyed to the bus
//! - [`client`] — reconnecting client mirroring the protocol
//!
//! Persistence, sessions and moderation logic live elsewhere; this crate
//! consumes them through the collaborator traits on [`server`] and
//! [`gateway`].

pub mod bus;
pub mod client;
pub mod gateway;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use bus::{BusError, BusEvent, BusRequest, BusResponse, EventBus, RequestKind, ShardRole,
              REQUEST_TIMEOUT};
pub use client::{AgentConfig, AgentError, AgentEvent, ConnectionState, SyncAgent};
pub use gateway::{ChunkCacheGateway, ChunkStore, ChunkStoreError};
pub use protocol::{pack_chunk_id, unpack_chunk_id, ChannelEntry, ChatMessage, Opcode,
                   OnlineCounter, Packet, PixelCell, PixelReturn, ProtocolError, ServerCommand,
                   TextMessage};
pub use server::{CaptchaVerifier, ChannelRegistry, Collaborators, CooldownAuthority,
                 PixelAuthority, PixelPlacement, ServerConfig, ServerStats, Subscriptions,
                 SyncServer};
