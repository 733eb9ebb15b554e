//! # inkpad-collab — Real-time collaboration for inkpad pages
//!
//! WebSocket-based multi-user editing of canvas pages, synchronized
//! through the replicated document model in `inkpad-core` and persisted
//! to row-oriented durable storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ PageSession  │ ◄─────────────────► │  SyncServer  │
//! │ (per client) │    binary proto     │  (central)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ CanvasDoc    │                     │   PageRoom   │
//! │ (replica)    │                     │ (authority)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │ hydrate / flush
//!                                             ▼
//!                                     ┌──────────────┐
//!                                     │ComponentStore│
//!                                     │  (RocksDB)   │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded [`SyncMessage`])
//! - [`broadcast`] — per-page fan-out with backpressure
//! - [`rooms`] — page room lifecycle: hydrate, merge, flush, evict
//! - [`server`] — the WebSocket collaboration service
//! - [`client`] — connection transport with auto-reconnect
//! - [`session`] — the per-page mutation API a canvas editor drives
//! - [`storage`] — durable component rows and the reconciliation bridge

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ConnectionState, SyncClient};
pub use protocol::{MessageType, ProtocolError, SessionInfo, SyncMessage};
pub use rooms::{PageRoom, RoomRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{PageSession, SessionConfig, SessionStats, SessionText};
pub use storage::{ComponentStore, FlushOutcome, PageMetadata, StoreConfig, StoreError};
