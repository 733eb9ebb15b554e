//! WebSocket collaboration service with per-page session routing.
//!
//! ```text
//! Session A ──┐
//!             ├── PageRoom (page id) ── CanvasDocument ── BroadcastGroup
//! Session B ──┘         │
//!                       ├── hydrate on first open
//!                       └── debounced flush ──► ComponentStore (RocksDB)
//! ```
//!
//! Any number of sessions may connect per page. Every delta from any
//! session is merged into the authoritative document first, then fanned
//! out to the page's other sessions, then a debounced flush is scheduled.
//! Malformed messages and unknown components are logged and ignored; no
//! failure here is fatal to the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, SessionInfo, SyncMessage};
use crate::rooms::{PageRoom, RoomRegistry};
use crate::storage::{ComponentStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Delay between a merged change and the flush it schedules
    pub flush_debounce: Duration,
    /// How long an empty room stays resident to serve fast reconnects
    pub idle_grace: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            flush_debounce: Duration::from_millis(500),
            idle_grace: Duration::from_secs(30),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The collaboration service.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new server with the given configuration.
    ///
    /// A storage path that fails to open is logged and the server runs
    /// without persistence rather than refusing to start.
    pub fn new(config: ServerConfig) -> Self {
        let store = config.storage_path.as_ref().and_then(|path| {
            let store_config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            match ComponentStore::open(store_config) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::error!(
                        "Failed to open component store at {}: {e}; running without persistence",
                        path.display()
                    );
                    None
                }
            }
        });

        let registry = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            store,
            config.flush_debounce,
            config.idle_grace,
        ));

        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut session_id: Option<Uuid> = None;
        let mut page_id: Option<Uuid> = None;
        let mut room: Option<Arc<PageRoom>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    // First message: session joins a page.
                                    // `open` hydrates on first use; sessions
                                    // for other pages are unaffected.
                                    let info = sync_msg.session_info().unwrap_or_else(|_| {
                                        SessionInfo::with_id(sync_msg.session_id, "Anonymous")
                                    });
                                    let opened = registry.open(sync_msg.page_id).await;

                                    let rx = opened.broadcast.add_session(info.clone()).await;
                                    broadcast_rx = Some(rx);
                                    session_id = Some(sync_msg.session_id);
                                    page_id = Some(sync_msg.page_id);
                                    room = Some(opened);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = registry.room_count().await;
                                    }

                                    log::info!(
                                        "Session {} ({}) joined page {}",
                                        info.client_name,
                                        info.session_id,
                                        sync_msg.page_id
                                    );
                                }

                                MessageType::SyncStep1 => {
                                    // Initial full-state transfer: reply with
                                    // the diff the session is missing, plus
                                    // our own state vector so the session
                                    // sends back what we are missing.
                                    if let (Some(room), Some(pid)) = (&room, page_id) {
                                        match room.diff(&sync_msg.payload).await {
                                            Ok(diff) => {
                                                let response = SyncMessage::sync_step2(
                                                    Uuid::nil(),
                                                    pid,
                                                    diff,
                                                );
                                                ws_sender
                                                    .send(Message::Binary(response.encode()?.into()))
                                                    .await?;

                                                let server_sv = room.encoded_state_vector().await;
                                                let request = SyncMessage::sync_step1(
                                                    Uuid::nil(),
                                                    pid,
                                                    server_sv,
                                                );
                                                ws_sender
                                                    .send(Message::Binary(request.encode()?.into()))
                                                    .await?;
                                            }
                                            Err(e) => {
                                                log::warn!(
                                                    "Bad state vector from {addr}: {e}"
                                                );
                                            }
                                        }
                                    }
                                }

                                MessageType::Delta => {
                                    // Merge into the authoritative document,
                                    // then fan out, then schedule a flush.
                                    if let Some(room) = &room {
                                        match room.apply_delta(&sync_msg.payload).await {
                                            Ok(()) => {
                                                room.broadcast
                                                    .broadcast_raw(Arc::new(bytes.clone()));
                                                registry.schedule_flush(room);
                                            }
                                            Err(e) => {
                                                log::warn!(
                                                    "Ignoring malformed delta from {addr}: {e}"
                                                );
                                            }
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    if let Some(sid) = session_id {
                                        let pong = SyncMessage::pong(sid);
                                        ws_sender
                                            .send(Message::Binary(pong.encode()?.into()))
                                            .await?;
                                    }
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // No broadcast receiver yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo back to sender
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if Some(sync_msg.session_id) == session_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session {session_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: unsubscribe this session only; merged mutations stand.
        if let (Some(sid), Some(pid), Some(room)) = (session_id, page_id, &room) {
            room.broadcast.remove_session(&sid).await;
            registry.session_closed(pid).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = registry.room_count().await;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the persistent store (if configured and healthy).
    pub fn store(&self) -> Option<&Arc<ComponentStore>> {
        self.registry.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.flush_debounce, Duration::from_millis(500));
        assert_eq!(config.idle_grace, Duration::from_secs(30));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
            flush_debounce: Duration::from_millis(100),
            idle_grace: Duration::from_secs(5),
            storage_path: None,
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}
