//! WebSocket transport for one page session.
//!
//! [`SyncClient`] keeps a session's local replica synchronized with the
//! collaboration service: it owns the connection lifecycle (connect,
//! handshake, auto-reconnect with exponential backoff) and the delta
//! traffic in both directions. The mutation API on top of it lives in
//! [`crate::session`].
//!
//! Reconnection never loses committed local mutations: every (re)connect
//! runs the state-vector handshake, which carries over exactly the updates
//! each side is missing — edits made while disconnected included.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use inkpad_core::CanvasDocument;

use crate::protocol::{MessageType, SessionInfo, SyncMessage};

/// Client connection state.
///
/// `Connected` means the initial full-state transfer has been received and
/// applied, not merely that a socket is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name carried in the join handshake (logs only)
    pub client_name: String,
    /// First reconnect delay after a lost connection
    pub reconnect_initial: Duration,
    /// Backoff ceiling for reconnect delays
    pub reconnect_max: Duration,
    /// Interval between heartbeat pings on an idle connection
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "Anonymous".to_string(),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// WebSocket sync client for one page.
///
/// Applies remote deltas straight into the shared local replica and ships
/// local updates to the service. All failure modes degrade to "resync on
/// reconnect"; nothing here returns a fatal error to the caller.
pub struct SyncClient {
    info: SessionInfo,
    page_id: Uuid,
    doc: Arc<CanvasDocument>,
    server_url: String,
    config: ClientConfig,
    /// Per-connection outgoing frame channel; `None` while disconnected.
    outgoing: Arc<RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    /// Synced-state observable. True only after SyncStep2 has been applied.
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    clock: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl SyncClient {
    pub fn new(
        server_url: impl Into<String>,
        page_id: Uuid,
        doc: Arc<CanvasDocument>,
        config: ClientConfig,
    ) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            info: SessionInfo::new(config.client_name.clone()),
            page_id,
            doc,
            server_url: server_url.into(),
            config,
            outgoing: Arc::new(RwLock::new(None)),
            connected_tx,
            connected_rx,
            clock: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the connection supervisor.
    ///
    /// The supervisor connects, runs the handshake, pumps traffic until the
    /// link drops, then backs off and reconnects, forever — until
    /// [`Self::shutdown`] is called. Returns the task handle.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut backoff = client.config.reconnect_initial;
            loop {
                if client.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match client.run_connection().await {
                    Ok(()) => {
                        // clean session: reset the backoff window
                        backoff = client.config.reconnect_initial;
                    }
                    Err(e) => {
                        log::debug!("Connection attempt to {} failed: {e}", client.server_url);
                    }
                }
                client.mark_disconnected();
                if client.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::info!(
                    "Session {} reconnecting to page {} in {backoff:?}",
                    client.info.session_id,
                    client.page_id
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(client.config.reconnect_max);
            }
        })
    }

    /// One connection's lifetime: dial, handshake, pump until closed.
    async fn run_connection(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.outgoing.write().unwrap_or_else(|e| e.into_inner()) = Some(out_tx);

        // Writer task: forward the outgoing channel onto the socket.
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Handshake: announce the session, then ask for what we're missing.
        self.send_frame(&SyncMessage::join(self.page_id, &self.info));
        self.send_frame(&SyncMessage::sync_step1(
            self.info.session_id,
            self.page_id,
            self.doc.encoded_state_vector(),
        ));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            self.handle_frame(&bytes);
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite queues the pong itself
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_frame(&SyncMessage::ping(self.info.session_id));
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }

        writer.abort();
        Ok(())
    }

    /// Process one frame from the service.
    fn handle_frame(&self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        // Our own deltas come back through the room fan-out; skip them.
        if msg.session_id == self.info.session_id {
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep2 => {
                // The initial full-state transfer. Only now is the session
                // considered connected.
                match self.doc.apply_update(&msg.payload) {
                    Ok(()) => {
                        self.connected_tx.send_replace(true);
                        log::info!(
                            "Session {} synced with page {}",
                            self.info.session_id,
                            self.page_id
                        );
                    }
                    Err(e) => log::warn!("Failed to apply state transfer: {e}"),
                }
            }
            MessageType::SyncStep1 => {
                // The service wants what it is missing from us. This is how
                // edits made while disconnected reach the server.
                match self.doc.diff_encoded(&msg.payload) {
                    Ok(diff) => self.send_update(diff),
                    Err(e) => log::warn!("Bad server state vector: {e}"),
                }
            }
            MessageType::Delta => {
                if let Err(e) = self.doc.apply_update(&msg.payload) {
                    log::warn!("Dropping malformed remote delta: {e}");
                }
            }
            MessageType::Pong => {}
            other => {
                log::debug!("Unhandled message type from server: {other:?}");
            }
        }
    }

    /// Ship an encoded document update to the service.
    ///
    /// While disconnected this is a no-op: the update already lives in the
    /// local replica and the reconnect handshake will carry it over.
    pub fn send_update(&self, update: Vec<u8>) {
        if update.is_empty() {
            return;
        }
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = SyncMessage::delta(self.info.session_id, self.page_id, clock, update);
        self.send_frame(&msg);
    }

    fn send_frame(&self, msg: &SyncMessage) {
        let encoded = match msg.encode() {
            Ok(e) => e,
            Err(e) => {
                log::error!("Failed to encode frame: {e}");
                return;
            }
        };
        let outgoing = self.outgoing.read().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => {
                if tx.send(encoded).is_err() {
                    log::debug!("Writer gone; frame dropped until reconnect");
                }
            }
            None => {
                log::trace!("Disconnected; frame dropped until reconnect");
            }
        }
    }

    fn mark_disconnected(&self) {
        *self.outgoing.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.connected_tx.send_replace(false);
    }

    /// Stop the supervisor after the current connection closes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.mark_disconnected();
    }

    /// Observable synced state.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        if *self.connected_rx.borrow() {
            ConnectionState::Connected
        } else if self.outgoing.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}
