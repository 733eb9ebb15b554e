//! Per-page session adapter: the mutation API a canvas editor drives.
//!
//! A [`PageSession`] owns a local replica of one page's document and a
//! [`SyncClient`] keeping it synchronized with the collaboration service.
//! Every mutation applies to the local replica synchronously, so a
//! fast-moving UI never waits on the network; propagation happens in the
//! background.
//!
//! Position and size changes arrive in bursts (drag, resize) and are
//! throttled on the wire: at most one network delta per throttle window
//! while the burst lasts, plus one unconditional trailing delta so the
//! final value is always sent. Everything else propagates immediately.
//!
//! ```text
//! update_component ──► local replica ──► pending deltas
//!                                            │
//!                         geometry burst ────┤ leading + trailing send
//!                         anything else ─────┘ immediate send
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use inkpad_core::{
    CanvasDocument, ComponentKind, ComponentOptions, ComponentRecord, ComponentUpdate,
    DocumentError, Subscription, TextHandle,
};

use crate::client::{ClientConfig, ConnectionState, SyncClient};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client: ClientConfig,
    /// Minimum spacing between network deltas during a geometry burst
    pub throttle_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            throttle_window: Duration::from_millis(50),
        }
    }
}

/// Counters for a session's outbound traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Network deltas shipped (throttled bursts coalesce into fewer sends)
    pub updates_sent: u64,
}

struct ThrottleState {
    window_until: Option<Instant>,
    trailing_scheduled: bool,
}

/// State shared between the session, its text handles, and the trailing
/// flush task.
struct SessionShared {
    doc: Arc<CanvasDocument>,
    client: Arc<SyncClient>,
    /// Locally produced deltas not yet shipped.
    pending: Mutex<Vec<Vec<u8>>>,
    throttle: Mutex<ThrottleState>,
    throttle_window: Duration,
    updates_sent: AtomicU64,
}

impl SessionShared {
    /// Ship pending deltas now, or defer to the throttle window.
    fn propagate(self: &Arc<Self>, throttled: bool) {
        if !throttled {
            self.flush_pending();
            return;
        }

        let now = Instant::now();
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        match throttle.window_until {
            // Mid-window: hold the delta and make sure a trailing flush
            // fires at the window's end, carrying the last value.
            Some(until) if now < until => {
                if !throttle.trailing_scheduled {
                    throttle.trailing_scheduled = true;
                    let shared = self.clone();
                    let delay = until - now;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        {
                            let mut throttle =
                                shared.throttle.lock().unwrap_or_else(|e| e.into_inner());
                            throttle.trailing_scheduled = false;
                            throttle.window_until =
                                Some(Instant::now() + shared.throttle_window);
                        }
                        shared.flush_pending();
                    });
                }
            }
            // Window expired or never opened: send immediately and open
            // the next window.
            _ => {
                throttle.window_until = Some(now + self.throttle_window);
                drop(throttle);
                self.flush_pending();
            }
        }
    }

    /// Merge and ship everything pending. One network delta per call.
    fn flush_pending(&self) {
        let updates: Vec<Vec<u8>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if updates.is_empty() {
            return;
        }
        match CanvasDocument::merge_updates(&updates) {
            Ok(merged) => {
                self.client.send_update(merged);
                self.updates_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // ship unmerged rather than lose the burst
                log::warn!("Failed to merge pending deltas, sending raw: {e}");
                let count = updates.len() as u64;
                for update in updates {
                    self.client.send_update(update);
                }
                self.updates_sent.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}

/// Live handle to one component's embedded text sequence.
///
/// Edits apply to the local replica at character granularity and propagate
/// immediately, so two users typing in the same block merge cleanly.
pub struct SessionText {
    handle: TextHandle,
    shared: Arc<SessionShared>,
}

impl SessionText {
    pub fn insert(&self, index: u32, chunk: &str) {
        self.handle.insert(index, chunk);
        self.shared.propagate(false);
    }

    pub fn push(&self, chunk: &str) {
        self.handle.push(chunk);
        self.shared.propagate(false);
    }

    pub fn delete(&self, index: u32, len: u32) {
        self.handle.delete(index, len);
        self.shared.propagate(false);
    }

    pub fn content(&self) -> String {
        self.handle.content()
    }

    pub fn len(&self) -> u32 {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }
}

/// One client's live session on one page.
///
/// Mutation methods are synchronous and never fail: while disconnected
/// they keep applying to the local replica, and the reconnect handshake
/// carries the accumulated changes to the service.
pub struct PageSession {
    shared: Arc<SessionShared>,
    supervisor: tokio::task::JoinHandle<()>,
    _capture: Subscription,
}

impl PageSession {
    /// Open a session for `page_id` against the service at `server_url`.
    ///
    /// Returns immediately; await [`Self::connected`] turning true to know
    /// the initial document state has arrived. Must be called from within
    /// a tokio runtime.
    pub fn open(
        server_url: impl Into<String>,
        page_id: Uuid,
        config: SessionConfig,
    ) -> Result<Self, DocumentError> {
        let doc = Arc::new(CanvasDocument::new());
        let client = Arc::new(SyncClient::new(
            server_url,
            page_id,
            doc.clone(),
            config.client,
        ));

        let shared = Arc::new(SessionShared {
            doc: doc.clone(),
            client: client.clone(),
            pending: Mutex::new(Vec::new()),
            throttle: Mutex::new(ThrottleState {
                window_until: None,
                trailing_scheduled: false,
            }),
            throttle_window: config.throttle_window,
            updates_sent: AtomicU64::new(0),
        });

        // Capture every locally produced delta; remote applications are
        // filtered out by origin so nothing echoes back.
        let pending_sink = shared.clone();
        let capture = doc.observe_local_updates(move |update| {
            pending_sink
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(update.to_vec());
        })?;

        let supervisor = client.start();

        Ok(Self {
            shared,
            supervisor,
            _capture: capture,
        })
    }

    // ─── Mutation API ─────────────────────────────────────────────────

    /// Add a component and return its id.
    ///
    /// Without an explicit `z_index` the component lands one above the
    /// current maximum (0 on an empty page).
    pub fn add_component(
        &self,
        kind: ComponentKind,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        options: ComponentOptions,
    ) -> Uuid {
        let id = self
            .shared
            .doc
            .insert_component(kind, x, y, width, height, options);
        self.shared.propagate(false);
        id
    }

    /// Apply a partial update. Unknown ids are a silent no-op.
    ///
    /// Geometry-only updates (drag, resize) are throttled on the wire; the
    /// local replica always reflects the change immediately.
    pub fn update_component(&self, id: Uuid, update: ComponentUpdate) {
        if !self.shared.doc.update_component(id, &update) {
            return;
        }
        self.shared.propagate(update.geometry_only());
    }

    /// Delete a component. Idempotent.
    pub fn delete_component(&self, id: Uuid) {
        if self.shared.doc.remove_component(id) {
            self.shared.propagate(false);
        }
    }

    /// Handle to a component's text sequence, or `None` when the component
    /// is absent or carries no text.
    pub fn component_text(&self, id: Uuid) -> Option<SessionText> {
        self.shared.doc.text(id).map(|handle| SessionText {
            handle,
            shared: self.shared.clone(),
        })
    }

    /// Raise a component above everything else on the page.
    pub fn bring_to_front(&self, id: Uuid) {
        if !self.shared.doc.contains(id) {
            return;
        }
        let z = self.shared.doc.next_z_index();
        if self.shared.doc.update_component(id, &ComponentUpdate::z_index(z)) {
            self.shared.propagate(false);
        }
    }

    /// Drop a component behind everything else.
    ///
    /// The target gets `z_index` 0 and every other component is renumbered
    /// 1..N in its prior relative order, so the ordering stays well-formed.
    pub fn send_to_back(&self, id: Uuid) {
        if !self.shared.doc.contains(id) {
            return;
        }
        let order = self.shared.doc.snapshot();
        self.shared.doc.update_component(id, &ComponentUpdate::z_index(0));
        let mut next = 1;
        for record in &order {
            if record.id == id {
                continue;
            }
            self.shared
                .doc
                .update_component(record.id, &ComponentUpdate::z_index(next));
            next += 1;
        }
        self.shared.propagate(false);
    }

    // ─── Observation ──────────────────────────────────────────────────

    /// Snapshot of the local replica in rendering order.
    pub fn snapshot(&self) -> Vec<ComponentRecord> {
        self.shared.doc.snapshot()
    }

    pub fn get(&self, id: Uuid) -> Option<ComponentRecord> {
        self.shared.doc.get(id)
    }

    pub fn len(&self) -> usize {
        self.shared.doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.doc.is_empty()
    }

    /// The local replica, for registering document observers.
    pub fn document(&self) -> &Arc<CanvasDocument> {
        &self.shared.doc
    }

    /// Observable connected state.
    ///
    /// Turns true only once the initial full document state has been
    /// received and applied, never on bare socket open.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.client.connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.client.connection_state()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            updates_sent: self.shared.updates_sent.load(Ordering::Relaxed),
        }
    }

    /// Close the session. Merged mutations stand; nothing is rolled back.
    pub fn close(&self) {
        self.shared.client.shutdown();
        self.supervisor.abort();
    }
}

impl Drop for PageSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A session against a dead endpoint: everything must keep working
    /// locally.
    fn offline_session() -> PageSession {
        PageSession::open("ws://127.0.0.1:1", Uuid::new_v4(), SessionConfig::default())
            .unwrap()
    }

    fn offline_session_with_window(window: Duration) -> PageSession {
        PageSession::open(
            "ws://127.0.0.1:1",
            Uuid::new_v4(),
            SessionConfig {
                throttle_window: window,
                ..SessionConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_component_applies_locally_while_disconnected() {
        let session = offline_session();
        let id = session.add_component(
            ComponentKind::Image,
            10.0,
            20.0,
            300.0,
            200.0,
            ComponentOptions::default(),
        );

        assert!(!*session.connected().borrow());
        let record = session.get(id).unwrap();
        assert_eq!(record.x, 10.0);
        assert_eq!(record.z_index, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_silent() {
        let session = offline_session();
        session.update_component(Uuid::new_v4(), ComponentUpdate::position(1.0, 2.0));
        assert!(session.is_empty());
        assert_eq!(session.stats().updates_sent, 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let session = offline_session();
        let id = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        session.delete_component(id);
        session.delete_component(id);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_z_index_assignment_on_add() {
        let session = offline_session();
        let first = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        let second = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions {
                z_index: Some(9),
                ..ComponentOptions::default()
            },
        );
        let third = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );

        assert_eq!(session.get(first).unwrap().z_index, 0);
        assert_eq!(session.get(second).unwrap().z_index, 9);
        assert_eq!(session.get(third).unwrap().z_index, 10);
    }

    #[tokio::test]
    async fn test_bring_to_front() {
        let session = offline_session();
        let a = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        let b = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );

        session.bring_to_front(a);
        assert!(session.get(a).unwrap().z_index > session.get(b).unwrap().z_index);
    }

    #[tokio::test]
    async fn test_send_to_back_renumbers_preserving_order() {
        let session = offline_session();
        let opts = |z| ComponentOptions {
            z_index: Some(z),
            ..ComponentOptions::default()
        };
        let a = session.add_component(ComponentKind::Image, 0.0, 0.0, 100.0, 100.0, opts(2));
        let b = session.add_component(ComponentKind::Image, 0.0, 0.0, 100.0, 100.0, opts(5));
        let c = session.add_component(ComponentKind::Image, 0.0, 0.0, 100.0, 100.0, opts(8));

        session.send_to_back(c);

        assert_eq!(session.get(c).unwrap().z_index, 0);
        assert_eq!(session.get(a).unwrap().z_index, 1);
        assert_eq!(session.get(b).unwrap().z_index, 2);

        // prior relative order of a and b survives
        let order: Vec<Uuid> = session.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![c, a, b]);
    }

    #[tokio::test]
    async fn test_send_to_back_unknown_id_is_noop() {
        let session = offline_session();
        session.send_to_back(Uuid::new_v4());
        session.bring_to_front(Uuid::new_v4());
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_text_handle_edits_locally() {
        let session = offline_session();
        let id = session.add_component(
            ComponentKind::Text,
            0.0,
            0.0,
            200.0,
            100.0,
            ComponentOptions {
                text: Some("hello".to_string()),
                ..ComponentOptions::default()
            },
        );

        let text = session.component_text(id).unwrap();
        text.push(" world");
        text.insert(0, ">> ");
        assert_eq!(text.content(), ">> hello world");
        text.delete(0, 3);
        assert_eq!(text.content(), "hello world");
    }

    #[tokio::test]
    async fn test_text_handle_absent_for_image() {
        let session = offline_session();
        let id = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        assert!(session.component_text(id).is_none());
        assert!(session.component_text(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_geometry_burst_is_throttled() {
        let session = offline_session_with_window(Duration::from_millis(40));
        let id = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        let baseline = session.stats().updates_sent;

        // a simulated drag: many updates inside one throttle window
        for i in 1..=20 {
            session.update_component(id, ComponentUpdate::position(i as f64, 0.0));
        }

        // leading send only so far
        assert_eq!(session.stats().updates_sent, baseline + 1);
        // the local replica never lags
        assert_eq!(session.get(id).unwrap().x, 20.0);

        // the trailing flush carries the final value
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(session.stats().updates_sent, baseline + 2);
        assert!(session
            .shared
            .pending
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_non_geometry_updates_send_immediately() {
        let session = offline_session_with_window(Duration::from_secs(60));
        let id = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        let baseline = session.stats().updates_sent;

        session.update_component(id, ComponentUpdate::z_index(3));
        session.update_component(id, ComponentUpdate::z_index(4));
        assert_eq!(session.stats().updates_sent, baseline + 2);
    }

    #[tokio::test]
    async fn test_mixed_update_bypasses_throttle() {
        let session = offline_session_with_window(Duration::from_secs(60));
        let id = session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        let baseline = session.stats().updates_sent;

        // open the throttle window with a drag step
        session.update_component(id, ComponentUpdate::position(1.0, 1.0));
        // a mixed update must not wait for the window
        session.update_component(
            id,
            ComponentUpdate {
                x: Some(2.0),
                z_index: Some(7),
                ..ComponentUpdate::default()
            },
        );

        assert_eq!(session.stats().updates_sent, baseline + 2);
        assert_eq!(session.get(id).unwrap().x, 2.0);
        assert_eq!(session.get(id).unwrap().z_index, 7);
    }

    #[tokio::test]
    async fn test_session_close_is_clean() {
        let session = offline_session();
        session.add_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        session.close();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }
}
