//! Per-page rooms and their lifecycle.
//!
//! A [`PageRoom`] is the service-side unit for one page: the authoritative
//! document, the broadcast group fanning merged deltas out to the page's
//! sessions, and the flush state. The [`RoomRegistry`] owns the page id →
//! room map with an explicit lifecycle: create-on-first-open (hydrating
//! from durable rows exactly once), evict-after-idle-grace-period
//! (following a final flush).
//!
//! ```text
//! open(page)                     last session gone
//!     │                                 │
//!     ▼                                 ▼
//! Hydrating ──► Active ◄─reconnect── Idle ──grace elapsed──► dropped
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use uuid::Uuid;

use inkpad_core::{CanvasDocument, ComponentRecord, DocumentError};

use crate::broadcast::BroadcastGroup;
use crate::storage::{self, ComponentStore, FlushOutcome, StoreError};

/// One page's authoritative state on the service.
pub struct PageRoom {
    page_id: Uuid,
    /// Authoritative replicated document. Only touched while holding
    /// `doc_lock`, so two merges can never interleave on a field.
    doc: CanvasDocument,
    doc_lock: Mutex<()>,
    /// Fan-out to this page's sessions.
    pub broadcast: BroadcastGroup,
    /// Hydration runs exactly once; later sessions await the same result.
    hydrated: OnceCell<bool>,
    /// A flush is already scheduled and not yet started.
    flush_scheduled: AtomicBool,
    /// No two flushes for the same page run concurrently.
    flush_lock: Mutex<()>,
}

impl PageRoom {
    pub fn new(page_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            page_id,
            doc: CanvasDocument::new(),
            doc_lock: Mutex::new(()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            hydrated: OnceCell::new(),
            flush_scheduled: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    /// Hydrate the document from durable rows, once.
    ///
    /// A store failure never refuses the session: the room proceeds with an
    /// empty document and the fault is surfaced in logs only. Returns
    /// whether hydration (or an intentional empty start) succeeded.
    pub async fn hydrate(&self, store: Option<&Arc<ComponentStore>>) -> bool {
        *self
            .hydrated
            .get_or_init(|| async {
                let store = match store {
                    Some(s) => s,
                    None => return true,
                };
                match store.load_components(self.page_id) {
                    Ok(rows) => {
                        let _guard = self.doc_lock.lock().await;
                        storage::hydrate(&self.doc, &rows);
                        log::info!(
                            "Hydrated page {} with {} components",
                            self.page_id,
                            rows.len()
                        );
                        true
                    }
                    Err(e) => {
                        log::error!(
                            "Hydration failed for page {}, starting empty: {e}",
                            self.page_id
                        );
                        false
                    }
                }
            })
            .await
    }

    /// Merge a client delta into the authoritative document.
    pub async fn apply_delta(&self, update: &[u8]) -> Result<(), DocumentError> {
        let _guard = self.doc_lock.lock().await;
        self.doc.apply_update(update)
    }

    /// Diff against a session's state vector (off the wire).
    pub async fn diff(&self, sv_bytes: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let _guard = self.doc_lock.lock().await;
        self.doc.diff_encoded(sv_bytes)
    }

    pub async fn encoded_state_vector(&self) -> Vec<u8> {
        let _guard = self.doc_lock.lock().await;
        self.doc.encoded_state_vector()
    }

    pub async fn snapshot(&self) -> Vec<ComponentRecord> {
        let _guard = self.doc_lock.lock().await;
        self.doc.snapshot()
    }

    /// Schedule a debounced flush. Coalesces with an already pending one.
    pub fn schedule_flush(self: &Arc<Self>, store: Arc<ComponentStore>, debounce: Duration) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let room = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            room.flush_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = room.flush(&store).await {
                // retried by the next change that schedules a flush
                log::warn!("Flush failed for page {}: {e}", room.page_id);
            }
        });
    }

    /// Reconcile durable rows with the current document state.
    ///
    /// Serialized per page; the document lock is held only while taking
    /// the snapshot, never across store I/O.
    pub async fn flush(&self, store: &ComponentStore) -> Result<FlushOutcome, StoreError> {
        let _serial = self.flush_lock.lock().await;
        let snapshot = self.snapshot().await;
        let outcome = storage::reconcile(store, self.page_id, &snapshot)?;
        log::debug!(
            "Flushed page {}: {} upserted, {} deleted",
            self.page_id,
            outcome.upserted,
            outcome.deleted
        );
        Ok(outcome)
    }
}

/// Owns the page id → room map and its lifecycle.
///
/// Injected into whatever serves connections; nothing here is a singleton.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<PageRoom>>>,
    broadcast_capacity: usize,
    store: Option<Arc<ComponentStore>>,
    flush_debounce: Duration,
    idle_grace: Duration,
}

impl RoomRegistry {
    pub fn new(
        broadcast_capacity: usize,
        store: Option<Arc<ComponentStore>>,
        flush_debounce: Duration,
        idle_grace: Duration,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            store,
            flush_debounce,
            idle_grace,
        }
    }

    pub fn store(&self) -> Option<&Arc<ComponentStore>> {
        self.store.as_ref()
    }

    /// Get or create the room for a page and wait for its hydration.
    ///
    /// The registry lock is released before hydration, so loading one page
    /// never blocks sessions opening other pages. Concurrent opens of the
    /// same page all await the single hydration.
    pub async fn open(&self, page_id: Uuid) -> Arc<PageRoom> {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&page_id).cloned()
        };
        let room = match room {
            Some(room) => room,
            None => {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(page_id)
                    .or_insert_with(|| Arc::new(PageRoom::new(page_id, self.broadcast_capacity)))
                    .clone()
            }
        };
        room.hydrate(self.store.as_ref()).await;
        room
    }

    pub async fn get(&self, page_id: Uuid) -> Option<Arc<PageRoom>> {
        self.rooms.read().await.get(&page_id).cloned()
    }

    /// Schedule a debounced flush for a room (no-op without a store).
    pub fn schedule_flush(&self, room: &Arc<PageRoom>) {
        if let Some(store) = &self.store {
            room.schedule_flush(store.clone(), self.flush_debounce);
        }
    }

    /// Called after a session disconnects from a page.
    ///
    /// When it was the last one, the room is flushed a final time and kept
    /// around for the idle grace period to serve fast reconnects, then
    /// dropped if still empty.
    pub async fn session_closed(self: &Arc<Self>, page_id: Uuid) {
        let room = match self.get(page_id).await {
            Some(room) => room,
            None => return,
        };
        if room.broadcast.session_count().await > 0 {
            return;
        }

        if let Some(store) = &self.store {
            if let Err(e) = room.flush(store).await {
                log::warn!("Final flush failed for page {page_id}: {e}");
            }
        }

        let registry = self.clone();
        let grace = self.idle_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut rooms = registry.rooms.write().await;
            if let Some(room) = rooms.get(&page_id) {
                if room.broadcast.session_count().await == 0 {
                    rooms.remove(&page_id);
                    log::info!("Room {page_id} evicted after idle grace");
                }
            }
        });
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_pages(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionInfo;
    use crate::storage::StoreConfig;
    use inkpad_core::{ComponentKind, ComponentOptions, ComponentRecord};

    fn test_store() -> (tempfile::TempDir, Arc<ComponentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ComponentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, Arc::new(store))
    }

    fn registry(store: Option<Arc<ComponentStore>>) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(
            64,
            store,
            Duration::from_millis(10),
            Duration::from_millis(20),
        ))
    }

    fn stored_row(text: &str) -> ComponentRecord {
        ComponentRecord {
            id: Uuid::new_v4(),
            kind: ComponentKind::Text,
            x: 10.0,
            y: 20.0,
            width: 200.0,
            height: 100.0,
            z_index: 0,
            text: Some(text.to_string()),
            shape_data: None,
            has_image: false,
        }
    }

    #[tokio::test]
    async fn test_open_returns_same_room() {
        let registry = registry(None);
        let page = Uuid::new_v4();

        let a = registry.open(page).await;
        let b = registry.open(page).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_per_page() {
        let registry = registry(None);
        let a = registry.open(Uuid::new_v4()).await;
        let b = registry.open(Uuid::new_v4()).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_open_hydrates_from_rows() {
        let (_dir, store) = test_store();
        let page = Uuid::new_v4();
        let row = stored_row("hello");
        store.upsert_component(page, &row).unwrap();

        let registry = registry(Some(store));
        let room = registry.open(page).await;

        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, row.id);
        assert_eq!(snapshot[0].text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_open_without_store_starts_empty() {
        let registry = registry(None);
        let room = registry.open(Uuid::new_v4()).await;
        assert!(room.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_merge_then_flush_persists() {
        let (_dir, store) = test_store();
        let registry = registry(Some(store.clone()));
        let page = Uuid::new_v4();
        let room = registry.open(page).await;

        // a client's delta: one new component
        let replica = CanvasDocument::new();
        let id = replica.insert_component(
            ComponentKind::Image,
            1.0,
            2.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        room.apply_delta(&replica.full_state()).await.unwrap();

        let outcome = room.flush(&store).await.unwrap();
        assert_eq!(outcome.upserted, 1);
        let rows = store.load_components(page).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }

    #[tokio::test]
    async fn test_scheduled_flush_debounces() {
        let (_dir, store) = test_store();
        let registry = registry(Some(store.clone()));
        let page = Uuid::new_v4();
        let room = registry.open(page).await;

        let replica = CanvasDocument::new();
        replica.insert_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        room.apply_delta(&replica.full_state()).await.unwrap();

        registry.schedule_flush(&room);
        registry.schedule_flush(&room);
        registry.schedule_flush(&room);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.load_components(page).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_disconnect_flushes_and_evicts_after_grace() {
        let (_dir, store) = test_store();
        let registry = registry(Some(store.clone()));
        let page = Uuid::new_v4();
        let room = registry.open(page).await;

        let info = SessionInfo::new("Alice");
        let _rx = room.broadcast.add_session(info.clone()).await;

        let replica = CanvasDocument::new();
        replica.insert_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        room.apply_delta(&replica.full_state()).await.unwrap();

        room.broadcast.remove_session(&info.session_id).await;
        registry.session_closed(page).await;

        // final flush happened before eviction
        assert_eq!(store.load_components(page).unwrap().len(), 1);
        // still resident during the grace period
        assert_eq!(registry.room_count().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.room_count().await, 0);

        // re-opening re-hydrates transparently
        let reopened = registry.open(page).await;
        assert_eq!(reopened.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_during_grace_keeps_room() {
        let registry = registry(None);
        let page = Uuid::new_v4();
        let room = registry.open(page).await;

        let info = SessionInfo::new("Alice");
        let _rx = room.broadcast.add_session(info.clone()).await;
        room.broadcast.remove_session(&info.session_id).await;
        registry.session_closed(page).await;

        // a new session arrives within the grace period
        let _rx2 = room.broadcast.add_session(SessionInfo::new("Bob")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_flushes_are_serialized_per_page() {
        let (_dir, store) = test_store();
        let registry = registry(Some(store.clone()));
        let room = registry.open(Uuid::new_v4()).await;

        let replica = CanvasDocument::new();
        replica.insert_component(
            ComponentKind::Image,
            0.0,
            0.0,
            100.0,
            100.0,
            ComponentOptions::default(),
        );
        room.apply_delta(&replica.full_state()).await.unwrap();

        let (a, b) = tokio::join!(room.flush(&store), room.flush(&store));
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
