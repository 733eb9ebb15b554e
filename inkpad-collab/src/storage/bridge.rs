//! Bridge between the replicated document and durable rows.
//!
//! Hydration maps rows into a fresh document; flushing reconciles the
//! document's component set against the store by set difference rather
//! than event replay:
//!
//! ```text
//! document ids ──┐
//!                ├── store-only ids → hard delete
//! store ids ─────┘
//! document ids   → upsert with current field values
//! ```
//!
//! This tolerates the service restarting with only the latest in-memory
//! snapshot; changes observed but not yet flushed when the process dies
//! are lost, bounded by the flush debounce interval.

use std::collections::HashSet;
use uuid::Uuid;

use inkpad_core::{CanvasDocument, ComponentRecord};

use super::rows::{ComponentStore, StoreError};

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub upserted: usize,
    pub deleted: usize,
}

/// Populate a fresh document from durable rows.
pub fn hydrate(doc: &CanvasDocument, rows: &[ComponentRecord]) {
    for row in rows {
        doc.insert_record(row);
    }
}

/// Load a page's rows and build its document.
///
/// A store failure is reported to the caller; the caller decides whether
/// to proceed with an empty document.
pub fn load_document(store: &ComponentStore, page_id: Uuid) -> Result<CanvasDocument, StoreError> {
    let rows = store.load_components(page_id)?;
    let doc = CanvasDocument::new();
    hydrate(&doc, &rows);
    Ok(doc)
}

/// Reconcile durable rows with a snapshot of the authoritative document.
///
/// Ids present in the store but absent from the snapshot are hard-deleted;
/// every snapshot record is upserted with its current field values (text
/// already flattened). Page metadata is restamped at the end.
pub fn reconcile(
    store: &ComponentStore,
    page_id: Uuid,
    snapshot: &[ComponentRecord],
) -> Result<FlushOutcome, StoreError> {
    let live: HashSet<Uuid> = snapshot.iter().map(|r| r.id).collect();
    let stored = store.component_ids(page_id)?;

    let stale: Vec<Uuid> = stored.into_iter().filter(|id| !live.contains(id)).collect();
    store.delete_components(page_id, &stale)?;

    for record in snapshot {
        store.upsert_component(page_id, record)?;
    }
    store.update_page_metadata(page_id)?;

    Ok(FlushOutcome {
        upserted: snapshot.len(),
        deleted: stale.len(),
    })
}
