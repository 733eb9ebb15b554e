//! Replicated canvas document.
//!
//! One [`CanvasDocument`] holds the mergeable state for one page: a shared
//! map of component maps, where every scalar field is an independently
//! mergeable last-writer-wins slot and every Text component embeds a
//! character-level text CRDT. Any number of replicas can mutate
//! concurrently; applying each other's updates in any order converges to
//! the same state.
//!
//! ```text
//! Doc
//!  └── "components" (Map)
//!        └── <component id> (Map)
//!              ├── "type" / "x" / "y" / "width" / "height" / "zIndex"
//!              ├── "text"      (Text, Text kind only)
//!              ├── "shapeData" (atomic JSON string)
//!              └── "hasImage"
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use uuid::Uuid;
use yrs::types::{EntryChange, Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, DeepObservable, Doc, GetString, Map, MapPrelim, MapRef, Observable, Origin, Out, ReadTxn,
    StateVector, Subscription, Text, TextPrelim, TextRef, Transact, Update,
};

use crate::component::{
    ComponentKind, ComponentOptions, ComponentRecord, ComponentUpdate, MIN_HEIGHT, MIN_WIDTH,
};

/// Transaction origin tag for updates applied from remote replicas.
///
/// Local-update observers skip transactions carrying this origin, so remote
/// changes are never echoed back over the wire.
const REMOTE_ORIGIN: &str = "remote";

/// Errors from update plumbing.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// An encoded update or state vector failed to decode or integrate.
    InvalidUpdate(String),
    /// An observer could not be registered.
    Subscription(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            DocumentError::Subscription(e) => write!(f, "Subscription error: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// A structural change to the component set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureChange {
    Added(Uuid),
    Removed(Uuid),
}

/// Mutable handle to one component's embedded text sequence.
///
/// Callers edit through this handle rather than by passing whole strings,
/// so concurrent edits from several users merge at character level.
pub struct TextHandle {
    doc: Doc,
    text: TextRef,
}

impl TextHandle {
    /// Insert `chunk` at `index` (clamped to the current length).
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        self.text.insert(&mut txn, index.min(len), chunk);
    }

    /// Append `chunk` at the end.
    pub fn push(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.push(&mut txn, chunk);
    }

    /// Delete up to `len` units starting at `index`. Out-of-range deletes
    /// are clamped, never an error.
    pub fn delete(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let text_len = self.text.len(&txn);
        if index >= text_len || len == 0 {
            return;
        }
        self.text.remove_range(&mut txn, index, len.min(text_len - index));
    }

    pub fn len(&self) -> u32 {
        self.text.len(&self.doc.transact())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The flattened string form of the sequence.
    pub fn content(&self) -> String {
        self.text.get_string(&self.doc.transact())
    }
}

/// The replicated document for one page.
pub struct CanvasDocument {
    doc: Doc,
    components: MapRef,
}

impl CanvasDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let components = doc.get_or_insert_map("components");
        Self { doc, components }
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Insert a new component and return its id.
    ///
    /// `z_index` defaults to one above the current maximum (0 for an empty
    /// document). Width/height are clamped to the kind's floor.
    pub fn insert_component(
        &self,
        kind: ComponentKind,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        options: ComponentOptions,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let z = options.z_index.unwrap_or_else(|| self.next_z_index());

        let mut txn = self.doc.transact_mut();
        let comp = self
            .components
            .insert(&mut txn, id.to_string(), MapPrelim::default());
        comp.insert(&mut txn, "id", id.to_string());
        comp.insert(&mut txn, "type", kind.as_str());
        comp.insert(&mut txn, "x", x);
        comp.insert(&mut txn, "y", y);
        comp.insert(&mut txn, "width", width.max(kind.min_width()));
        comp.insert(&mut txn, "height", height.max(kind.min_height()));
        comp.insert(&mut txn, "zIndex", z);

        if kind == ComponentKind::Text {
            comp.insert(
                &mut txn,
                "text",
                TextPrelim::new(options.text.unwrap_or_default()),
            );
        }
        if let Some(shape) = options.shape_data {
            comp.insert(&mut txn, "shapeData", shape.to_string());
        }
        if options.has_image {
            comp.insert(&mut txn, "hasImage", true);
        }

        id
    }

    /// Insert a component with a known id and full field values.
    ///
    /// Used when reconstructing a document from durable rows.
    pub fn insert_record(&self, record: &ComponentRecord) {
        let mut txn = self.doc.transact_mut();
        let comp = self
            .components
            .insert(&mut txn, record.id.to_string(), MapPrelim::default());
        comp.insert(&mut txn, "id", record.id.to_string());
        comp.insert(&mut txn, "type", record.kind.as_str());
        comp.insert(&mut txn, "x", record.x);
        comp.insert(&mut txn, "y", record.y);
        comp.insert(&mut txn, "width", record.width);
        comp.insert(&mut txn, "height", record.height);
        comp.insert(&mut txn, "zIndex", record.z_index);

        if record.kind == ComponentKind::Text {
            comp.insert(
                &mut txn,
                "text",
                TextPrelim::new(record.text.clone().unwrap_or_default()),
            );
        }
        if let Some(ref shape) = record.shape_data {
            comp.insert(&mut txn, "shapeData", shape.as_str());
        }
        if record.has_image {
            comp.insert(&mut txn, "hasImage", true);
        }
    }

    /// Apply a partial field update. Returns `false` (a silent no-op) when
    /// the id is unknown.
    ///
    /// Each present field is written into its own mergeable slot inside one
    /// transaction; absent fields are untouched, so a concurrent writer of a
    /// disjoint field set is never clobbered. Width/height are clamped to
    /// the kind's floor here, at the mutation boundary.
    pub fn update_component(&self, id: Uuid, update: &ComponentUpdate) -> bool {
        let mut txn = self.doc.transact_mut();
        let comp = match self.components.get(&txn, &id.to_string()) {
            Some(Out::YMap(m)) => m,
            _ => {
                log::debug!("Ignoring update for unknown component {id}");
                return false;
            }
        };
        if update.is_empty() {
            return true;
        }

        let kind = comp
            .get(&txn, "type")
            .and_then(out_string)
            .and_then(|s| ComponentKind::parse(&s));
        let (min_w, min_h) = match kind {
            Some(k) => (k.min_width(), k.min_height()),
            None => (MIN_WIDTH, MIN_HEIGHT),
        };

        if let Some(x) = update.x {
            comp.insert(&mut txn, "x", x);
        }
        if let Some(y) = update.y {
            comp.insert(&mut txn, "y", y);
        }
        if let Some(w) = update.width {
            comp.insert(&mut txn, "width", w.max(min_w));
        }
        if let Some(h) = update.height {
            comp.insert(&mut txn, "height", h.max(min_h));
        }
        if let Some(z) = update.z_index {
            comp.insert(&mut txn, "zIndex", z);
        }
        if let Some(ref s) = update.text {
            match comp.get(&txn, "text") {
                Some(Out::YText(t)) => {
                    let len = t.len(&txn);
                    if len > 0 {
                        t.remove_range(&mut txn, 0, len);
                    }
                    if !s.is_empty() {
                        t.insert(&mut txn, 0, s);
                    }
                }
                _ => {
                    comp.insert(&mut txn, "text", TextPrelim::new(s.clone()));
                }
            }
        }
        if let Some(ref shape) = update.shape_data {
            comp.insert(&mut txn, "shapeData", shape.to_string());
        }
        if let Some(b) = update.has_image {
            comp.insert(&mut txn, "hasImage", b);
        }
        true
    }

    /// Remove a component. Idempotent: removing an absent id is a no-op
    /// returning `false`.
    pub fn remove_component(&self, id: Uuid) -> bool {
        let mut txn = self.doc.transact_mut();
        self.components.remove(&mut txn, &id.to_string()).is_some()
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn contains(&self, id: Uuid) -> bool {
        let txn = self.doc.transact();
        self.components.contains_key(&txn, &id.to_string())
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.components.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn component_ids(&self) -> Vec<Uuid> {
        let txn = self.doc.transact();
        self.components
            .keys(&txn)
            .filter_map(|k| Uuid::parse_str(&k).ok())
            .collect()
    }

    /// Read one component's current field values.
    pub fn get(&self, id: Uuid) -> Option<ComponentRecord> {
        let txn = self.doc.transact();
        match self.components.get(&txn, &id.to_string()) {
            Some(Out::YMap(m)) => Some(read_record(&txn, id, &m)),
            _ => None,
        }
    }

    /// Snapshot of all components in rendering order.
    ///
    /// Stable sort by `z_index`; ties broken by id so every replica renders
    /// the same order. Duplicate `z_index` values are legal.
    pub fn snapshot(&self) -> Vec<ComponentRecord> {
        let txn = self.doc.transact();
        let mut records: Vec<ComponentRecord> =
            Vec::with_capacity(self.components.len(&txn) as usize);
        for (key, value) in self.components.iter(&txn) {
            let id = match Uuid::parse_str(&key) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if let Out::YMap(m) = value {
                records.push(read_record(&txn, id, &m));
            }
        }
        records.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Highest `z_index` currently in the document, if any.
    pub fn max_z_index(&self) -> Option<i64> {
        let txn = self.doc.transact();
        let mut max = None;
        for (_key, value) in self.components.iter(&txn) {
            if let Out::YMap(m) = value {
                let z = m.get(&txn, "zIndex").and_then(out_i64).unwrap_or(0);
                max = Some(max.map_or(z, |cur: i64| cur.max(z)));
            }
        }
        max
    }

    /// The `z_index` a newly added component receives by default.
    pub fn next_z_index(&self) -> i64 {
        self.max_z_index().map_or(0, |z| z + 1)
    }

    /// Handle to a component's embedded text sequence, or `None` when the
    /// component is absent or carries no text.
    pub fn text(&self, id: Uuid) -> Option<TextHandle> {
        let txn = self.doc.transact();
        let comp = match self.components.get(&txn, &id.to_string()) {
            Some(Out::YMap(m)) => m,
            _ => return None,
        };
        match comp.get(&txn, "text") {
            Some(Out::YText(t)) => Some(TextHandle {
                doc: self.doc.clone(),
                text: t,
            }),
            _ => None,
        }
    }

    // ─── Update plumbing ──────────────────────────────────────────────

    /// Apply an encoded update produced by another replica.
    ///
    /// Runs under the remote origin so local-update observers skip it.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(decoded)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Everything this replica knows, as one update.
    pub fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// The updates a replica at `sv` is missing.
    pub fn diff(&self, sv: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(sv)
    }

    /// As [`Self::diff`], taking the v1-encoded state vector off the wire.
    pub fn diff_encoded(&self, sv_bytes: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(sv_bytes)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(self.diff(&sv))
    }

    /// Merge several encoded updates into one.
    pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, DocumentError> {
        let mut decoded = Vec::with_capacity(updates.len());
        for bytes in updates {
            decoded.push(
                Update::decode_v1(bytes)
                    .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?,
            );
        }
        Ok(Update::merge_updates(decoded).encode_v1())
    }

    // ─── Observation ──────────────────────────────────────────────────
    //
    // Three independent event sources, so a consumer interested in one
    // component's geometry never pays for a full-document re-scan.

    /// Observe components being added to or removed from the page.
    pub fn observe_structure<F>(&self, f: F) -> Subscription
    where
        F: Fn(&[StructureChange]) + Send + Sync + 'static,
    {
        self.components.observe(move |txn, event| {
            let mut changes = Vec::new();
            for (key, change) in event.keys(txn) {
                let id = match Uuid::parse_str(key) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                match change {
                    EntryChange::Inserted(_) => changes.push(StructureChange::Added(id)),
                    EntryChange::Removed(_) => changes.push(StructureChange::Removed(id)),
                    EntryChange::Updated(_, _) => {}
                }
            }
            if !changes.is_empty() {
                f(&changes);
            }
        })
    }

    /// Observe scalar field changes on one existing component. The callback
    /// receives the changed field names.
    pub fn observe_component<F>(&self, id: Uuid, f: F) -> Subscription
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let id_str = id.to_string();
        self.components.observe_deep(move |txn, events| {
            let mut fields = Vec::new();
            for event in events.iter() {
                if let Event::Map(map_event) = event {
                    let path = map_event.path();
                    if path.len() != 1 {
                        continue;
                    }
                    let matches = matches!(
                        path.front(),
                        Some(PathSegment::Key(k)) if k.as_ref() == id_str
                    );
                    if !matches {
                        continue;
                    }
                    for key in map_event.keys(txn).keys() {
                        fields.push(key.to_string());
                    }
                }
            }
            if !fields.is_empty() {
                f(&fields);
            }
        })
    }

    /// Observe edits inside one component's text sequence.
    pub fn observe_text<F>(&self, id: Uuid, f: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id_str = id.to_string();
        self.components.observe_deep(move |_txn, events| {
            for event in events.iter() {
                if let Event::Text(text_event) = event {
                    let path = text_event.path();
                    let matches = matches!(
                        path.front(),
                        Some(PathSegment::Key(k)) if k.as_ref() == id_str
                    );
                    if matches {
                        f();
                        break;
                    }
                }
            }
        })
    }

    /// Observe encoded updates produced by local mutations.
    ///
    /// Updates applied through [`Self::apply_update`] are excluded, so the
    /// stream is safe to forward over the network without echo loops.
    pub fn observe_local_updates<F>(&self, f: F) -> Result<Subscription, DocumentError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let remote: Origin = REMOTE_ORIGIN.into();
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                f(&event.update);
            })
            .map_err(|e| DocumentError::Subscription(e.to_string()))
    }
}

impl Default for CanvasDocument {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────

fn read_record<T: ReadTxn>(txn: &T, id: Uuid, comp: &MapRef) -> ComponentRecord {
    let kind = comp
        .get(txn, "type")
        .and_then(out_string)
        .and_then(|s| ComponentKind::parse(&s))
        .unwrap_or(ComponentKind::Text);
    let text = match comp.get(txn, "text") {
        Some(Out::YText(t)) => Some(t.get_string(txn)),
        _ => None,
    };
    ComponentRecord {
        id,
        kind,
        x: comp.get(txn, "x").and_then(out_f64).unwrap_or(0.0),
        y: comp.get(txn, "y").and_then(out_f64).unwrap_or(0.0),
        width: comp.get(txn, "width").and_then(out_f64).unwrap_or(0.0),
        height: comp.get(txn, "height").and_then(out_f64).unwrap_or(0.0),
        z_index: comp.get(txn, "zIndex").and_then(out_i64).unwrap_or(0),
        text,
        shape_data: comp.get(txn, "shapeData").and_then(out_string),
        has_image: comp.get(txn, "hasImage").and_then(out_bool).unwrap_or(false),
    }
}

fn out_f64(out: Out) -> Option<f64> {
    match out {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(i)) => Some(i as f64),
        _ => None,
    }
}

fn out_i64(out: Out) -> Option<i64> {
    match out {
        Out::Any(Any::BigInt(i)) => Some(i),
        Out::Any(Any::Number(n)) => Some(n as i64),
        _ => None,
    }
}

fn out_bool(out: Out) -> Option<bool> {
    match out {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

fn out_string(out: Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
