//! # inkpad-core — Replicated document model for inkpad
//!
//! The conflict-free data model behind a collaborative freeform page:
//! a flat set of positioned, resizable visual components, replicated
//! field-by-field, with an embedded character-level text CRDT per Text
//! component.
//!
//! ## Modules
//!
//! - [`component`] — Component records, kinds, partial updates, size floors
//! - [`document`] — [`CanvasDocument`], the mergeable per-page structure
//!
//! This crate is synchronous and I/O-free; networking, sessions and
//! persistence live in `inkpad-collab`.

pub mod component;
pub mod document;

pub use component::{
    ComponentKind, ComponentOptions, ComponentRecord, ComponentUpdate, MIN_HEIGHT, MIN_WIDTH,
    TEXT_MIN_HEIGHT, TEXT_MIN_WIDTH,
};
pub use document::{CanvasDocument, DocumentError, StructureChange, TextHandle};

// The yrs subscription guard is part of this crate's observation API.
pub use yrs::Subscription;
