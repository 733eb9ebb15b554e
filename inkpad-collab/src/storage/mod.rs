//! Durable storage for canvas pages.
//!
//! ```text
//! ┌─────────────┐   snapshot/diff   ┌────────────────┐
//! │  SyncServer │ ────────────────► │ ComponentStore │
//! │ (in-memory) │                   │   (RocksDB)    │
//! └──────┬──────┘                   └───────┬────────┘
//!        │ hydrate on first open            │ column families
//!        ▼                                  ▼
//! ┌─────────────┐        ┌──────────────────────────────────┐
//! │ CanvasDoc   │        │ CF "components" — one row per    │
//! │ (restored)  │        │                   component      │
//! └─────────────┘        │ CF "pages"      — page metadata  │
//!                        └──────────────────────────────────┘
//! ```

pub mod bridge;
pub mod rows;

pub use bridge::{hydrate, load_document, reconcile, FlushOutcome};
pub use rows::{ComponentStore, PageMetadata, StoreConfig, StoreError};
