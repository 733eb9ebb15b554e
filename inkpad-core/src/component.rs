//! Component model for a freeform canvas page.
//!
//! A page is a flat set of positioned, resizable components. Each component
//! is replicated field-by-field; [`ComponentRecord`] is the plain snapshot
//! form handed to renderers and to the persistence layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum extent for generic components.
pub const MIN_WIDTH: f64 = 50.0;
pub const MIN_HEIGHT: f64 = 30.0;

/// Text components host rich formatting and need more room.
pub const TEXT_MIN_WIDTH: f64 = 120.0;
pub const TEXT_MIN_HEIGHT: f64 = 40.0;

/// The kind of visual element a component renders as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Text,
    Image,
    Drawing,
}

impl ComponentKind {
    /// Wire/storage tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Text => "TEXT",
            ComponentKind::Image => "IMAGE",
            ComponentKind::Drawing => "DRAWING",
        }
    }

    /// Parse a stored tag. Unknown tags map to `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "TEXT" => Some(ComponentKind::Text),
            "IMAGE" => Some(ComponentKind::Image),
            "DRAWING" => Some(ComponentKind::Drawing),
            _ => None,
        }
    }

    /// Minimum width for this kind, enforced at the mutation boundary.
    pub fn min_width(&self) -> f64 {
        match self {
            ComponentKind::Text => TEXT_MIN_WIDTH,
            _ => MIN_WIDTH,
        }
    }

    /// Minimum height for this kind, enforced at the mutation boundary.
    pub fn min_height(&self) -> f64 {
        match self {
            ComponentKind::Text => TEXT_MIN_HEIGHT,
            _ => MIN_HEIGHT,
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain snapshot of one component.
///
/// `text` carries the flattened string form of the embedded text sequence;
/// live character-level editing goes through [`crate::TextHandle`] instead.
/// `shape_data` is an opaque JSON payload, replicated and stored as an
/// atomic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: Uuid,
    pub kind: ComponentKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub z_index: i64,
    pub text: Option<String>,
    pub shape_data: Option<String>,
    pub has_image: bool,
}

/// Creation-time options for a new component.
#[derive(Debug, Clone, Default)]
pub struct ComponentOptions {
    /// Explicit stacking order; defaults to one above the current maximum.
    pub z_index: Option<i64>,
    /// Pre-seeded text content (Text kind).
    pub text: Option<String>,
    /// Opaque shape payload (Drawing kind).
    pub shape_data: Option<serde_json::Value>,
    /// Whether image bytes exist for this component in the external store.
    pub has_image: bool,
}

/// A partial field update.
///
/// Only the fields that are `Some` are written, each into its own
/// independently mergeable slot; concurrent updates to disjoint fields
/// never clobber each other.
#[derive(Debug, Clone, Default)]
pub struct ComponentUpdate {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub z_index: Option<i64>,
    /// Wholesale text replacement. Collaborative typing should mutate the
    /// text handle directly instead.
    pub text: Option<String>,
    pub shape_data: Option<serde_json::Value>,
    pub has_image: Option<bool>,
}

impl ComponentUpdate {
    /// An update moving a component.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// An update resizing a component.
    pub fn size(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    /// An update reassigning the stacking order.
    pub fn z_index(z: i64) -> Self {
        Self {
            z_index: Some(z),
            ..Self::default()
        }
    }

    /// True if the update touches nothing at all.
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.z_index.is_none()
            && self.text.is_none()
            && self.shape_data.is_none()
            && self.has_image.is_none()
    }

    /// True if the update only touches position/size fields.
    ///
    /// These are the attribute classes produced at high frequency by drag
    /// and resize gestures, and the ones whose network propagation gets
    /// throttled.
    pub fn geometry_only(&self) -> bool {
        let has_geometry = self.x.is_some()
            || self.y.is_some()
            || self.width.is_some()
            || self.height.is_some();
        has_geometry
            && self.z_index.is_none()
            && self.text.is_none()
            && self.shape_data.is_none()
            && self.has_image.is_none()
    }
}
