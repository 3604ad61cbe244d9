//! Live document tree
//!
//! A small, thread-safe model of a rendered document that the snapshot engine
//! observes and that actions mutate. Handles are reference-counted; two
//! [`NodeRef`]s are equal only when they point at the same live node.

use serde::{Deserialize, Serialize};

mod document;
mod event;
mod node;
mod observer;
mod serialize;

pub use document::{Document, History};
pub use event::{Event, Listener, ListenerId};
pub use node::{NodeRef, NodeType, WeakNodeRef};
pub use observer::{
    MutationKind, MutationObserver, MutationRecord, MutationStream, ObserveOptions,
};

/// Bounding box assigned to an element by the host's layout.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// The subset of computed style the visibility rules look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
}

impl ComputedStyle {
    pub fn is_displayed(&self) -> bool {
        self.display != "none"
    }

    pub fn is_visible(&self) -> bool {
        self.visibility != "hidden" && self.visibility != "collapse"
    }
}
