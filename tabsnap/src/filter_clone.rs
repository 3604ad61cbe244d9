//! Iterative, filtered copy of a live node tree.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::dom::NodeRef;
use crate::errors::SnapError;

/// Attribute placed on the `div` that stands in for an inlined frame.
pub const ORIGINAL_TAG_ATTRIBUTE: &str = "data-originaltag";

/// Per-node decision hook for [`filter_clone`].
///
/// `candidate` is a fresh copy of `original` (shallow for elements, deep for
/// text and comments). Return the node to keep, which may be the candidate,
/// a modified candidate or a replacement, or `None` to drop the node and its
/// subtree.
pub trait NodeFilter {
    fn decide(&mut self, candidate: NodeRef, original: &NodeRef)
        -> Result<Option<NodeRef>, SnapError>;
}

impl<F> NodeFilter for F
where
    F: FnMut(NodeRef, &NodeRef) -> Result<Option<NodeRef>, SnapError>,
{
    fn decide(
        &mut self,
        candidate: NodeRef,
        original: &NodeRef,
    ) -> Result<Option<NodeRef>, SnapError> {
        self(candidate, original)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameInlining {
    /// Frames are copied like any other element (their content is not).
    #[default]
    Disabled,
    /// Same-origin frames are replaced by a placeholder holding the filtered
    /// children of the frame's body.
    SameOrigin,
}

/// Produce a filtered copy of `root`.
///
/// Returns `None` when the root itself is rejected. Errors raised by the
/// filter, or by frame access, drop the node concerned and the pass goes on.
pub fn filter_clone(
    root: &NodeRef,
    filter: &mut dyn NodeFilter,
    frames: FrameInlining,
) -> Option<NodeRef> {
    let origin = match frames {
        FrameInlining::SameOrigin => root.owner_document().map(|doc| doc.origin()),
        FrameInlining::Disabled => None,
    };

    let accepted = decide_or_drop(filter, copy_of(root), root)?;
    let mut stack = Vec::new();
    if root.is_element() && accepted.is_element() {
        stack.push((root.clone(), accepted.clone()));
    }
    let mut inlined: HashSet<NodeRef> = HashSet::new();

    while let Some((original, copy)) = stack.pop() {
        for child in original.children() {
            if let Some(origin) = origin.as_deref() {
                if child.is_same_origin_frame(origin) {
                    if let Some(expansion) =
                        inline_frame(filter, &child, &copy, &mut inlined)
                    {
                        stack.push(expansion);
                    }
                    continue;
                }
            }

            let Some(kept) = decide_or_drop(filter, copy_of(&child), &child) else {
                continue;
            };
            if !attach(&copy, &kept) {
                warn!(node = ?child, "filter returned a node that is already attached");
                continue;
            }
            if child.is_element() && kept.is_element() {
                stack.push((child, kept));
            }
        }
    }

    Some(accepted)
}

fn copy_of(node: &NodeRef) -> NodeRef {
    node.clone_node(!node.is_element())
}

/// Link a kept node under its copied parent. Only detached nodes qualify,
/// which also rules out cycles.
fn attach(parent: &NodeRef, kept: &NodeRef) -> bool {
    if kept.parent().is_some() || kept == parent {
        return false;
    }
    parent.attach_child(kept, None);
    true
}

fn decide_or_drop(
    filter: &mut dyn NodeFilter,
    candidate: NodeRef,
    original: &NodeRef,
) -> Option<NodeRef> {
    match filter.decide(candidate, original) {
        Ok(kept) => kept,
        Err(err) => {
            warn!(node = ?original, error = %err, "dropping node after filter error");
            None
        }
    }
}

/// Offer a placeholder for `frame` to the filter and, if it is kept, return
/// the frame body paired with the placeholder so the caller expands it.
fn inline_frame(
    filter: &mut dyn NodeFilter,
    frame: &NodeRef,
    parent_copy: &NodeRef,
    inlined: &mut HashSet<NodeRef>,
) -> Option<(NodeRef, NodeRef)> {
    let body = match frame.content_document() {
        Ok(Some(doc)) => doc.body()?,
        Ok(None) => {
            debug!(frame = ?frame, "frame has no document yet, skipping");
            return None;
        }
        Err(err) => {
            warn!(frame = ?frame, error = %err, "dropping frame");
            return None;
        }
    };
    if !inlined.insert(body.clone()) {
        warn!(frame = ?frame, "frame document already inlined, skipping");
        return None;
    }

    let placeholder = match frame.owner_document() {
        Some(doc) => doc.create_element("div"),
        None => NodeRef::new_element("div"),
    };
    placeholder.set_attribute(ORIGINAL_TAG_ATTRIBUTE, "iframe");

    let kept = decide_or_drop(filter, placeholder, frame)?;
    if !attach(parent_copy, &kept) {
        warn!(frame = ?frame, "filter returned a placeholder that is already attached");
        return None;
    }
    kept.is_element().then_some((body, kept))
}
