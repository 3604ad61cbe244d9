use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::debug;
use url::Url;

use super::document::{Document, DocumentShared};
use super::event::RegisteredListener;
use super::observer::{queue_mutation, MutationKind, ObserverRegistration};
use super::{ComputedStyle, Rect};
use crate::errors::SnapError;

/// Tags whose default user-agent style is `display: none`.
const HIDDEN_BY_DEFAULT: &[&str] = &[
    "head", "script", "style", "title", "meta", "link", "template", "base",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Element,
    Text,
    Comment,
}

pub(crate) struct Node {
    inner: RwLock<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) parent: Option<Weak<Node>>,
    pub(crate) owner: Option<Weak<DocumentShared>>,
    pub(crate) children: Vec<NodeRef>,
    pub(crate) data: NodeData,
    pub(crate) listeners: Vec<RegisteredListener>,
    pub(crate) registrations: Vec<ObserverRegistration>,
}

#[derive(Clone)]
pub(crate) enum NodeData {
    Element(ElementData),
    Text(String),
    Comment(String),
}

#[derive(Clone)]
pub(crate) struct ElementData {
    pub(crate) tag: String,
    pub(crate) attributes: Vec<(String, String)>,
    /// Live value set through the `value` property (the "dirty" value).
    pub(crate) value: Option<String>,
    pub(crate) checked: Option<bool>,
    pub(crate) layout: Option<Rect>,
    pub(crate) frame: Option<FrameSlot>,
}

#[derive(Clone)]
pub(crate) struct FrameSlot {
    pub(crate) document: Option<Document>,
    pub(crate) accessible: bool,
}

impl Drop for Node {
    // Unlink uniquely owned descendants one level at a time so that dropping
    // a very deep tree does not recurse.
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut stack = std::mem::take(&mut inner.children);
        while let Some(child) = stack.pop() {
            if Arc::strong_count(&child.0) == 1 {
                stack.append(&mut child.write().children);
            }
        }
    }
}

/// Shared handle to a live node. Equality and hashing use reference identity.
#[derive(Clone)]
pub struct NodeRef(pub(crate) Arc<Node>);

/// Non-owning handle to a live node.
#[derive(Clone)]
pub struct WeakNodeRef(Weak<Node>);

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl PartialEq for WeakNodeRef {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for WeakNodeRef {}

impl Hash for WeakNodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Weak::as_ptr(&self.0) as usize).hash(state);
    }
}

impl WeakNodeRef {
    pub fn upgrade(&self) -> Option<NodeRef> {
        self.0.upgrade().map(NodeRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakNodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(node) => write!(f, "Weak({node:?})"),
            None => write!(f, "Weak(<dropped>)"),
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        match &inner.data {
            NodeData::Element(el) => {
                write!(f, "<{}", el.tag)?;
                if let Some((_, id)) = el.attributes.iter().find(|(k, _)| k == "id") {
                    write!(f, "#{id}")?;
                }
                write!(f, ">")
            }
            NodeData::Text(text) => {
                let head: String = text.chars().take(24).collect();
                write!(f, "#text({head:?})")
            }
            NodeData::Comment(_) => write!(f, "#comment"),
        }
    }
}

impl NodeRef {
    fn from_data(data: NodeData, owner: Option<Weak<DocumentShared>>) -> Self {
        NodeRef(Arc::new(Node {
            inner: RwLock::new(NodeInner {
                parent: None,
                owner,
                children: Vec::new(),
                data,
                listeners: Vec::new(),
                registrations: Vec::new(),
            }),
        }))
    }

    pub(crate) fn element_in(
        tag: &str,
        attributes: Vec<(String, String)>,
        owner: Option<Weak<DocumentShared>>,
    ) -> Self {
        Self::from_data(
            NodeData::Element(ElementData {
                tag: tag.to_ascii_lowercase(),
                attributes,
                value: None,
                checked: None,
                layout: None,
                frame: None,
            }),
            owner,
        )
    }

    pub(crate) fn text_in(text: &str, owner: Option<Weak<DocumentShared>>) -> Self {
        Self::from_data(NodeData::Text(text.to_string()), owner)
    }

    pub(crate) fn comment_in(text: &str, owner: Option<Weak<DocumentShared>>) -> Self {
        Self::from_data(NodeData::Comment(text.to_string()), owner)
    }

    /// Create a detached element that belongs to no document.
    pub fn new_element(tag: &str) -> Self {
        Self::element_in(tag, Vec::new(), None)
    }

    pub fn new_text(text: &str) -> Self {
        Self::text_in(text, None)
    }

    pub fn new_comment(text: &str) -> Self {
        Self::comment_in(text, None)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NodeInner> {
        self.0.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, NodeInner> {
        self.0.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakNodeRef {
        WeakNodeRef(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &NodeRef) -> bool {
        self == other
    }

    pub fn node_type(&self) -> NodeType {
        match self.read().data {
            NodeData::Element(_) => NodeType::Element,
            NodeData::Text(_) => NodeType::Text,
            NodeData::Comment(_) => NodeType::Comment,
        }
    }

    pub fn is_element(&self) -> bool {
        self.node_type() == NodeType::Element
    }

    /// Lower-case tag name, `None` for text and comment nodes.
    pub fn tag_name(&self) -> Option<String> {
        match &self.read().data {
            NodeData::Element(el) => Some(el.tag.clone()),
            _ => None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        match &self.read().data {
            NodeData::Element(el) => el.tag.eq_ignore_ascii_case(tag),
            _ => false,
        }
    }

    pub fn owner_document(&self) -> Option<Document> {
        self.read()
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Document::from_shared)
    }

    fn owner_url(&self) -> Option<Url> {
        self.owner_document().map(|doc| doc.url().clone())
    }

    // ------------------------------------------------------------------
    // Character data
    // ------------------------------------------------------------------

    /// Data of a text or comment node.
    pub fn data(&self) -> Option<String> {
        match &self.read().data {
            NodeData::Text(text) | NodeData::Comment(text) => Some(text.clone()),
            NodeData::Element(_) => None,
        }
    }

    /// Concatenated text of this node and its descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            let inner = node.read();
            match &inner.data {
                NodeData::Text(text) => out.push_str(text),
                NodeData::Comment(text) if node == *self => out.push_str(text),
                NodeData::Comment(_) => {}
                NodeData::Element(_) => {
                    for child in inner.children.iter().rev() {
                        stack.push(child.clone());
                    }
                }
            }
        }
        out
    }

    /// Replace the data of a text/comment node, or the children of an element
    /// with a single text node.
    pub fn set_text(&self, text: &str) {
        let is_element = {
            let mut inner = self.write();
            match &mut inner.data {
                NodeData::Text(data) | NodeData::Comment(data) => {
                    *data = text.to_string();
                    false
                }
                NodeData::Element(_) => true,
            }
        };
        if !is_element {
            queue_mutation(self, MutationKind::CharacterData);
            return;
        }
        let owner = self.read().owner.clone();
        for child in self.children() {
            self.detach_child(&child);
        }
        if !text.is_empty() {
            let node = NodeRef::text_in(text, owner);
            self.attach_child(&node, None);
        }
        queue_mutation(self, MutationKind::ChildList);
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn attribute(&self, name: &str) -> Option<String> {
        match &self.read().data {
            NodeData::Element(el) => el
                .attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Attributes in document order.
    pub fn attributes(&self) -> Vec<(String, String)> {
        match &self.read().data {
            NodeData::Element(el) => el.attributes.clone(),
            _ => Vec::new(),
        }
    }

    pub fn attribute_names(&self) -> Vec<String> {
        match &self.read().data {
            NodeData::Element(el) => el.attributes.iter().map(|(k, _)| k.clone()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        {
            let mut inner = self.write();
            let NodeData::Element(el) = &mut inner.data else {
                return;
            };
            match el.attributes.iter_mut().find(|(k, _)| *k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => el.attributes.push((name.clone(), value.to_string())),
            }
        }
        queue_mutation(self, MutationKind::Attributes { name });
    }

    pub fn remove_attribute(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.write();
            let NodeData::Element(el) = &mut inner.data else {
                return false;
            };
            let before = el.attributes.len();
            el.attributes.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            before != el.attributes.len()
        };
        if removed {
            queue_mutation(
                self,
                MutationKind::Attributes {
                    name: name.to_ascii_lowercase(),
                },
            );
        }
        removed
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .map(|v| v.split_ascii_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Tree structure
    // ------------------------------------------------------------------

    pub fn parent(&self) -> Option<NodeRef> {
        self.read().parent.as_ref().and_then(Weak::upgrade).map(NodeRef)
    }

    pub fn children(&self) -> Vec<NodeRef> {
        self.read().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.read().children.len()
    }

    pub fn first_child(&self) -> Option<NodeRef> {
        self.read().children.first().cloned()
    }

    /// Inclusive ancestor check.
    pub fn contains(&self, other: &NodeRef) -> bool {
        let mut current = Some(other.clone());
        while let Some(node) = current {
            if node == *self {
                return true;
            }
            current = node.parent();
        }
        false
    }

    /// Descendants in document order, excluding `self`.
    pub fn descendants(&self) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeRef> = self.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    /// Descendant elements with the given tag, in document order.
    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeRef> {
        self.descendants()
            .into_iter()
            .filter(|n| n.has_tag(tag))
            .collect()
    }

    /// Append `child`, moving it from its current parent if it has one.
    pub fn append_child(&self, child: &NodeRef) -> Result<(), SnapError> {
        self.insert_before(child, None)
    }

    pub fn insert_before(
        &self,
        child: &NodeRef,
        reference: Option<&NodeRef>,
    ) -> Result<(), SnapError> {
        if !self.is_element() {
            return Err(SnapError::InvalidTreeOperation(format!(
                "{self:?} cannot have children"
            )));
        }
        if child.contains(self) {
            return Err(SnapError::InvalidTreeOperation(format!(
                "inserting {child:?} under {self:?} would create a cycle"
            )));
        }
        if let Some(reference) = reference {
            if reference.parent().as_ref() != Some(self) {
                return Err(SnapError::InvalidTreeOperation(format!(
                    "{reference:?} is not a child of {self:?}"
                )));
            }
        }
        if let Some(old_parent) = child.parent() {
            old_parent.detach_child(child);
            queue_mutation(&old_parent, MutationKind::ChildList);
        }
        self.attach_child(child, reference);
        queue_mutation(self, MutationKind::ChildList);
        Ok(())
    }

    pub fn remove_child(&self, child: &NodeRef) -> Result<(), SnapError> {
        if child.parent().as_ref() != Some(self) {
            return Err(SnapError::InvalidTreeOperation(format!(
                "{child:?} is not a child of {self:?}"
            )));
        }
        self.detach_child(child);
        queue_mutation(self, MutationKind::ChildList);
        Ok(())
    }

    /// Detach this node from its parent, if any.
    pub fn remove(&self) {
        if let Some(parent) = self.parent() {
            parent.detach_child(self);
            queue_mutation(&parent, MutationKind::ChildList);
        }
    }

    /// Link without notifying observers; used while building trees.
    pub(crate) fn attach_child(&self, child: &NodeRef, reference: Option<&NodeRef>) {
        child.write().parent = Some(Arc::downgrade(&self.0));
        let mut inner = self.write();
        let index = reference
            .and_then(|r| inner.children.iter().position(|c| c == r))
            .unwrap_or(inner.children.len());
        inner.children.insert(index, child.clone());
    }

    fn detach_child(&self, child: &NodeRef) {
        self.write().children.retain(|c| c != child);
        child.write().parent = None;
    }

    // ------------------------------------------------------------------
    // Cloning
    // ------------------------------------------------------------------

    /// Copy this node. Shallow clones of elements have no children; listeners
    /// and observer registrations are never copied.
    pub fn clone_node(&self, deep: bool) -> NodeRef {
        let (data, owner) = {
            let inner = self.read();
            let data = match &inner.data {
                NodeData::Element(el) => NodeData::Element(ElementData {
                    tag: el.tag.clone(),
                    attributes: el.attributes.clone(),
                    value: el.value.clone(),
                    checked: el.checked,
                    layout: None,
                    frame: None,
                }),
                other => other.clone(),
            };
            (data, inner.owner.clone())
        };
        let root = NodeRef::from_data(data, owner);
        if deep {
            let mut stack = vec![(self.clone(), root.clone())];
            while let Some((source, target)) = stack.pop() {
                for child in source.children() {
                    let copy = child.clone_node(false);
                    target.attach_child(&copy, None);
                    stack.push((child, copy));
                }
            }
        }
        root
    }

    // ------------------------------------------------------------------
    // Form control state
    // ------------------------------------------------------------------

    /// Current value of a value-bearing element (`input`, `textarea`,
    /// `select`, `option`, `button`); `None` for every other node.
    pub fn value(&self) -> Option<String> {
        let tag = self.tag_name()?;
        match tag.as_str() {
            "input" => {
                let dirty = self.element_field(|el| el.value.clone()).flatten();
                Some(dirty.or_else(|| self.attribute("value")).unwrap_or_default())
            }
            "textarea" => {
                let dirty = self.element_field(|el| el.value.clone()).flatten();
                Some(dirty.unwrap_or_else(|| self.text_content()))
            }
            "select" => Some(self.select_value()),
            "option" => Some(option_value(self)),
            "button" => Some(self.attribute("value").unwrap_or_default()),
            _ => None,
        }
    }

    /// Set the `value` property. This is not a tree mutation and does not
    /// notify observers.
    pub fn set_value(&self, value: &str) -> Result<(), SnapError> {
        let tag = self.tag_name().unwrap_or_default();
        match tag.as_str() {
            "input" | "textarea" | "select" => {
                let mut inner = self.write();
                if let NodeData::Element(el) = &mut inner.data {
                    el.value = Some(value.to_string());
                }
                Ok(())
            }
            "option" | "button" => {
                self.set_attribute("value", value);
                Ok(())
            }
            _ => Err(SnapError::InvalidArgument(format!(
                "{self:?} has no value property"
            ))),
        }
    }

    /// `<option>` descendants of a `<select>` (or any element).
    pub fn options(&self) -> Vec<NodeRef> {
        self.elements_by_tag("option")
    }

    /// Values of the element's options, in document order.
    pub fn option_values(&self) -> Vec<String> {
        self.options().iter().map(option_value).collect()
    }

    fn select_value(&self) -> String {
        let options = self.options();
        let dirty = self.element_field(|el| el.value.clone()).flatten();
        if let Some(chosen) = dirty {
            if options.iter().any(|o| option_value(o) == chosen) {
                return chosen;
            }
        }
        options
            .iter()
            .find(|o| o.has_attribute("selected"))
            .or_else(|| options.first())
            .map(option_value)
            .unwrap_or_default()
    }

    pub fn input_type(&self) -> Option<String> {
        if !self.has_tag("input") {
            return None;
        }
        Some(
            self.attribute("type")
                .map(|t| t.to_ascii_lowercase())
                .unwrap_or_else(|| "text".to_string()),
        )
    }

    pub fn checked(&self) -> bool {
        self.element_field(|el| el.checked)
            .flatten()
            .unwrap_or_else(|| self.has_attribute("checked"))
    }

    pub fn set_checked(&self, checked: bool) {
        let mut inner = self.write();
        if let NodeData::Element(el) = &mut inner.data {
            el.checked = Some(checked);
        }
    }

    fn element_field<T>(&self, f: impl FnOnce(&ElementData) -> T) -> Option<T> {
        match &self.read().data {
            NodeData::Element(el) => Some(f(el)),
            _ => None,
        }
    }

    fn element_field_mut(&self, f: impl FnOnce(&mut ElementData)) {
        let mut inner = self.write();
        if let NodeData::Element(el) = &mut inner.data {
            f(el);
        }
    }

    // ------------------------------------------------------------------
    // Layout and style
    // ------------------------------------------------------------------

    pub fn set_layout(&self, rect: Rect) {
        self.element_field_mut(|el| el.layout = Some(rect));
    }

    pub fn clear_layout(&self) {
        self.element_field_mut(|el| el.layout = None);
    }

    /// The host-assigned box, or `None` when the element was never laid out.
    pub fn bounding_client_rect(&self) -> Option<Rect> {
        self.element_field(|el| el.layout).flatten()
    }

    pub fn computed_style(&self) -> ComputedStyle {
        ComputedStyle {
            display: self.computed_display(),
            visibility: self.computed_visibility(),
        }
    }

    fn inline_style(&self, prop: &str) -> Option<String> {
        let style = self.attribute("style")?;
        parse_inline_style(&style)
            .into_iter()
            .rev()
            .find(|(k, _)| k == prop)
            .map(|(_, v)| v)
    }

    pub fn computed_display(&self) -> String {
        self.inline_style("display").unwrap_or_else(|| {
            let tag = self.tag_name().unwrap_or_default();
            if self.has_attribute("hidden") || HIDDEN_BY_DEFAULT.contains(&tag.as_str()) {
                "none".to_string()
            } else {
                "inline".to_string()
            }
        })
    }

    /// The element's own `visibility`, or `None` when it inherits.
    pub fn declared_visibility(&self) -> Option<String> {
        self.inline_style("visibility").filter(|v| v != "inherit")
    }

    /// Walks up to the nearest element declaring a visibility.
    pub fn computed_visibility(&self) -> String {
        let mut current = Some(self.clone());
        while let Some(node) = current.filter(NodeRef::is_element) {
            if let Some(visibility) = node.declared_visibility() {
                return visibility;
            }
            current = node.parent();
        }
        "visible".to_string()
    }

    // ------------------------------------------------------------------
    // Embedded frames
    // ------------------------------------------------------------------

    /// The `src` attribute resolved against the owner document's URL.
    pub fn src(&self) -> Option<String> {
        let raw = self.attribute("src")?;
        if raw.is_empty() {
            return Some(raw);
        }
        match self.owner_url() {
            Some(base) => Some(
                base.join(&raw)
                    .map(|u| u.to_string())
                    .unwrap_or(raw),
            ),
            None => Some(raw),
        }
    }

    /// Whether this is an `<iframe>` whose resolved source has `origin`.
    pub fn is_same_origin_frame(&self, origin: &str) -> bool {
        if !self.has_tag("iframe") {
            return false;
        }
        match self.src() {
            Some(src) if !src.is_empty() => Url::parse(&src)
                .map(|u| u.origin().ascii_serialization() == origin)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The document loaded in an `<iframe>`. Cross-origin frames fail with
    /// [`SnapError::FrameInaccessible`].
    pub fn content_document(&self) -> Result<Option<Document>, SnapError> {
        let slot = self.element_field(|el| el.frame.clone()).flatten();
        match slot {
            None => Ok(None),
            Some(slot) if !slot.accessible => Err(SnapError::FrameInaccessible(
                self.src().unwrap_or_default(),
            )),
            Some(slot) => Ok(slot.document),
        }
    }

    /// Load `document` into this `<iframe>` and fire `load` on it.
    pub fn attach_frame_document(&self, document: Document) -> Result<(), SnapError> {
        if !self.has_tag("iframe") {
            return Err(SnapError::InvalidTreeOperation(format!(
                "{self:?} is not an iframe"
            )));
        }
        let accessible = match (self.owner_document(), self.src()) {
            (Some(host), Some(src)) if !src.is_empty() => {
                let same = self.is_same_origin_frame(&host.origin());
                if !same {
                    debug!(%src, "attaching cross-origin frame document");
                }
                same
            }
            _ => true,
        };
        self.element_field_mut(|el| {
            el.frame = Some(FrameSlot {
                document: Some(document),
                accessible,
            })
        });
        self.dispatch_event(&super::Event::new("load").non_bubbling());
        queue_mutation(self, MutationKind::FrameLoaded);
        Ok(())
    }

    /// Override the accessibility of the frame content, e.g. to model a
    /// sandboxed same-origin frame.
    pub fn set_frame_accessible(&self, accessible: bool) {
        self.element_field_mut(|el| {
            let slot = el.frame.get_or_insert(FrameSlot {
                document: None,
                accessible,
            });
            slot.accessible = accessible;
        });
    }
}

/// `option.value`: the `value` attribute, else the collapsed text.
fn option_value(option: &NodeRef) -> String {
    option.attribute("value").unwrap_or_else(|| {
        option
            .text_content()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    })
}

fn parse_inline_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let value = value.trim().trim_end_matches("!important").trim();
            Some((prop.trim().to_ascii_lowercase(), value.to_ascii_lowercase()))
        })
        .collect()
}
