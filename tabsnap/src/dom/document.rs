use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use scraper::Html;
use tracing::debug;
use url::Url;

use super::event::Event;
use super::node::NodeRef;
use crate::errors::SnapError;

/// A loaded document: its URL, its root `<html>` element and its session
/// history.
#[derive(Clone)]
pub struct Document {
    shared: Arc<DocumentShared>,
}

pub(crate) struct DocumentShared {
    url: Url,
    root: NodeRef,
    history: History,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Document {}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.shared.url.as_str())
            .finish()
    }
}

impl Document {
    pub(crate) fn from_shared(shared: Arc<DocumentShared>) -> Self {
        Self { shared }
    }

    /// An empty document (`<html><head></head><body></body></html>`).
    pub fn new(url: &str) -> Result<Self, SnapError> {
        Self::parse(url, "")
    }

    /// Parse `html` into a live tree owned by a new document at `url`.
    pub fn parse(url: &str, html: &str) -> Result<Self, SnapError> {
        let url = Url::parse(url)
            .map_err(|e| SnapError::InvalidArgument(format!("invalid document url {url}: {e}")))?;
        let parsed = Html::parse_document(html);
        let history = History::new(url.as_str());

        let shared = Arc::new_cyclic(|owner: &Weak<DocumentShared>| {
            let root = build_tree(&parsed, owner);
            DocumentShared { url, root, history }
        });
        debug!(
            url = %shared.url,
            nodes = shared.root.descendants().len(),
            "parsed document"
        );
        Ok(Self { shared })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// ASCII serialization of the document origin, e.g. `https://example.com`.
    pub fn origin(&self) -> String {
        self.shared.url.origin().ascii_serialization()
    }

    pub fn document_element(&self) -> NodeRef {
        self.shared.root.clone()
    }

    pub fn head(&self) -> Option<NodeRef> {
        self.shared
            .root
            .children()
            .into_iter()
            .find(|n| n.has_tag("head"))
    }

    pub fn body(&self) -> Option<NodeRef> {
        self.shared
            .root
            .children()
            .into_iter()
            .find(|n| n.has_tag("body"))
    }

    pub fn create_element(&self, tag: &str) -> NodeRef {
        NodeRef::element_in(tag, Vec::new(), Some(Arc::downgrade(&self.shared)))
    }

    pub fn create_text_node(&self, text: &str) -> NodeRef {
        NodeRef::text_in(text, Some(Arc::downgrade(&self.shared)))
    }

    pub fn create_comment(&self, text: &str) -> NodeRef {
        NodeRef::comment_in(text, Some(Arc::downgrade(&self.shared)))
    }

    /// Every element with `tag`, in document order, including the root.
    pub fn query_all(&self, tag: &str) -> Vec<NodeRef> {
        let root = self.document_element();
        let mut out = Vec::new();
        if root.has_tag(tag) {
            out.push(root.clone());
        }
        out.extend(root.elements_by_tag(tag));
        out
    }

    /// The first element whose attribute `name` equals `value`.
    pub fn find_by_attribute(&self, name: &str, value: &str) -> Option<NodeRef> {
        let root = self.document_element();
        std::iter::once(root.clone())
            .chain(root.descendants())
            .find(|n| n.attribute(name).as_deref() == Some(value))
    }

    pub fn element_by_id(&self, id: &str) -> Option<NodeRef> {
        self.find_by_attribute("id", id)
    }

    pub fn history(&self) -> &History {
        &self.shared.history
    }

    /// Step back in history, firing `popstate` when the position changed.
    pub fn go_back(&self) -> bool {
        let moved = self.shared.history.back();
        if moved {
            self.document_element().dispatch_event(&Event::new("popstate"));
        }
        moved
    }

    pub fn go_forward(&self) -> bool {
        let moved = self.shared.history.forward();
        if moved {
            self.document_element().dispatch_event(&Event::new("popstate"));
        }
        moved
    }

    pub fn outer_html(&self) -> String {
        self.shared.root.outer_html()
    }
}

/// Convert the parsed tree into live nodes. Only the `<html>` element and
/// what is under it is kept.
fn build_tree(parsed: &Html, owner: &Weak<DocumentShared>) -> NodeRef {
    let html_element = parsed
        .tree
        .root()
        .children()
        .find(|n| matches!(n.value(), scraper::Node::Element(el) if el.name() == "html"));

    let Some(html_element) = html_element else {
        return NodeRef::element_in("html", Vec::new(), Some(owner.clone()));
    };
    let root = element_from(html_element.value(), owner);

    let mut stack = vec![(html_element, root.clone())];
    while let Some((source, target)) = stack.pop() {
        for child in source.children() {
            let node = match child.value() {
                scraper::Node::Element(_) => {
                    let node = element_from(child.value(), owner);
                    stack.push((child, node.clone()));
                    node
                }
                scraper::Node::Text(text) => NodeRef::text_in(text, Some(owner.clone())),
                scraper::Node::Comment(comment) => {
                    NodeRef::comment_in(comment, Some(owner.clone()))
                }
                _ => continue,
            };
            target.attach_child(&node, None);
        }
    }
    root
}

fn element_from(node: &scraper::Node, owner: &Weak<DocumentShared>) -> NodeRef {
    match node {
        scraper::Node::Element(el) => {
            let attributes = el
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            NodeRef::element_in(el.name(), attributes, Some(owner.clone()))
        }
        _ => NodeRef::element_in("div", Vec::new(), Some(owner.clone())),
    }
}

#[derive(Debug)]
struct HistoryState {
    entries: Vec<String>,
    index: usize,
}

/// Session history of a document.
#[derive(Debug)]
pub struct History {
    state: Mutex<HistoryState>,
}

impl History {
    fn new(initial: &str) -> Self {
        Self {
            state: Mutex::new(HistoryState {
                entries: vec![initial.to_string()],
                index: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry after the current one, dropping any forward entries.
    pub fn push(&self, url: &str) {
        let mut state = self.lock();
        let keep = state.index + 1;
        state.entries.truncate(keep);
        state.entries.push(url.to_string());
        state.index = keep;
    }

    pub fn back(&self) -> bool {
        let mut state = self.lock();
        if state.index == 0 {
            return false;
        }
        state.index -= 1;
        true
    }

    pub fn forward(&self) -> bool {
        let mut state = self.lock();
        if state.index + 1 >= state.entries.len() {
            return false;
        }
        state.index += 1;
        true
    }

    pub fn current(&self) -> String {
        let state = self.lock();
        state.entries[state.index].clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
