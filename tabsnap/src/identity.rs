//! Bidirectional map between opaque element ids and live elements.

use std::collections::HashMap;

use uuid::Uuid;

use crate::dom::{NodeRef, WeakNodeRef};

/// Strict bijection between ids and live elements.
///
/// Elements are held weakly; the map indexes them but never keeps them alive.
/// Binding an id that already points elsewhere, or an element that already
/// has another id, evicts the stale pair first.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    by_id: HashMap<String, WeakNodeRef>,
    by_node: HashMap<WeakNodeRef, String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `node`, evicting any previous binding of either side.
    pub fn set(&mut self, id: impl Into<String>, node: &NodeRef) {
        let id = id.into();
        let weak = node.downgrade();
        if let Some(old_node) = self.by_id.remove(&id) {
            self.by_node.remove(&old_node);
        }
        if let Some(old_id) = self.by_node.remove(&weak) {
            self.by_id.remove(&old_id);
        }
        self.by_id.insert(id.clone(), weak.clone());
        self.by_node.insert(weak, id);
    }

    /// The live element bound to `id`, if it still exists.
    pub fn get(&self, id: &str) -> Option<NodeRef> {
        self.by_id.get(id).and_then(WeakNodeRef::upgrade)
    }

    /// The id bound to `node`.
    pub fn get_key(&self, node: &NodeRef) -> Option<&str> {
        self.by_node.get(&node.downgrade()).map(String::as_str)
    }

    pub fn remove(&mut self, id: &str) -> Option<WeakNodeRef> {
        let node = self.by_id.remove(id)?;
        self.by_node.remove(&node);
        Some(node)
    }

    pub fn contains_key(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn contains_node(&self, node: &NodeRef) -> bool {
        self.by_node.contains_key(&node.downgrade())
    }

    /// Bindings whose element is still alive.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeRef)> + '_ {
        self.by_id
            .iter()
            .filter_map(|(id, node)| node.upgrade().map(|n| (id.as_str(), n)))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop bindings whose element no longer exists.
    pub fn prune(&mut self) {
        let dead: Vec<String> = self
            .by_id
            .iter()
            .filter(|(_, node)| !node.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            self.remove(&id);
        }
    }
}

/// A fresh random id: the last group of a v4 UUID (12 hex digits).
pub fn mint_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    uuid.rsplit('-').next().unwrap_or(&uuid).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evicts_both_directions() {
        let a = NodeRef::new_element("button");
        let b = NodeRef::new_element("button");
        let mut map = IdentityMap::new();

        map.set("x", &a);
        map.set("y", &a);
        assert!(!map.contains_key("x"));
        assert_eq!(map.get_key(&a), Some("y"));

        map.set("y", &b);
        assert!(!map.contains_node(&a));
        assert_eq!(map.get("y"), Some(b.clone()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn clone_is_independent() {
        let a = NodeRef::new_element("a");
        let mut original = IdentityMap::new();
        original.set("one", &a);
        let mut copy = original.clone();
        copy.set("two", &NodeRef::new_element("a"));
        copy.remove("one");
        assert_eq!(original.get("one"), Some(a));
        assert_eq!(original.len(), 1);
        assert_eq!(copy.len(), 1);
    }

    #[test]
    fn dropped_elements_do_not_resolve() {
        let mut map = IdentityMap::new();
        {
            let gone = NodeRef::new_element("input");
            map.set("gone", &gone);
        }
        assert!(map.get("gone").is_none());
        assert_eq!(map.iter().count(), 0);
        map.prune();
        assert!(map.is_empty());
    }

    #[test]
    fn minted_ids_are_short_hex() {
        let id = mint_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, mint_id());
    }
}
