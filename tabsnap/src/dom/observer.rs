use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use super::node::{NodeRef, WeakNodeRef};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Which mutations an observer is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveOptions {
    pub attributes: bool,
    pub character_data: bool,
    pub child_list: bool,
    pub subtree: bool,
}

impl ObserveOptions {
    /// Everything, including the whole subtree.
    pub fn all() -> Self {
        Self {
            attributes: true,
            character_data: true,
            child_list: true,
            subtree: true,
        }
    }

    fn wants(&self, kind: &MutationKind) -> bool {
        match kind {
            MutationKind::Attributes { .. } => self.attributes,
            MutationKind::CharacterData => self.character_data,
            MutationKind::ChildList | MutationKind::FrameLoaded => self.child_list,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    Attributes { name: String },
    CharacterData,
    ChildList,
    /// A document finished loading into an `<iframe>`.
    FrameLoaded,
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: WeakNodeRef,
}

pub(crate) struct ObserverShared {
    id: u64,
    sender: mpsc::UnboundedSender<MutationRecord>,
    targets: Mutex<Vec<WeakNodeRef>>,
}

#[derive(Clone)]
pub(crate) struct ObserverRegistration {
    pub(crate) observer: Weak<ObserverShared>,
    pub(crate) options: ObserveOptions,
}

/// Watches one or more subtrees and delivers records, in the order they
/// happened, to the paired [`MutationStream`].
#[derive(Clone)]
pub struct MutationObserver {
    shared: Arc<ObserverShared>,
}

pub struct MutationStream {
    receiver: mpsc::UnboundedReceiver<MutationRecord>,
}

impl MutationObserver {
    pub fn new() -> (Self, MutationStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ObserverShared {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            targets: Mutex::new(Vec::new()),
        });
        (Self { shared }, MutationStream { receiver })
    }

    /// Start observing `target`. Observing the same node again replaces the
    /// previous options.
    pub fn observe(&self, target: &NodeRef, options: ObserveOptions) {
        {
            let mut inner = target.write();
            inner
                .registrations
                .retain(|r| r.observer.upgrade().is_some_and(|o| o.id != self.shared.id));
            inner.registrations.push(ObserverRegistration {
                observer: Arc::downgrade(&self.shared),
                options,
            });
        }
        let mut targets = self.targets();
        let weak = target.downgrade();
        if !targets.contains(&weak) {
            targets.push(weak);
        }
    }

    /// Stop observing every target.
    pub fn disconnect(&self) {
        let targets: Vec<WeakNodeRef> = std::mem::take(&mut *self.targets());
        for target in targets.iter().filter_map(WeakNodeRef::upgrade) {
            target
                .write()
                .registrations
                .retain(|r| r.observer.upgrade().is_some_and(|o| o.id != self.shared.id));
        }
    }

    pub fn is_observing(&self, target: &NodeRef) -> bool {
        self.targets().contains(&target.downgrade())
    }

    /// Push a synthetic record into the stream.
    pub fn enqueue(&self, record: MutationRecord) {
        let _ = self.shared.sender.send(record);
    }

    fn targets(&self) -> std::sync::MutexGuard<'_, Vec<WeakNodeRef>> {
        self.shared
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MutationStream {
    /// Wait for at least one record, then take everything already queued.
    /// Returns `None` once every observer handle is gone.
    pub async fn next_batch(&mut self) -> Option<Vec<MutationRecord>> {
        let first = self.receiver.recv().await?;
        let mut batch = vec![first];
        batch.extend(self.take_records());
        Some(batch)
    }

    /// Drain queued records without waiting.
    pub fn take_records(&mut self) -> Vec<MutationRecord> {
        let mut out = Vec::new();
        while let Ok(record) = self.receiver.try_recv() {
            out.push(record);
        }
        out
    }
}

/// Notify every observer registered on `target` or, with `subtree`, on one of
/// its ancestors.
pub(crate) fn queue_mutation(target: &NodeRef, kind: MutationKind) {
    let mut interested: Vec<Arc<ObserverShared>> = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(target.clone());
    let mut is_target = true;
    while let Some(node) = current {
        let registrations = node.read().registrations.clone();
        for registration in registrations {
            if !is_target && !registration.options.subtree {
                continue;
            }
            if !registration.options.wants(&kind) {
                continue;
            }
            if let Some(observer) = registration.observer.upgrade() {
                if seen.insert(observer.id) {
                    interested.push(observer);
                }
            }
        }
        is_target = false;
        current = node.parent();
    }

    if interested.is_empty() {
        return;
    }
    trace!(?kind, observers = interested.len(), "queueing mutation");
    let record = MutationRecord {
        kind,
        target: target.downgrade(),
    };
    for observer in interested {
        let _ = observer.sender.send(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subtree_observer_sees_descendant_changes() {
        let root = NodeRef::new_element("div");
        let child = NodeRef::new_element("span");
        root.append_child(&child).unwrap();

        let (observer, mut stream) = MutationObserver::new();
        observer.observe(&root, ObserveOptions::all());
        child.set_attribute("class", "x");
        child.append_child(&NodeRef::new_text("hi")).unwrap();

        let batch = stream.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch[0].kind,
            MutationKind::Attributes {
                name: "class".into()
            }
        );
        assert_eq!(batch[1].kind, MutationKind::ChildList);
        assert_eq!(batch[1].target.upgrade(), Some(child));
    }

    #[test]
    fn non_subtree_observer_ignores_descendants() {
        let root = NodeRef::new_element("div");
        let child = NodeRef::new_element("span");
        root.append_child(&child).unwrap();

        let (observer, mut stream) = MutationObserver::new();
        observer.observe(
            &root,
            ObserveOptions {
                attributes: true,
                ..Default::default()
            },
        );
        child.set_attribute("title", "nope");
        root.append_child(&NodeRef::new_text("nope")).unwrap();
        root.set_attribute("title", "yes");
        let records = stream.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target.upgrade(), Some(root));
    }

    #[test]
    fn disconnect_stops_delivery() {
        let root = NodeRef::new_element("div");
        let (observer, mut stream) = MutationObserver::new();
        observer.observe(&root, ObserveOptions::all());
        assert!(observer.is_observing(&root));
        observer.disconnect();
        assert!(!observer.is_observing(&root));
        root.set_attribute("id", "a");
        assert!(stream.take_records().is_empty());
    }

    #[test]
    fn value_property_is_not_a_mutation() {
        let input = NodeRef::new_element("input");
        let (observer, mut stream) = MutationObserver::new();
        observer.observe(&input, ObserveOptions::all());
        input.set_value("typed").unwrap();
        assert!(stream.take_records().is_empty());
    }
}
