//! Which contexts are connected and which one is in control.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tabsnap::ActionSpec;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::pending::PendingInvocations;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// One socket from a context: where to send frames and the invocations
/// waiting on replies that arrive over it.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: u64,
    pub sender: mpsc::UnboundedSender<Message>,
    pub pending: PendingInvocations,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            sender,
            pending: PendingInvocations::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContextEntry {
    pub connection: ConnectionHandle,
    pub html: String,
    pub actions: BTreeMap<String, ActionSpec>,
    pub hidden: bool,
    /// Registry-wide sequence number of the last message; breaks ties.
    pub last_seen: u64,
    /// Wall clock of the last message, in milliseconds since the epoch.
    pub last_seen_at: u64,
}

#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: HashMap<String, ContextEntry>,
    active: Option<String>,
    clock: u64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message from `context_id` over `connection`, registering the
    /// context on first sight. Returns true when that made it active.
    pub fn touch(&mut self, context_id: &str, connection: &ConnectionHandle) -> bool {
        self.clock += 1;
        let last_seen = self.clock;
        let last_seen_at = now_millis();

        match self.entries.get_mut(context_id) {
            Some(entry) => {
                entry.connection = connection.clone();
                entry.last_seen = last_seen;
                entry.last_seen_at = last_seen_at;
                false
            }
            None => {
                self.entries.insert(
                    context_id.to_string(),
                    ContextEntry {
                        connection: connection.clone(),
                        html: String::new(),
                        actions: BTreeMap::new(),
                        hidden: true,
                        last_seen,
                        last_seen_at,
                    },
                );
                info!(%context_id, connection = connection.id, "context registered");
                if self.active.is_none() {
                    self.set_active(Some(context_id.to_string()));
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Store a snapshot. Returns true when it belongs to the active context.
    pub fn record_snapshot(
        &mut self,
        context_id: &str,
        html: String,
        actions: BTreeMap<String, ActionSpec>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(context_id) else {
            return false;
        };
        entry.html = html;
        entry.actions = actions;
        self.active.as_deref() == Some(context_id)
    }

    /// Apply a visibility report. A context that becomes visible takes
    /// control; the active context going hidden hands control to the most
    /// recently seen visible one. Returns true when the agent's view of the
    /// active context must be rebuilt.
    pub fn set_visibility(&mut self, context_id: &str, hidden: bool) -> bool {
        let Some(entry) = self.entries.get_mut(context_id) else {
            return false;
        };
        entry.hidden = hidden;
        if !hidden {
            self.set_active(Some(context_id.to_string()));
            true
        } else if self.active.as_deref() == Some(context_id) {
            let next = self.most_recent_visible();
            self.set_active(next);
            true
        } else {
            false
        }
    }

    /// Drop every context that used `connection_id`. Returns true when the
    /// active context was among them.
    pub fn remove_connection(&mut self, connection_id: u64) -> bool {
        let gone: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.connection.id == connection_id)
            .map(|(cid, _)| cid.clone())
            .collect();
        let mut was_active = false;
        for context_id in gone {
            self.entries.remove(&context_id);
            info!(%context_id, connection = connection_id, "context disconnected");
            was_active |= self.active.as_deref() == Some(context_id.as_str());
        }
        if was_active {
            let next = self.most_recent_visible();
            self.set_active(next);
        }
        was_active
    }

    pub fn most_recent_visible(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.hidden)
            .max_by_key(|(_, entry)| entry.last_seen)
            .map(|(cid, _)| cid.clone())
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_entry(&self) -> Option<(&str, &ContextEntry)> {
        let cid = self.active.as_deref()?;
        self.entries.get(cid).map(|entry| (cid, entry))
    }

    pub fn get(&self, context_id: &str) -> Option<&ContextEntry> {
        self.entries.get(context_id)
    }

    /// Connected context ids, sorted.
    pub fn context_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set_active(&mut self, context_id: Option<String>) {
        if self.active != context_id {
            info!(active = context_id.as_deref().unwrap_or("none"), "active context changed");
        } else {
            debug!(active = ?context_id, "active context unchanged");
        }
        self.active = context_id;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionHandle::new(tx)
    }

    #[test]
    fn first_context_becomes_active() {
        let mut registry = ContextRegistry::new();
        let a = connection();
        let b = connection();
        assert!(registry.touch("a", &a));
        assert!(!registry.touch("b", &b));
        assert_eq!(registry.active(), Some("a"));
        assert!(registry.get("b").unwrap().hidden);
        assert_eq!(registry.context_ids(), vec!["a", "b"]);
    }

    #[test]
    fn visibility_arbitration() {
        let mut registry = ContextRegistry::new();
        let (a, b) = (connection(), connection());
        registry.touch("a", &a);
        registry.touch("b", &b);

        registry.touch("b", &b);
        assert!(registry.set_visibility("b", false));
        assert_eq!(registry.active(), Some("b"));

        registry.touch("a", &a);
        assert!(registry.set_visibility("a", false));
        assert_eq!(registry.active(), Some("a"));

        registry.touch("a", &a);
        assert!(registry.set_visibility("a", true));
        assert_eq!(registry.active(), Some("b"));

        registry.touch("b", &b);
        assert!(registry.set_visibility("b", true));
        assert_eq!(registry.active(), None);

        // hiding a context that is not active changes nothing
        assert!(!registry.set_visibility("a", true));
    }

    #[test]
    fn most_recent_visible_wins() {
        let mut registry = ContextRegistry::new();
        let (a, b, c) = (connection(), connection(), connection());
        for (cid, conn) in [("a", &a), ("b", &b), ("c", &c)] {
            registry.touch(cid, conn);
            registry.set_visibility(cid, false);
        }
        registry.touch("a", &a);
        assert_eq!(registry.most_recent_visible().as_deref(), Some("a"));
        registry.touch("c", &c);
        registry.set_visibility("c", true);
        assert_eq!(registry.active(), Some("a"));
    }

    #[test]
    fn disconnect_rearbitrates() {
        let mut registry = ContextRegistry::new();
        let (a, b) = (connection(), connection());
        registry.touch("a", &a);
        registry.set_visibility("a", false);
        registry.touch("b", &b);
        registry.set_visibility("b", false);
        assert_eq!(registry.active(), Some("b"));

        assert!(!registry.remove_connection(a.id));
        assert_eq!(registry.active(), Some("b"));
        assert!(registry.remove_connection(b.id));
        assert_eq!(registry.active(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshots_report_whether_active() {
        let mut registry = ContextRegistry::new();
        let (a, b) = (connection(), connection());
        registry.touch("a", &a);
        registry.touch("b", &b);
        assert!(registry.record_snapshot("a", "<p>a</p>".into(), BTreeMap::new()));
        assert!(!registry.record_snapshot("b", "<p>b</p>".into(), BTreeMap::new()));
        assert!(!registry.record_snapshot("zzz", String::new(), BTreeMap::new()));
        let (cid, entry) = registry.active_entry().unwrap();
        assert_eq!(cid, "a");
        assert_eq!(entry.html, "<p>a</p>");
    }
}
