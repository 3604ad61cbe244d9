use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::node::NodeRef;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) struct RegisteredListener {
    pub(crate) id: ListenerId,
    pub(crate) event_type: String,
    pub(crate) callback: Listener,
}

/// A dispatched event. Listeners receive it by reference and may cancel it.
pub struct Event {
    event_type: String,
    key: Option<String>,
    bubbles: bool,
    cancelable: bool,
    default_prevented: AtomicBool,
    target: OnceLock<NodeRef>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("key", &self.key)
            .field("default_prevented", &self.default_prevented())
            .finish()
    }
}

impl Event {
    /// A non-cancelable event that bubbles.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            key: None,
            bubbles: true,
            cancelable: false,
            default_prevented: AtomicBool::new(false),
            target: OnceLock::new(),
        }
    }

    /// A cancelable keyboard event (`keydown`, `keyup`) carrying `key`.
    pub fn keyboard(event_type: &str, key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            cancelable: true,
            ..Self::new(event_type)
        }
    }

    pub fn cancelable(mut self) -> Self {
        self.cancelable = true;
        self
    }

    pub fn non_bubbling(mut self) -> Self {
        self.bubbles = false;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn target(&self) -> Option<&NodeRef> {
        self.target.get()
    }

    pub fn prevent_default(&self) {
        if self.cancelable {
            self.default_prevented.store(true, Ordering::SeqCst);
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::SeqCst)
    }
}

impl NodeRef {
    pub fn add_event_listener(&self, event_type: &str, callback: Listener) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.write().listeners.push(RegisteredListener {
            id,
            event_type: event_type.to_string(),
            callback,
        });
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.write();
        let before = inner.listeners.len();
        inner.listeners.retain(|l| l.id != id);
        before != inner.listeners.len()
    }

    /// Dispatch `event` at this node and bubble it through the ancestors.
    /// Returns `false` when a listener cancelled it.
    pub fn dispatch_event(&self, event: &Event) -> bool {
        let _ = event.target.set(self.clone());
        let mut current = Some(self.clone());
        while let Some(node) = current {
            let callbacks: Vec<Listener> = node
                .read()
                .listeners
                .iter()
                .filter(|l| l.event_type == event.event_type)
                .map(|l| l.callback.clone())
                .collect();
            for callback in callbacks {
                callback(event);
            }
            if !event.bubbles {
                break;
            }
            current = node.parent();
        }
        !event.default_prevented()
    }

    /// Simulate a user click, including the default activation of
    /// checkboxes and radio buttons.
    pub fn click(&self) {
        let event = Event::new("click").cancelable();
        if !self.dispatch_event(&event) {
            return;
        }
        match self.input_type().as_deref() {
            Some("checkbox") => {
                self.set_checked(!self.checked());
                self.dispatch_event(&Event::new("input"));
                self.dispatch_event(&Event::new("change"));
            }
            Some("radio") if !self.checked() => {
                self.set_checked(true);
                self.dispatch_event(&Event::new("input"));
                self.dispatch_event(&Event::new("change"));
            }
            _ => {}
        }
    }
}
