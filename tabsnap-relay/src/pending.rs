//! Invocations sent to a context and still waiting for their `cmdres`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// What a context sent back: the result fields, or its error message.
pub type CommandReply = Result<Map<String, Value>, String>;

type PendingMap = HashMap<String, oneshot::Sender<CommandReply>>;

/// Table of outstanding invocation ids. Clones share the table.
#[derive(Clone, Default)]
pub struct PendingInvocations {
    inner: Arc<Mutex<PendingMap>>,
}

impl PendingInvocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, invocation_id: &str) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(invocation_id.to_string(), tx);
        rx
    }

    /// Hand `reply` to the waiting invocation. Unknown ids, including those
    /// that already timed out, are discarded.
    pub async fn resolve(&self, invocation_id: &str, reply: CommandReply) -> bool {
        let waiter = self.inner.lock().await.remove(invocation_id);
        match waiter {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(%invocation_id, "invocation caller went away");
                }
                true
            }
            None => {
                debug!(%invocation_id, "discarding result for unknown invocation");
                false
            }
        }
    }

    pub async fn remove(&self, invocation_id: &str) -> bool {
        self.inner.lock().await.remove(invocation_id).is_some()
    }

    pub async fn contains(&self, invocation_id: &str) -> bool {
        self.inner.lock().await.contains_key(invocation_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

impl std::fmt::Debug for PendingInvocations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocations").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_once() {
        let pending = PendingInvocations::new();
        let rx = pending.register("a").await;
        assert!(pending.contains("a").await);

        let mut fields = Map::new();
        fields.insert("clicked".into(), json!(true));
        assert!(pending.resolve("a", Ok(fields.clone())).await);
        assert_eq!(rx.await.unwrap(), Ok(fields));

        assert!(!pending.resolve("a", Err("late".into())).await);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn removed_ids_are_discarded() {
        let pending = PendingInvocations::new();
        let _rx = pending.register("b").await;
        assert_eq!(pending.len().await, 1);
        assert!(pending.remove("b").await);
        assert!(!pending.remove("b").await);
        assert!(!pending.resolve("b", Ok(Map::new())).await);
    }
}
