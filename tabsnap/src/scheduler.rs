use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::errors::SnapError;

/// Scope for the tasks and timers of one observing session.
///
/// Everything spawned here, and every pending [`Scheduler::sleep`], ends when
/// [`Scheduler::stop`] is called.
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that is stopped together with this one but can also be
    /// stopped on its own.
    pub fn child(&self) -> Self {
        Self {
            cancellation_token: self.cancellation_token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn `task`; it is dropped at its next await point after `stop`.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancellation_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        })
    }

    /// Wait for `duration`, failing with [`SnapError::Cancelled`] if the
    /// scope is stopped first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SnapError> {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                Err(SnapError::Cancelled(format!("timer of {duration:?}")))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn stop(&self) {
        if !self.cancellation_token.is_cancelled() {
            debug!(tasks = self.tracker.len(), "stopping scheduler");
        }
        self.cancellation_token.cancel();
        self.tracker.close();
    }

    /// Wait until every spawned task has finished. Call after `stop`.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}
