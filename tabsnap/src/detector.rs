//! Change detector: keeps a snapshot and its action catalog in step with a
//! live tree, publishing only when the serialized view actually changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::actions::{build_catalog, ActionCatalog, ActionOptions};
use crate::dom::{Document, MutationKind, MutationObserver, MutationRecord, NodeRef, ObserveOptions};
use crate::errors::SnapError;
use crate::identity::IdentityMap;
use crate::scheduler::Scheduler;
use crate::snapshot::{Snapshot, SnapshotEngine, SnapshotOptions};

/// A new snapshot and the catalog that goes with it.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub html: String,
    pub catalog: ActionCatalog,
    /// 0 for the initial snapshot, then one more per published change.
    pub sequence: u64,
}

/// Receiver of snapshot updates, called in the order changes were observed.
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, update: &SnapshotUpdate);
}

impl SnapshotSink for mpsc::UnboundedSender<SnapshotUpdate> {
    fn publish(&self, update: &SnapshotUpdate) {
        if self.send(update.clone()).is_err() {
            trace!(sequence = update.sequence, "snapshot receiver dropped");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorOptions {
    pub snapshot: SnapshotOptions,
    pub actions: ActionOptions,
}

impl DetectorOptions {
    pub fn agent() -> Self {
        Self {
            snapshot: SnapshotOptions::agent(),
            actions: ActionOptions::default(),
        }
    }
}

struct DetectorState {
    snapshot: Snapshot,
    catalog: ActionCatalog,
    sequence: u64,
}

struct DetectorShared {
    document: Document,
    scope: NodeRef,
    engine: SnapshotEngine,
    actions: ActionOptions,
    observer: MutationObserver,
    sink: Arc<dyn SnapshotSink>,
    scheduler: Scheduler,
    /// Held for a whole pass, from snapshot to publish.
    pass: Mutex<()>,
    state: Mutex<DetectorState>,
}

/// Handle to a running change detector. Cloning shares the same detector.
#[derive(Clone)]
pub struct ChangeDetector {
    shared: Arc<DetectorShared>,
}

impl ChangeDetector {
    /// Take and publish the initial snapshot of `scope` (the document body
    /// when `None`), then follow mutations until [`ChangeDetector::stop`].
    pub fn start(
        document: Document,
        scope: Option<NodeRef>,
        options: DetectorOptions,
        sink: Arc<dyn SnapshotSink>,
        scheduler: Scheduler,
    ) -> Result<Self, SnapError> {
        let engine = SnapshotEngine::new(options.snapshot)?;
        let scope = scope
            .or_else(|| document.body())
            .unwrap_or_else(|| document.document_element());

        let (observer, mut stream) = MutationObserver::new();
        observer.observe(&scope, ObserveOptions::all());

        let snapshot = engine.snapshot(&scope, &IdentityMap::new());
        let catalog = build_catalog(&document, &snapshot.identities, &options.actions, &scheduler);
        let initial = SnapshotUpdate {
            html: snapshot.html.clone(),
            catalog: catalog.clone(),
            sequence: 0,
        };

        let shared = Arc::new(DetectorShared {
            document,
            scope,
            engine,
            actions: options.actions,
            observer,
            sink,
            scheduler: scheduler.clone(),
            pass: Mutex::new(()),
            state: Mutex::new(DetectorState {
                snapshot,
                catalog,
                sequence: 0,
            }),
        });
        shared.observe_frames();

        info!(
            url = %shared.document.url(),
            bytes = initial.html.len(),
            "change detector started"
        );
        shared.sink.publish(&initial);

        let worker = shared.clone();
        scheduler.spawn(async move {
            while let Some(batch) = stream.next_batch().await {
                worker.handle_batch(&batch);
            }
            debug!("mutation stream closed");
        });

        Ok(Self { shared })
    }

    pub fn current_snapshot(&self) -> Snapshot {
        self.shared.state().snapshot.clone()
    }

    pub fn html(&self) -> String {
        self.shared.state().snapshot.html.clone()
    }

    /// The catalog for the current snapshot. Fetch it again after any await
    /// point; a new snapshot replaces it.
    pub fn catalog(&self) -> ActionCatalog {
        self.shared.state().catalog.clone()
    }

    pub fn identities(&self) -> IdentityMap {
        self.shared.state().snapshot.identities.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.shared.state().sequence
    }

    pub fn document(&self) -> &Document {
        &self.shared.document
    }

    /// Re-snapshot now, e.g. after changes that are not tree mutations such
    /// as edits of the `value` property. Returns whether an update was
    /// published.
    pub fn refresh(&self) -> bool {
        self.shared.resnapshot()
    }

    /// Disconnect every observer and cancel outstanding tasks and timers.
    pub fn stop(&self) {
        self.shared.observer.disconnect();
        self.shared.scheduler.stop();
        info!(url = %self.shared.document.url(), "change detector stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.scheduler.is_stopped()
    }
}

impl DetectorShared {
    fn state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_batch(&self, batch: &[MutationRecord]) {
        if self.scheduler.is_stopped() {
            return;
        }
        let structural = batch.iter().any(|record| {
            matches!(record.kind, MutationKind::ChildList | MutationKind::FrameLoaded)
        });
        trace!(records = batch.len(), structural, "mutation batch");
        if structural {
            self.observe_frames();
        }
        self.resnapshot();
    }

    /// Observe the documents of every reachable same-origin frame, including
    /// frames nested inside them. Already observed documents are skipped.
    fn observe_frames(&self) {
        if !self.engine.options().inline_same_origin_frames {
            return;
        }
        let origin = self.document.origin();
        let mut pending = vec![self.scope.clone()];
        while let Some(root) = pending.pop() {
            for frame in root.elements_by_tag("iframe") {
                if !frame.is_same_origin_frame(&origin) {
                    continue;
                }
                let Ok(Some(inner)) = frame.content_document() else {
                    continue;
                };
                let inner_root = inner.document_element();
                if !self.observer.is_observing(&inner_root) {
                    debug!(src = ?frame.src(), "observing frame document");
                    self.observer.observe(&inner_root, ObserveOptions::all());
                }
                pending.push(inner_root);
            }
        }
    }

    /// One snapshot pass. Passes never overlap, so sequence numbers and the
    /// published HTML follow the order in which passes started. Sinks must
    /// not call back into the detector from `publish`.
    fn resnapshot(&self) -> bool {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.state().snapshot.identities.clone();
        let snapshot = self.engine.snapshot(&self.scope, &previous);

        let update = {
            let mut state = self.state();
            if snapshot.html == state.snapshot.html {
                trace!("snapshot unchanged");
                return false;
            }
            let catalog = build_catalog(
                &self.document,
                &snapshot.identities,
                &self.actions,
                &self.scheduler,
            );
            state.sequence += 1;
            state.snapshot = snapshot;
            state.catalog = catalog.clone();
            SnapshotUpdate {
                html: state.snapshot.html.clone(),
                catalog,
                sequence: state.sequence,
            }
        };

        debug!(
            sequence = update.sequence,
            bytes = update.html.len(),
            actions = update.catalog.len(),
            "publishing snapshot"
        );
        self.sink.publish(&update);
        true
    }
}
