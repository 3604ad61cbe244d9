//! Context-side connection to a multi-context relay.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detector::{ChangeDetector, DetectorOptions, SnapshotSink, SnapshotUpdate};
use crate::dom::Document;
use crate::errors::SnapError;
use crate::protocol::{ContextMessage, RelayMessage};
use crate::scheduler::Scheduler;

/// Publishes snapshots of one context to the relay.
struct RelaySink {
    context_id: String,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl SnapshotSink for RelaySink {
    fn publish(&self, update: &SnapshotUpdate) {
        let message = ContextMessage::Snapshot {
            context_id: self.context_id.clone(),
            html: update.html.clone(),
            fns: update.catalog.specs(),
        };
        send(&self.outgoing, &message);
    }
}

fn send(outgoing: &mpsc::UnboundedSender<Message>, message: &ContextMessage) {
    match message.to_text() {
        Ok(text) => {
            if outgoing.send(Message::Text(text)).is_err() {
                debug!("relay writer is gone, dropping message");
            }
        }
        Err(e) => error!("Failed to encode relay message: {}", e),
    }
}

/// A document connected to a relay: its snapshots are pushed as they change
/// and commands from the relay run against its current catalog.
pub struct RelayClient {
    context_id: String,
    detector: ChangeDetector,
    outgoing: mpsc::UnboundedSender<Message>,
    scheduler: Scheduler,
}

impl RelayClient {
    pub async fn connect(
        url: &str,
        document: Document,
        options: DetectorOptions,
        scheduler: Scheduler,
    ) -> Result<Self, SnapError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SnapError::Transport(format!("failed to connect to relay at {url}: {e}")))?;
        let context_id = Uuid::new_v4().to_string();
        info!(%url, %context_id, "connected to relay");

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: drains queued frames, closes the socket on stop.
        let token = scheduler.cancellation_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            error!("Relay client send error: {}", e);
                            break;
                        }
                    }
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("relay writer task ended");
        });

        let relay_sink = Arc::new(RelaySink {
            context_id: context_id.clone(),
            outgoing: tx.clone(),
        });
        let detector =
            ChangeDetector::start(document, None, options, relay_sink, scheduler.clone())?;

        // Reader task: runs each command against the catalog current at
        // the time it arrives.
        let reader_detector = detector.clone();
        let reader_tx = tx.clone();
        let reader_cid = context_id.clone();
        let reader_scheduler = scheduler.clone();
        scheduler.spawn(async move {
            while let Some(frame) = stream.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                };
                if !msg.is_text() {
                    continue;
                }
                let text = msg.into_text().unwrap_or_default();
                let RelayMessage::Command {
                    name,
                    args,
                    invocation_id,
                } = match RelayMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "ignoring invalid relay frame");
                        continue;
                    }
                };
                debug!(action = %name, %invocation_id, "command from relay");

                let detector = reader_detector.clone();
                let outgoing = reader_tx.clone();
                let context_id = reader_cid.clone();
                reader_scheduler.spawn(async move {
                    let output = detector.catalog().invoke(&name, args).await;
                    detector.refresh();
                    let reply =
                        ContextMessage::command_result(Some(context_id), invocation_id, &output);
                    send(&outgoing, &reply);
                });
            }
            info!("relay connection closed");
        });

        Ok(Self {
            context_id,
            detector,
            outgoing: tx,
            scheduler,
        })
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Tell the relay whether this context is hidden. A context that becomes
    /// visible takes control.
    pub fn report_visibility(&self, hidden: bool) -> Result<(), SnapError> {
        let text = ContextMessage::Visibility {
            context_id: self.context_id.clone(),
            hidden,
        }
        .to_text()?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| SnapError::ContextDisconnected(self.context_id.clone()))
    }

    /// Stop the detector and every task of this client, closing the socket.
    pub fn stop(&self) {
        self.detector.stop();
        self.scheduler.stop();
        info!(context_id = %self.context_id, "relay client stopped");
    }
}
