//! WebSocket listener for contexts.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RelayError;
use crate::registry::ConnectionHandle;
use crate::relay::Relay;

pub async fn bind(addr: &str) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Accept context connections until `shutdown` fires. Connections already
/// open keep running until their peer goes away.
pub async fn serve_contexts(listener: TcpListener, relay: Arc<Relay>, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("context listener on ws://{}", addr),
        Err(e) => warn!("context listener address unknown: {}", e),
    }

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!("ws accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        debug!(%peer, "context connecting");
        let relay = relay.clone();
        tokio::spawn(handle_connection(stream, relay));
    }
    info!("context listener stopped");
}

async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) {
    let ws_stream = match accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!("ws handshake error: {}", e);
            return;
        }
    };
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = ConnectionHandle::new(tx);

    // writer task
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("ws send error: {}", e);
                break;
            }
        }
    });

    // reader loop
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = connection.id, "ws read error: {}", e);
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let text = msg.into_text().unwrap_or_default();
        relay.handle_text(&connection, &text).await;
    }

    relay.handle_disconnect(&connection);
    writer.abort();
    debug!(connection = connection.id, "context connection closed");
}
