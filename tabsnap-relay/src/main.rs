use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tabsnap_relay::logging::init_logging;
use tabsnap_relay::{api, websocket, Relay, RelayArgs};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = RelayArgs::parse();

    init_logging(args.log_level)?;

    tracing::info!("Starting tabsnap relay v{}", env!("CARGO_PKG_VERSION"));

    let relay = Arc::new(Relay::new(args.relay_options()));
    let shutdown = CancellationToken::new();

    let ws_listener = websocket::bind(&args.ws_addr).await?;
    let contexts = tokio::spawn(websocket::serve_contexts(
        ws_listener,
        relay.clone(),
        shutdown.clone(),
    ));

    let http_addr = args.http_addr()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!("HTTP API on http://{}", http_addr);
    println!("Contexts connect to: ws://{}/", args.ws_addr);
    println!("Health check available at: http://{}/healthz", http_addr);
    println!("Press Ctrl+C to stop");

    let http_shutdown = shutdown.clone();
    axum::serve(http_listener, api::router(relay))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            http_shutdown.cancel();
        })
        .await?;

    contexts.await?;
    tracing::info!("Shutting down relay");
    Ok(())
}
