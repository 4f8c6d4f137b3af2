//! succinct-relay — standalone relay server.
//!
//! Listens on `$SUCCINCT_RELAY_ADDR` (default `0.0.0.0:8080`).

use anyhow::{Context, Result};

use succinct_relay::{app, RelayState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("SUCCINCT_RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "succinct-relay listening");

    axum::serve(listener, app(RelayState::new()))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        })
        .await
        .context("relay server failed")
}
