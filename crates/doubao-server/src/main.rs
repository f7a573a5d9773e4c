//! doubao-relay: OpenAI-compatible front end for the doubao chat service.
//!
//! Startup order matters: the signing browser must be up and parked on
//! the chat page before the HTTP surface accepts its first request.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use doubao_chat::ChatRelay;
use doubao_core::RelayConfig;
use doubao_signer::BrowserSigner;

mod routes;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let port = config.port;

    // One browser for the process lifetime, primed with the first
    // credential. Launch failure is fatal: nothing can be signed.
    let signer = Arc::new(
        BrowserSigner::launch(
            config.fingerprint.clone(),
            config
                .cookies
                .first()
                .map(String::as_str)
                .unwrap_or_default(),
            config.chrome_debug_port,
            config.headless,
        )
        .await?,
    );

    let relay = Arc::new(ChatRelay::new(config, signer.clone())?);
    let state = Arc::new(AppState::new(relay));
    let app = routes::build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    signer.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("shutdown signal error: {e}");
    }
    tracing::info!("shutting down");
}
