//! cloudchat - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the chat agent API.

use std::sync::Arc;

use cloudchat::{api, config::Config, mcp::McpSession, session::SessionRegistry};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudchat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: model={}", config.model);

    // Restore persisted conversations
    let registry = Arc::new(SessionRegistry::restore(config.history_file.clone()).await);

    // Connect the tool session. A failure is tolerated: the server still
    // answers, and chat requests report 503 until it comes back.
    let mcp = match McpSession::connect(&config).await {
        Ok(session) => Some(Arc::new(session)),
        Err(e) => {
            warn!("tool session initialization failed ({}), serving degraded", e);
            None
        }
    };

    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config, registry, mcp).await?;

    Ok(())
}
