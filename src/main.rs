//! runforge server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use runforge::config::RuntimeConfig;
use runforge::server;
use runforge::session::SessionStore;
use runforge::source::DirectorySource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::default();
    tokio::fs::create_dir_all(&config.sessions_dir)
        .await
        .context("sessions directory cannot be created")?;

    let connector = config.backend.connector();
    let store = Arc::new(SessionStore::new(&config, connector));
    let systems_root =
        std::env::var("RUNFORGE_SYSTEMS_PATH").unwrap_or_else(|_| "systems".to_string());
    let source = Arc::new(DirectorySource::new(systems_root));

    let address = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind '{address}'"))?;
    info!("runforge {} listening on {address}", runforge::config::VERSION);
    axum::serve(listener, server::router(store, source))
        .await
        .context("server terminated")?;
    Ok(())
}
