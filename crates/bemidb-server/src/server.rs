//! TCP accept loop: one independently scheduled task per connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use bemidb_core::Config;
use bemidb_lake::{local_lake_store, LakeReader};
use pgwire::tokio::process_socket;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::engine::QueryEngine;
use crate::handler::BemiHandlerFactory;

/// Serve the wire protocol until the task is dropped.
pub async fn serve(config: Arc<Config>) -> Result<()> {
    let store = local_lake_store(&config.storage_path)?;
    let engine = Arc::new(QueryEngine::new(config.clone(), LakeReader::new(store)));
    let factory = BemiHandlerFactory::new(engine, config.clone());

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("bind {}:{}", config.host, config.port))?;
    info!(host = %config.host, port = config.port, "accepting postgres connections");

    loop {
        let (socket, peer) = listener.accept().await.context("accept")?;
        let factory = factory.clone();
        tokio::spawn(async move {
            debug!(%peer, "session opened");
            if let Err(e) = process_socket(socket, None, factory).await {
                warn!(%peer, error = %e, "session ended with error");
            } else {
                debug!(%peer, "session closed");
            }
        });
    }
}
