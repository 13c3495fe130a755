//! Serve command implementation

use crate::config::Config;
use crate::db::Repository;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::server::{self, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the webhook server until ctrl-c
pub async fn cmd_serve(config: Config, db: Repository) -> Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let pipeline = Arc::new(Pipeline::from_config(
        config.clone(),
        db.clone(),
        shutdown.clone(),
    )?);
    let state = AppState::new(config, db, pipeline);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Cannot listen for ctrl-c: {}", e),
        }
        signal.cancel();
    });

    server::serve(state, shutdown).await
}
