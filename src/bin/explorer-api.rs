//! Read-only HTTP query server over the configured explorer database.
use anyhow::Context;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use ledger_explorer::api::{http, ExplorerApi};
use ledger_explorer::config::ExplorerConfig;
use ledger_explorer::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = ExplorerConfig::from_env()?;
    logging::init(config.log_format, LevelFilter::INFO)?;

    let database = config.database.open()?;
    database
        .connect()
        .await
        .with_context(|| format!("connect to {}", config.database))?;

    let channels: Vec<String> = config.channels.iter().map(|c| c.name.clone()).collect();
    database
        .setup(&channels)
        .await
        .context("prepare explorer database")?;

    let api = Arc::new(ExplorerApi::new(Arc::clone(&database)));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    };

    let served = http::serve(&config.api_bind, api, shutdown).await;
    database.disconnect().await;
    served
}
