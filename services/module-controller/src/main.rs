//! Module controller binary.
//!
//! Loads configuration from the environment, then runs the controller until
//! interrupted. Stores are in-memory until an object store backend is wired in.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use extmod_controller::{Config, Controller, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        modules_dir = ?config.modules_dir,
        workers = config.workers,
        restart_pid = config.restart_pid,
        "Starting module controller"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(config, Stores::in_memory());

    let mut handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut handle => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            handle.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Module controller failed");
            return Err(e.into());
        }
        Err(e) => {
            error!(error = %e, "Module controller task panicked");
            return Err(e.into());
        }
    }

    info!("Module controller shutdown complete");
    Ok(())
}
