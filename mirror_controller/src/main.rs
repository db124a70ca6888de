use std::{path::PathBuf, time::Duration};

use mirror_controller::{
    config::{create_default_config, init_config},
    controller_service::{create_dispatcher, run_event_logger},
    logging,
    state_monitor::run_interlock_monitor,
};
use tracing::info;

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if should_create_config() {
        let path = create_default_config(None::<PathBuf>)?;
        eprintln!("Wrote default configuration to {}", path.display());
    }

    let (config_manager, config) = init_config().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;

    let _guard = logging::init(&config.logging)?;
    info!(path = %config_manager.path().display(), "Configuration loaded");

    let dispatcher = create_dispatcher(&config).await?;

    let event_logger = tokio::spawn(run_event_logger(
        dispatcher.subscribe(),
        config.logging.log_status_changes,
    ));
    let interlock_monitor = tokio::spawn(run_interlock_monitor(
        dispatcher.clone(),
        Duration::from_millis(config.motion.interlock_check_ms),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    interlock_monitor.abort();
    dispatcher.shutdown().await;
    event_logger.abort();
    Ok(())
}
