use std::env;
use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Error};
use tracing::{info, trace, warn};

use worlds_album::album::{Album, init_config, init_logging};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_dir = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config_manager = init_config(&config_dir).context("failed to load configuration")?;
    let config = config_manager.get_app_config();
    let paths = config_manager.resolved_paths();

    let _log_guard = init_logging(&config.logging, &paths.log_directory)
        .context("failed to initialize logging")?;
    log_system_information();

    let album = Album::from_config(&config, config_manager.config_dir())
        .context("failed to build metadata client")?;
    let stats = album.stats();
    info!(
        worlds = stats.worlds,
        images = stats.images,
        worlds_dir = %paths.worlds_directory.display(),
        "Album loaded"
    );

    album.start_scan_async();
    let periodic = album.start_periodic(Duration::from_secs(config.scan.interval_secs.max(1)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    periodic.abort();
    if album.pending_fetches() > 0 {
        warn!(pending = album.pending_fetches(), "Shutting down with metadata fetches pending");
    }
    info!("Shutting down");
    Ok(())
}

/// Logs information about the host for debugging.
fn log_system_information() {
    trace!(arch = ARCH, family = FAMILY, os = OS, version = env!("CARGO_PKG_VERSION"), "System information");
}
