use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use portal_camera::illumination::Lamp;
use portal_camera::{open_driver, MediaServer};
use portal_common::config::Config;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let driver = match open_driver(&config.camera) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "camera init failed");
            std::process::exit(1);
        }
    };

    let mut server = MediaServer::new(driver, &config.server);
    match Lamp::from_config(&config.illumination) {
        Ok(Some(lamp)) => {
            server = server.with_lamp(lamp, Duration::from_millis(config.illumination.flash_ms));
        }
        Ok(None) => info!("no illumination configured"),
        Err(e) => warn!(error = %e, "illumination unavailable, running without lamp"),
    }

    let server = Arc::new(server);
    let running = server.start(&config.server.bind, config.server.port).await;
    if running.still_addr().is_none() && running.stream_addr().is_none() {
        error!("no listener could be started");
    }
    info!(
        still = ?running.still_addr(),
        stream = ?running.stream_addr(),
        "portal camera server running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    running.shutdown().await;
}
