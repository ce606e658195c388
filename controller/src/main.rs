mod controller;
mod decision;
mod gate;
mod sensor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use portal_camera::illumination::Lamp;
use portal_camera::{open_driver, MediaServer};
use portal_common::config::Config;
use tracing::{error, info, warn};

use crate::controller::Controller;
use crate::decision::DecisionClient;
use crate::gate::{ServoGate, SysfsPwm};
use crate::sensor::{HallSensor, IioInput};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),
    #[error("camera error: {0}")]
    Camera(#[from] portal_camera::CaptureError),
    #[error("hall sensor unavailable: {0}")]
    Sensor(std::io::Error),
    #[error("gate servo unavailable: {0}")]
    Gate(std::io::Error),
}

struct Args {
    config_path: PathBuf,
    text: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Args {
    let mut config_path = None;
    let mut text = None;
    while let Some(arg) = args.next() {
        if arg == "--text" {
            text = args.next();
        } else if config_path.is_none() {
            config_path = Some(PathBuf::from(arg));
        }
    }
    Args {
        config_path: config_path.unwrap_or_else(|| PathBuf::from("config.toml")),
        text,
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args(std::env::args().skip(1));

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", args.config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(api = config.api.base_url, "starting portal controller");

    if let Err(e) = run(config, args.text).await {
        error!(error = %e, "portal controller failed");
        std::process::exit(1);
    }
}

async fn run(config: Config, text: Option<String>) -> Result<(), ControllerError> {
    let driver = open_driver(&config.camera)?;

    let mut server = MediaServer::new(driver, &config.server);
    match Lamp::from_config(&config.illumination) {
        Ok(Some(lamp)) => {
            server = server.with_lamp(lamp, Duration::from_millis(config.illumination.flash_ms));
        }
        Ok(None) => info!("no illumination configured"),
        Err(e) => warn!(error = %e, "illumination unavailable, running without lamp"),
    }
    let server = Arc::new(server);

    let sensor = HallSensor::new(
        IioInput::open(&config.sensor.input).map_err(ControllerError::Sensor)?,
        config.sensor.threshold,
    )
    .map_err(ControllerError::Sensor)?;
    let pwm = SysfsPwm::open(&config.gate.pwm).map_err(ControllerError::Gate)?;
    let gate = ServoGate::new(pwm, &config.gate)
        .await
        .map_err(ControllerError::Gate)?;
    let client = DecisionClient::new(&config.api)?;

    let mut controller = Controller::new(Arc::clone(&server), sensor, gate, client, &config);

    if let Some(text) = text {
        let outcome = controller.handle_text(&text).await;
        info!(?outcome, "text submission finished");
        return Ok(());
    }

    let running = server.start(&config.server.bind, config.server.port).await;
    info!(
        still = ?running.still_addr(),
        stream = ?running.stream_addr(),
        "camera endpoints running"
    );

    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    info!("shutting down");
    running.shutdown().await;
    Ok(())
}
