use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use portal_camera::MediaServer;
use portal_common::config::Config;
use tracing::{error, info, warn};

use crate::decision::DecisionClient;
use crate::gate::{PwmOutput, ServoGate};
use crate::sensor::{AnalogInput, HallSensor};

/// How one access attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Granted,
    Denied,
    CaptureFailed,
    SubmitFailed,
}

/// Ties the trigger sensor, camera, decision service and gate together.
pub struct Controller<I, P> {
    server: Arc<MediaServer>,
    sensor: HallSensor<I>,
    gate: ServoGate<P>,
    client: DecisionClient,
    poll_interval: Duration,
    hold_open: Duration,
}

impl<I: AnalogInput, P: PwmOutput> Controller<I, P> {
    pub fn new(
        server: Arc<MediaServer>,
        sensor: HallSensor<I>,
        gate: ServoGate<P>,
        client: DecisionClient,
        config: &Config,
    ) -> Self {
        Self {
            server,
            sensor,
            gate,
            client,
            poll_interval: Duration::from_millis(config.sensor.poll_interval_ms),
            hold_open: Duration::from_secs(config.gate.hold_open_secs),
        }
    }

    /// Poll the sensor until `shutdown` resolves, handling each arrival.
    ///
    /// Shutdown also cuts short an access attempt in progress; the gate is
    /// driven closed before returning.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            baseline = self.sensor.baseline(),
            "control loop running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let outcome = tokio::select! {
                        outcome = self.poll() => outcome,
                        _ = &mut shutdown => {
                            warn!("shutdown during access attempt, closing gate");
                            if let Err(e) = self.gate.close().await {
                                error!(error = %e, "failed to close gate");
                            }
                            break;
                        }
                    };
                    if let Some(outcome) = outcome {
                        info!(?outcome, still_present = self.sensor.active(), "access attempt finished");
                    }
                }
            }
        }
        info!("control loop stopped");
    }

    /// One sensor reading; handles an arrival if this reading starts one.
    pub async fn poll(&mut self) -> Option<Outcome> {
        if let Err(e) = self.sensor.update() {
            warn!(error = %e, "hall sensor read failed");
            return None;
        }
        if !self.sensor.event() {
            return None;
        }
        Some(self.handle_arrival().await)
    }

    /// Photograph whoever triggered the sensor and act on the verdict.
    pub async fn handle_arrival(&mut self) -> Outcome {
        let server = Arc::clone(&self.server);
        let jpeg = match tokio::task::spawn_blocking(move || server.capture_jpeg()).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                error!(error = %e, "camera capture failed");
                return Outcome::CaptureFailed;
            }
            Err(e) => {
                error!(error = %e, "spawn_blocking failed");
                return Outcome::CaptureFailed;
            }
        };

        if !self.client.submit_image(jpeg).await {
            return Outcome::SubmitFailed;
        }
        self.decide().await
    }

    /// Submit operator-entered text instead of a photo.
    pub async fn handle_text(&mut self, text: &str) -> Outcome {
        if !self.client.submit_text(text).await {
            return Outcome::SubmitFailed;
        }
        self.decide().await
    }

    async fn decide(&mut self) -> Outcome {
        if !self.client.fetch_verdict().await {
            info!("access denied");
            return Outcome::Denied;
        }

        info!("access granted");
        if let Err(e) = self.gate.open().await {
            error!(error = %e, "failed to open gate");
            return Outcome::Granted;
        }
        tokio::time::sleep(self.hold_open).await;
        if let Err(e) = self.gate.close().await {
            error!(error = %e, "failed to close gate");
        }
        Outcome::Granted
    }
}
