use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use portal_common::config::GateConfig;
use tracing::{info, warn};

const PERIOD: Duration = Duration::from_millis(20);
const MIN_PULSE_US: u64 = 500;
const MAX_PULSE_US: u64 = 2500;

/// One PWM channel. `None` stops the output so the servo goes limp.
pub trait PwmOutput: Send {
    fn set_pulse(&mut self, pulse: Option<Duration>) -> io::Result<()>;
}

/// PWM channel under `/sys/class/pwm/pwmchipN/pwmM`, run at 50 Hz.
#[derive(Debug)]
pub struct SysfsPwm {
    dir: PathBuf,
}

impl SysfsPwm {
    /// Open an already exported channel and set its period.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let pwm = Self {
            dir: dir.to_path_buf(),
        };
        pwm.write("enable", "0")?;
        pwm.write("period", &PERIOD.as_nanos().to_string())?;
        Ok(pwm)
    }

    fn write(&self, attr: &str, value: &str) -> io::Result<()> {
        std::fs::write(self.dir.join(attr), value)
    }
}

impl PwmOutput for SysfsPwm {
    fn set_pulse(&mut self, pulse: Option<Duration>) -> io::Result<()> {
        match pulse {
            Some(width) => {
                self.write("duty_cycle", &width.as_nanos().to_string())?;
                self.write("enable", "1")
            }
            None => self.write("enable", "0"),
        }
    }
}

/// Pulse width for a hobby servo angle, 500 µs at 0° to 2500 µs at 180°.
pub fn pulse_for_angle(angle: u8) -> Duration {
    let angle = u64::from(angle.min(180));
    Duration::from_micros(MIN_PULSE_US + (MAX_PULSE_US - MIN_PULSE_US) * angle / 180)
}

/// Servo-driven barrier.
///
/// Every move drives the servo, waits for it to settle, then detaches so it
/// does not hum or heat while holding position.
pub struct ServoGate<P> {
    pwm: P,
    open_angle: u8,
    closed_angle: u8,
    settle: Duration,
}

impl<P: PwmOutput> ServoGate<P> {
    /// Take over the servo and drive the gate closed.
    pub async fn new(pwm: P, config: &GateConfig) -> io::Result<Self> {
        let mut gate = Self {
            pwm,
            open_angle: config.open_angle,
            closed_angle: config.closed_angle,
            settle: Duration::from_millis(config.settle_ms),
        };
        gate.close().await?;
        Ok(gate)
    }

    pub async fn open(&mut self) -> io::Result<()> {
        info!(angle = self.open_angle, "opening gate");
        self.move_to(self.open_angle).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        info!(angle = self.closed_angle, "closing gate");
        self.move_to(self.closed_angle).await
    }

    async fn move_to(&mut self, angle: u8) -> io::Result<()> {
        self.pwm.set_pulse(Some(pulse_for_angle(angle)))?;
        tokio::time::sleep(self.settle).await;
        if let Err(e) = self.pwm.set_pulse(None) {
            warn!(error = %e, "failed to detach servo");
        }
        Ok(())
    }
}
