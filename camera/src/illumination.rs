use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portal_common::config::IlluminationConfig;
use tracing::{debug, info, warn};

/// A dimmable light source next to the lens.
pub trait LedOutput: Send + Sync {
    /// Set the brightness, 0 (off) to 255 (full).
    fn set_duty(&self, duty: u8) -> io::Result<()>;
}

/// LED exposed by the kernel under `/sys/class/leds/<name>`.
#[derive(Debug)]
pub struct SysfsLed {
    brightness: PathBuf,
    max_brightness: u32,
}

impl SysfsLed {
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_at(&Path::new("/sys/class/leds").join(name))
    }

    pub fn open_at(dir: &Path) -> io::Result<Self> {
        let max_brightness = std::fs::read_to_string(dir.join("max_brightness"))?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            brightness: dir.join("brightness"),
            max_brightness,
        })
    }
}

impl LedOutput for SysfsLed {
    fn set_duty(&self, duty: u8) -> io::Result<()> {
        let level = u32::from(duty) * self.max_brightness / 255;
        std::fs::write(&self.brightness, level.to_string())
    }
}

/// Illumination around capture.
///
/// While at least one stream is in continuous mode the duty is capped at
/// `max_streaming_duty` to bound heat and power draw. Single captures are
/// not capped.
///
/// Who is using the lamp and the duty written for it change together under
/// one lock, so the last user to leave always has the final write.
pub struct Lamp {
    output: Arc<dyn LedOutput>,
    duty: u8,
    max_streaming_duty: u8,
    users: Mutex<LampUsers>,
}

#[derive(Debug, Default)]
struct LampUsers {
    streams: usize,
    flashes: usize,
}

impl Lamp {
    pub fn new(output: Arc<dyn LedOutput>, duty: u8, max_streaming_duty: u8) -> Self {
        Self {
            output,
            duty,
            max_streaming_duty,
            users: Mutex::new(LampUsers::default()),
        }
    }

    /// Build the lamp named in config; `Ok(None)` when no LED is configured.
    pub fn from_config(config: &IlluminationConfig) -> io::Result<Option<Self>> {
        let Some(name) = config.led.as_deref() else {
            return Ok(None);
        };
        let led = SysfsLed::open(name)?;
        info!(led = name, duty = config.duty, max_streaming_duty = config.max_streaming_duty, "illumination ready");
        Ok(Some(Self::new(
            Arc::new(led),
            config.duty,
            config.max_streaming_duty,
        )))
    }

    pub fn is_continuous(&self) -> bool {
        self.lock().streams > 0
    }

    fn lock(&self) -> MutexGuard<'_, LampUsers> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the users and write the matching duty without releasing the lock.
    fn update(&self, change: impl FnOnce(&mut LampUsers)) {
        let mut users = self.lock();
        change(&mut users);
        let duty = if users.streams > 0 {
            self.duty.min(self.max_streaming_duty)
        } else if users.flashes > 0 {
            self.duty
        } else {
            0
        };
        debug!(duty, streams = users.streams, flashes = users.flashes, "lamp");
        if let Err(e) = self.output.set_duty(duty) {
            warn!(error = %e, duty, "failed to set lamp duty");
        }
    }

    /// Enter continuous mode and light the lamp until the guard drops.
    pub fn continuous(&self) -> ContinuousMode<'_> {
        self.update(|u| u.streams += 1);
        ContinuousMode { lamp: self }
    }

    /// Light the lamp for one capture. On drop the lamp returns to whatever
    /// the remaining users call for.
    pub fn flash(&self) -> Flash<'_> {
        self.update(|u| u.flashes += 1);
        Flash { lamp: self }
    }
}

#[must_use = "continuous mode ends when the guard is dropped"]
pub struct ContinuousMode<'a> {
    lamp: &'a Lamp,
}

impl Drop for ContinuousMode<'_> {
    fn drop(&mut self) {
        self.lamp.update(|u| u.streams = u.streams.saturating_sub(1));
    }
}

#[must_use = "the flash ends when the guard is dropped"]
pub struct Flash<'a> {
    lamp: &'a Lamp,
}

impl Drop for Flash<'_> {
    fn drop(&mut self) {
        self.lamp.update(|u| u.flashes = u.flashes.saturating_sub(1));
    }
}
