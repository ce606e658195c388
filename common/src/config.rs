use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::PixelFormat;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub illumination: IlluminationConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Synthetic test pattern, no hardware required.
    Simulated,
    /// Video4Linux2 device (requires the `v4l2` feature of portal-camera).
    V4l2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_backend")]
    pub backend: CameraBackend,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Quality the sensor itself compresses with when `pixel_format` is jpeg.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
    #[serde(default = "default_vflip")]
    pub vflip: bool,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Still capture listens here, the stream on `port + 1`.
    #[serde(default = "default_port")]
    pub port: u16,
    /// JPEG quality used when a native frame has to be re-encoded.
    #[serde(default = "default_stream_quality")]
    pub stream_quality: u8,
    #[serde(default = "default_filter_samples")]
    pub filter_samples: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IlluminationConfig {
    /// Name under /sys/class/leds. No lamp is driven when unset.
    #[serde(default)]
    pub led: Option<String>,
    #[serde(default = "default_duty")]
    pub duty: u8,
    #[serde(default = "default_max_streaming_duty")]
    pub max_streaming_duty: u8,
    #[serde(default = "default_flash_ms")]
    pub flash_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_input")]
    pub input: PathBuf,
    #[serde(default = "default_sensor_threshold")]
    pub threshold: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_pwm")]
    pub pwm: PathBuf,
    #[serde(default = "default_open_angle")]
    pub open_angle: u8,
    #[serde(default = "default_closed_angle")]
    pub closed_angle: u8,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_hold_open_secs")]
    pub hold_open_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            device: default_device(),
            pixel_format: default_pixel_format(),
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
            buffer_count: default_buffer_count(),
            vflip: default_vflip(),
            fps: default_fps(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            stream_quality: default_stream_quality(),
            filter_samples: default_filter_samples(),
        }
    }
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            led: None,
            duty: default_duty(),
            max_streaming_duty: default_max_streaming_duty(),
            flash_ms: default_flash_ms(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            input: default_sensor_input(),
            threshold: default_sensor_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            pwm: default_pwm(),
            open_angle: default_open_angle(),
            closed_angle: default_closed_angle(),
            settle_ms: default_settle_ms(),
            hold_open_secs: default_hold_open_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        if self.server.port == u16::MAX {
            return Err(ConfigError::Invalid(
                "server.port leaves no room for the stream listener on port + 1".into(),
            ));
        }
        if !(1..=100).contains(&self.server.stream_quality) {
            return Err(ConfigError::Invalid(format!(
                "server.stream_quality must be within 1..=100, got {}",
                self.server.stream_quality
            )));
        }
        if self.gate.open_angle > 180 || self.gate.closed_angle > 180 {
            return Err(ConfigError::Invalid("gate angles must be within 0..=180".into()));
        }
        Ok(())
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "camera.buffer_count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "camera resolution {}x{} is empty",
                self.width, self.height
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.fps == 0 {
            return Err(ConfigError::Invalid("camera.fps must be non-zero".into()));
        }
        if self.pixel_format == PixelFormat::Yuyv && self.width % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "yuyv needs an even width, got {}",
                self.width
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_backend() -> CameraBackend {
    CameraBackend::Simulated
}
fn default_device() -> String {
    "/dev/video0".into()
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Jpeg
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_jpeg_quality() -> u8 {
    88
}
fn default_buffer_count() -> u32 {
    2
}
fn default_vflip() -> bool {
    true
}
fn default_fps() -> u32 {
    15
}
fn default_acquire_timeout_ms() -> u64 {
    4000
}
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    80
}
fn default_stream_quality() -> u8 {
    80
}
fn default_filter_samples() -> usize {
    20
}
fn default_duty() -> u8 {
    255
}
fn default_max_streaming_duty() -> u8 {
    255
}
fn default_flash_ms() -> u64 {
    150
}
fn default_api_timeout() -> u64 {
    10
}
fn default_sensor_input() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage0_raw")
}
fn default_sensor_threshold() -> u16 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_pwm() -> PathBuf {
    PathBuf::from("/sys/class/pwm/pwmchip0/pwm0")
}
fn default_open_angle() -> u8 {
    80
}
fn default_closed_angle() -> u8 {
    10
}
fn default_settle_ms() -> u64 {
    500
}
fn default_hold_open_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}
