use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use portal_common::config::CameraConfig;
use portal_common::frame::{Frame, PixelFormat};
use tracing::trace;

use crate::driver::{CaptureDriver, CaptureError, FramePool};
use crate::encode::jpeg_from_rgb;

const BAR_WIDTH: u32 = 16;
const BAR_STEP: u64 = 8;

/// Camera stand-in that renders a moving test pattern.
///
/// Frames come out at the configured rate in the configured pixel format,
/// through the same bounded buffer pool a real sensor would have. The
/// pattern is a colour gradient with a white bar sweeping left to right, so
/// a live viewer can tell frames apart.
#[derive(Debug)]
pub struct SimulatedCamera {
    format: PixelFormat,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    vflip: bool,
    interval: Duration,
    pool: FramePool,
    seq: AtomicU64,
    next_due: Mutex<Instant>,
    fail_after: Option<u64>,
}

impl SimulatedCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CaptureError> {
        config
            .validate()
            .map_err(|e| CaptureError::Init(e.to_string()))?;
        Ok(Self {
            format: config.pixel_format,
            width: config.width,
            height: config.height,
            jpeg_quality: config.jpeg_quality,
            vflip: config.vflip,
            interval: Duration::from_secs(1) / config.fps,
            pool: FramePool::new(
                config.buffer_count as usize,
                Duration::from_millis(config.acquire_timeout_ms),
            ),
            seq: AtomicU64::new(0),
            next_due: Mutex::new(Instant::now()),
            fail_after: None,
        })
    }

    /// Report a sensor fault on every acquisition after `frames` frames.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    /// Hold the caller until the next frame slot on the sensor clock.
    fn pace(&self) {
        let mut due = self.next_due.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let start = (*due).max(now);
        if start > now {
            std::thread::sleep(start - now);
        }
        *due = start + self.interval;
    }

    fn pattern(&self, seq: u64) -> Vec<u8> {
        let (w, h) = (self.width, self.height);
        let bar = ((seq * BAR_STEP) % u64::from(w)) as u32;
        let mut rgb = Vec::with_capacity(w as usize * h as usize * 3);
        for y in 0..h {
            let row = if self.vflip { h - 1 - y } else { y };
            let g = (row * 255 / h) as u8;
            for x in 0..w {
                let r = (x * 255 / w) as u8;
                if x >= bar && x < bar + BAR_WIDTH {
                    rgb.extend_from_slice(&[255, 255, 255]);
                } else {
                    rgb.extend_from_slice(&[r, g, 64]);
                }
            }
        }
        rgb
    }

    fn render(&self, seq: u64) -> Result<Vec<u8>, CaptureError> {
        let rgb = self.pattern(seq);
        let data = match self.format {
            PixelFormat::Rgb888 => rgb,
            PixelFormat::Grayscale => rgb.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
            PixelFormat::Rgb565 => rgb
                .chunks_exact(3)
                .flat_map(|p| {
                    let v = (u16::from(p[0] >> 3) << 11) | (u16::from(p[1] >> 2) << 5) | u16::from(p[2] >> 3);
                    v.to_le_bytes()
                })
                .collect(),
            PixelFormat::Yuyv => rgb_to_yuyv(&rgb),
            PixelFormat::Jpeg => jpeg_from_rgb(&rgb, self.width, self.height, self.jpeg_quality)
                .map_err(|e| CaptureError::Device(e.to_string()))?,
        };
        Ok(data)
    }
}

impl CaptureDriver for SimulatedCamera {
    fn acquire_frame(&self) -> Result<Frame, CaptureError> {
        self.pool.take()?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if self.fail_after.is_some_and(|n| seq >= n) {
            self.pool.give_back();
            return Err(CaptureError::Device("simulated sensor fault".into()));
        }

        self.pace();
        match self.render(seq) {
            Ok(data) => {
                trace!(seq, bytes = data.len(), "frame acquired");
                Ok(Frame {
                    data: Bytes::from(data),
                    format: self.format,
                    width: self.width,
                    height: self.height,
                    captured_at: Utc::now(),
                    seq,
                })
            }
            Err(e) => {
                self.pool.give_back();
                Err(e)
            }
        }
    }

    fn release_frame(&self, frame: Frame) {
        trace!(seq = frame.seq, "frame released");
        drop(frame);
        self.pool.give_back();
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)).round() as u8
}

/// Packs pixel pairs as `[Y0, U, Y1, V]`, chroma averaged over the pair.
fn rgb_to_yuyv(rgb: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgb.len() / 3 * 2);
    for pair in rgb.chunks_exact(6) {
        let (r0, g0, b0) = (f32::from(pair[0]), f32::from(pair[1]), f32::from(pair[2]));
        let (r1, g1, b1) = (f32::from(pair[3]), f32::from(pair[4]), f32::from(pair[5]));
        let (r, g, b) = ((r0 + r1) / 2.0, (g0 + g1) / 2.0, (b0 + b1) / 2.0);
        let u = (-0.169 * r - 0.331 * g + 0.5 * b + 128.0).round().clamp(0.0, 255.0) as u8;
        let v = (0.5 * r - 0.419 * g - 0.081 * b + 128.0).round().clamp(0.0, 255.0) as u8;
        out.extend_from_slice(&[luma(pair[0], pair[1], pair[2]), u, luma(pair[3], pair[4], pair[5]), v]);
    }
    out
}
