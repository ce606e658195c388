use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use portal_common::config::{CameraBackend, CameraConfig};
use portal_common::frame::Frame;
use tracing::{info, warn};

use crate::sim::SimulatedCamera;

/// Access to the camera's frame pipeline.
///
/// `acquire_frame` blocks until the hardware hands over a buffer or fails.
/// Every acquired frame must come back through `release_frame` unless its
/// bytes were re-encoded, in which case the native frame is released right
/// after encoding. Implementations must be safe to call from several
/// handlers at once.
pub trait CaptureDriver: Send + Sync {
    fn acquire_frame(&self) -> Result<Frame, CaptureError>;

    fn release_frame(&self, frame: Frame);
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera init failed: {0}")]
    Init(String),
    #[error("no frame buffer became free within {0:?}")]
    Timeout(Duration),
    #[error("camera device error: {0}")]
    Device(String),
    #[error("capture pipeline stopped")]
    Stopped,
    #[error("camera backend {0:?} is not compiled into this build")]
    Unsupported(CameraBackend),
}

/// Bounded set of frame buffers shared by every caller of a driver.
///
/// Only the number of outstanding buffers is tracked; the bytes themselves
/// live in the frames. `take` waits for a free slot up to the acquisition
/// timeout, which is how a slow stream client ends up throttling capture.
#[derive(Debug)]
pub struct FramePool {
    capacity: usize,
    timeout: Duration,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl FramePool {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            timeout,
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently held by callers.
    pub fn outstanding(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take(&self) -> Result<(), CaptureError> {
        let deadline = Instant::now() + self.timeout;
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::Timeout(self.timeout));
            }
            let (guard, _) = self
                .freed
                .wait_timeout(in_use, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            in_use = guard;
        }
        *in_use += 1;
        Ok(())
    }

    pub fn give_back(&self) {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if *in_use == 0 {
            warn!("frame returned to a pool with no outstanding buffers");
            return;
        }
        *in_use -= 1;
        self.freed.notify_one();
    }
}

/// Open the backend selected in the camera config.
///
/// Validates the buffer count, format and resolution first; a driver that
/// fails here must not be served.
pub fn open_driver(config: &CameraConfig) -> Result<Arc<dyn CaptureDriver>, CaptureError> {
    config
        .validate()
        .map_err(|e| CaptureError::Init(e.to_string()))?;

    info!(
        backend = ?config.backend,
        format = ?config.pixel_format,
        width = config.width,
        height = config.height,
        buffers = config.buffer_count,
        vflip = config.vflip,
        "opening camera"
    );

    match config.backend {
        CameraBackend::Simulated => Ok(Arc::new(SimulatedCamera::new(config)?)),
        #[cfg(feature = "v4l2")]
        CameraBackend::V4l2 => Ok(Arc::new(crate::v4l2::V4l2Camera::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        CameraBackend::V4l2 => Err(CaptureError::Unsupported(config.backend)),
    }
}
