use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use portal_common::config::CameraConfig;
use portal_common::frame::{Frame, PixelFormat};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::driver::{CaptureDriver, CaptureError, FramePool};

const V4L2_CID_VFLIP: u32 = 0x0098_0915;

type Reply = SyncSender<Result<Bytes, CaptureError>>;

/// Video4Linux2 capture device.
///
/// The mmap stream lives on a dedicated thread; `acquire_frame` sends it a
/// request and waits for the copied buffer. The frame pool caps how many
/// copies callers can hold at once at the configured buffer count.
pub struct V4l2Camera {
    format: PixelFormat,
    width: u32,
    height: u32,
    timeout: Duration,
    pool: FramePool,
    seq: AtomicU64,
    requests: Mutex<Option<SyncSender<Reply>>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for V4l2Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Camera")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pool", &self.pool)
            .field("thread_handle", &self.thread_handle.is_some())
            .finish()
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Jpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Rgb888 => FourCC::new(b"RGB3"),
        PixelFormat::Rgb565 => FourCC::new(b"RGBP"),
        PixelFormat::Grayscale => FourCC::new(b"GREY"),
    }
}

fn device_error(context: &str, e: std::io::Error) -> CaptureError {
    CaptureError::Init(format!("{context}: {e}"))
}

impl V4l2Camera {
    /// Open the device, negotiate format and rate, and start the capture thread.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Init` if the device cannot be opened, refuses
    /// the requested format or resolution, or cannot map its buffers.
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let device = Device::with_path(&config.device)
            .map_err(|e| device_error(&format!("open {}", config.device), e))?;

        let wanted = Format::new(config.width, config.height, fourcc(config.pixel_format));
        let format = Capture::set_format(&device, &wanted).map_err(|e| device_error("set format", e))?;
        if format.fourcc != wanted.fourcc || format.width != config.width || format.height != config.height {
            return Err(CaptureError::Init(format!(
                "device offered {} {}x{}, wanted {} {}x{}",
                format.fourcc, format.width, format.height, wanted.fourcc, config.width, config.height
            )));
        }

        Capture::set_params(&device, &Parameters::with_fps(config.fps))
            .map_err(|e| device_error("set frame rate", e))?;

        if let Err(e) = device.set_control(Control {
            id: V4L2_CID_VFLIP,
            value: Value::Boolean(config.vflip),
        }) {
            warn!(error = %e, "sensor rejected vertical flip setting");
        }

        let (requests, incoming) = mpsc::sync_channel::<Reply>(0);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let buffer_count = config.buffer_count;
        let handle = thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || capture_loop(device, buffer_count, incoming, ready_tx))
            .map_err(|e| device_error("spawn capture thread", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(CaptureError::Stopped);
            }
        }

        info!(device = %config.device, fourcc = %format.fourcc, "v4l2 capture started");

        Ok(Self {
            format: config.pixel_format,
            width: config.width,
            height: config.height,
            timeout: Duration::from_millis(config.acquire_timeout_ms),
            pool: FramePool::new(
                config.buffer_count as usize,
                Duration::from_millis(config.acquire_timeout_ms),
            ),
            seq: AtomicU64::new(0),
            requests: Mutex::new(Some(requests)),
            thread_handle: Some(handle),
        })
    }

    fn fetch(&self) -> Result<Bytes, CaptureError> {
        let requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CaptureError::Stopped)?;

        let (reply, answer) = mpsc::sync_channel(1);
        requests.send(reply).map_err(|_| CaptureError::Stopped)?;
        match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Stopped),
        }
    }
}

fn capture_loop(
    device: Device,
    buffer_count: u32,
    incoming: Receiver<Reply>,
    ready: SyncSender<Result<(), CaptureError>>,
) {
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(device_error("map buffers", e)));
            return;
        }
    };

    // Runs until the camera handle drops its request sender.
    while let Ok(reply) = incoming.recv() {
        let result = match CaptureStream::next(&mut stream) {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                Ok(Bytes::copy_from_slice(&buf[..used]))
            }
            Err(e) => {
                error!(error = %e, "v4l2 dequeue failed");
                Err(CaptureError::Device(e.to_string()))
            }
        };
        let _ = reply.send(result);
    }
    debug!("v4l2 capture thread exiting");
}

impl CaptureDriver for V4l2Camera {
    fn acquire_frame(&self) -> Result<Frame, CaptureError> {
        self.pool.take()?;
        match self.fetch() {
            Ok(data) => Ok(Frame {
                data,
                format: self.format,
                width: self.width,
                height: self.height,
                captured_at: Utc::now(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            }),
            Err(e) => {
                self.pool.give_back();
                Err(e)
            }
        }
    }

    fn release_frame(&self, frame: Frame) {
        drop(frame);
        self.pool.give_back();
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        drop(
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
