//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use portal_common::frame::{Frame, PixelFormat};

use crate::driver::{CaptureDriver, CaptureError, FramePool};
use crate::illumination::LedOutput;
use crate::multipart::{ChunkSink, Disconnected};

pub(crate) fn raw_frame(format: PixelFormat, data: Vec<u8>, width: u32, height: u32) -> Frame {
    Frame {
        data: Bytes::from(data),
        format,
        width,
        height,
        captured_at: Utc::now(),
        seq: 0,
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Shot {
    Frame {
        format: PixelFormat,
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    Fail,
}

impl Shot {
    pub(crate) fn jpeg(data: &[u8]) -> Self {
        Shot::Frame {
            format: PixelFormat::Jpeg,
            data: data.to_vec(),
            width: 640,
            height: 480,
        }
    }

    pub(crate) fn raw(format: PixelFormat, data: Vec<u8>, width: u32, height: u32) -> Self {
        Shot::Frame {
            format,
            data,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Acquire(u64),
    Release(u64),
}

/// Driver that plays back a fixed list of shots, then fails.
///
/// With `endless` set, the last shot repeats forever instead.
pub(crate) struct ScriptedDriver {
    script: Mutex<VecDeque<Shot>>,
    endless: Option<Shot>,
    delay: Duration,
    pool: FramePool,
    seq: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
    events: Mutex<Vec<Event>>,
}

impl ScriptedDriver {
    pub(crate) fn new(shots: Vec<Shot>) -> Self {
        Self {
            script: Mutex::new(shots.into()),
            endless: None,
            delay: Duration::ZERO,
            pool: FramePool::new(2, Duration::from_secs(2)),
            seq: AtomicU64::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn endless(shot: Shot, delay: Duration) -> Self {
        Self {
            endless: Some(shot),
            delay,
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn failing() -> Self {
        Self::new(vec![Shot::Fail])
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn next_shot(&self) -> Option<Shot> {
        let mut script = self.script.lock().unwrap();
        script.pop_front().or_else(|| self.endless.clone())
    }
}

impl CaptureDriver for ScriptedDriver {
    fn acquire_frame(&self) -> Result<Frame, CaptureError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let (format, data, width, height) = match self.next_shot() {
            Some(Shot::Frame {
                format,
                data,
                width,
                height,
            }) => (format, data, width, height),
            Some(Shot::Fail) => return Err(CaptureError::Device("scripted failure".into())),
            None => return Err(CaptureError::Stopped),
        };
        self.pool.take()?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::Acquire(seq));
        Ok(Frame {
            data: Bytes::from(data),
            format,
            width,
            height,
            captured_at: Utc::now(),
            seq,
        })
    }

    fn release_frame(&self, frame: Frame) {
        self.events.lock().unwrap().push(Event::Release(frame.seq));
        self.released.fetch_add(1, Ordering::SeqCst);
        self.pool.give_back();
    }
}

/// LED output that remembers every duty written to it.
#[derive(Default)]
pub(crate) struct RecordingLed {
    duties: Mutex<Vec<u8>>,
}

impl RecordingLed {
    pub(crate) fn duties(&self) -> Vec<u8> {
        self.duties.lock().unwrap().clone()
    }

    pub(crate) fn current(&self) -> u8 {
        self.duties.lock().unwrap().last().copied().unwrap_or(0)
    }
}

impl LedOutput for RecordingLed {
    fn set_duty(&self, duty: u8) -> std::io::Result<()> {
        self.duties.lock().unwrap().push(duty);
        Ok(())
    }
}

/// Collects stream chunks; refuses writes after `limit` chunks.
#[derive(Default)]
pub(crate) struct VecSink {
    pub(crate) chunks: Vec<Bytes>,
    limit: Option<usize>,
    led: Option<Arc<RecordingLed>>,
    pub(crate) duty_at_write: Vec<u8>,
}

impl VecSink {
    pub(crate) fn disconnect_after(chunks: usize) -> Self {
        Self {
            limit: Some(chunks),
            ..Self::default()
        }
    }

    pub(crate) fn watching(mut self, led: Arc<RecordingLed>) -> Self {
        self.led = Some(led);
        self
    }

    pub(crate) fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

impl ChunkSink for VecSink {
    fn send_chunk(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        if self.limit.is_some_and(|limit| self.chunks.len() >= limit) {
            return Err(Disconnected);
        }
        if let Some(led) = &self.led {
            self.duty_at_write.push(led.current());
        }
        self.chunks.push(chunk);
        Ok(())
    }
}

/// Split a multipart body into `(headers, payload)` pairs.
pub(crate) fn split_parts(body: &[u8], boundary: &[u8]) -> Vec<(String, Vec<u8>)> {
    const HEADER_END: &[u8] = b"\r\n\r\n";
    let mut parts = Vec::new();
    let mut rest = body;
    while let Some(pos) = find_subsequence(rest, boundary) {
        rest = &rest[pos + boundary.len()..];
        let Some(header_end) = find_subsequence(rest, HEADER_END) else {
            break;
        };
        let headers = String::from_utf8_lossy(&rest[..header_end]).into_owned();
        rest = &rest[header_end + HEADER_END.len()..];
        let payload_end = find_subsequence(rest, boundary).unwrap_or(rest.len());
        parts.push((headers, rest[..payload_end].to_vec()));
        rest = &rest[payload_end..];
    }
    parts
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
