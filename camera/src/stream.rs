use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::driver::CaptureError;
use crate::encode::{EncodeError, EncodedFrame};
use crate::illumination::Lamp;
use crate::multipart::{self, ChunkSink, STREAM_CONTENT_TYPE};
use crate::server::MediaServer;

/// Why a stream stopped.
#[derive(Debug)]
pub enum StreamEnd {
    Disconnected,
    Shutdown,
    AcquireFailed(CaptureError),
    EncodeFailed(EncodeError),
}

/// Per-connection timing state.
struct StreamSession {
    last_frame: Instant,
    frames: u64,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            frames: 0,
        }
    }

    fn frame_sent(&mut self, server: &MediaServer, bytes: usize) {
        let now = Instant::now();
        let interval_ms =
            u32::try_from(now.duration_since(self.last_frame).as_millis()).unwrap_or(u32::MAX);
        self.last_frame = now;
        self.frames += 1;

        let avg_ms = server.record_interval(interval_ms);
        debug!(
            frame = self.frames,
            bytes,
            interval_ms,
            fps = format!("{:.1}", fps(interval_ms)),
            avg_ms,
            avg_fps = format!("{:.1}", fps(avg_ms)),
            "MJPG frame sent"
        );
    }
}

fn fps(interval_ms: u32) -> f64 {
    if interval_ms == 0 {
        0.0
    } else {
        1000.0 / f64::from(interval_ms)
    }
}

/// Stream frames into `sink` until acquisition, encoding or the write
/// fails, or the server is told to stop streaming.
///
/// Blocks for the whole life of the connection. Each acquired frame is
/// released (or its re-encoded copy freed) before the next acquisition, and
/// the lamp is back off whichever way the loop ends.
pub fn run_stream(server: &MediaServer, sink: &mut impl ChunkSink) -> StreamEnd {
    let _continuous = server.lamp().map(Lamp::continuous);
    let driver = server.driver();
    let mut session = StreamSession::new();

    loop {
        if server.is_stopping() {
            return StreamEnd::Shutdown;
        }
        let frame = match driver.acquire_frame() {
            Ok(frame) => frame,
            Err(e) => return StreamEnd::AcquireFailed(e),
        };
        let timestamp = frame.timestamp();

        let encoded = match EncodedFrame::prepare(frame, server.stream_quality(), driver) {
            Ok(encoded) => encoded,
            Err(e) => return StreamEnd::EncodeFailed(e),
        };

        let len = encoded.len();
        let written = multipart::write_part(sink, encoded.bytes().clone(), &timestamp);
        encoded.release(driver);
        if written.is_err() {
            if server.is_stopping() {
                return StreamEnd::Shutdown;
            }
            return StreamEnd::Disconnected;
        }

        session.frame_sent(server, len);
    }
}

/// GET /stream
pub async fn stream_handler(State(server): State<Arc<MediaServer>>) -> Response {
    let (mut tx, rx) = mpsc::channel::<Bytes>(1);
    let stop = server.stop_signal();

    tokio::task::spawn_blocking(move || {
        info!("stream client connected");
        match run_stream(&server, &mut tx) {
            StreamEnd::Disconnected => info!("stream client disconnected"),
            StreamEnd::Shutdown => info!("server shutting down, stream closed"),
            StreamEnd::AcquireFailed(e) => error!(error = %e, "camera capture failed, ending stream"),
            StreamEnd::EncodeFailed(e) => warn!(error = %e, "jpeg compression failed, ending stream"),
        }
    });

    // The body ends on its own once the server stops streaming, so the
    // connection closes even if the client never hangs up.
    let chunks = futures_util::stream::unfold((rx, stop), |(mut rx, mut stop)| async move {
        loop {
            if *stop.borrow_and_update() {
                return None;
            }
            tokio::select! {
                chunk = rx.recv() => {
                    return chunk.map(|chunk| (Ok::<_, Infallible>(chunk), (rx, stop)));
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::STREAM_BOUNDARY;
    use crate::testing::{split_parts, Event, RecordingLed, ScriptedDriver, Shot, VecSink};
    use portal_common::config::ServerConfig;
    use portal_common::frame::PixelFormat;
    use std::time::Duration;

    fn server_with(driver: Arc<ScriptedDriver>) -> MediaServer {
        MediaServer::new(driver, &ServerConfig::default())
    }

    fn server_with_lamp(driver: Arc<ScriptedDriver>) -> (MediaServer, Arc<RecordingLed>) {
        let led = Arc::new(RecordingLed::default());
        let server = server_with(driver)
            .with_lamp(Lamp::new(led.clone(), 255, 100), Duration::ZERO);
        (server, led)
    }

    #[test]
    fn three_frames_frame_exactly() {
        let payloads: [&[u8]; 3] = [b"\xFF\xD8one\xFF\xD9", b"\xFF\xD8second\xFF\xD9", b"\xFF\xD8\xFF\xD9"];
        let driver = Arc::new(ScriptedDriver::new(payloads.iter().map(|p| Shot::jpeg(p)).collect()));
        let server = server_with(driver.clone());
        let mut sink = VecSink::default();

        let end = run_stream(&server, &mut sink);
        assert!(matches!(end, StreamEnd::AcquireFailed(CaptureError::Stopped)));

        let body = sink.concat();
        let mut expected = Vec::new();
        let mut rest = body.as_slice();
        for payload in payloads {
            // timestamps vary, so rebuild the header from what was sent
            let header_start = STREAM_BOUNDARY.len();
            let header_len = rest[header_start..]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .unwrap()
                + 4;
            let header = &rest[header_start..header_start + header_len];
            let header_text = std::str::from_utf8(header).unwrap();
            assert!(header_text.starts_with(&format!(
                "Content-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: ",
                payload.len()
            )));

            expected.extend_from_slice(STREAM_BOUNDARY);
            expected.extend_from_slice(header);
            expected.extend_from_slice(payload);
            rest = &rest[header_start + header_len + payload.len()..];
        }
        assert!(rest.is_empty(), "no trailing boundary after the last part");
        assert_eq!(body, expected);
        assert_eq!(sink.chunks.len(), 9);
    }

    #[test]
    fn timestamp_header_is_seconds_and_micros() {
        let driver = Arc::new(ScriptedDriver::new(vec![Shot::jpeg(b"\xFF\xD8\xFF\xD9")]));
        let server = server_with(driver);
        let mut sink = VecSink::default();
        run_stream(&server, &mut sink);

        let parts = split_parts(&sink.concat(), STREAM_BOUNDARY);
        assert_eq!(parts.len(), 1);
        let stamp = parts[0]
            .0
            .lines()
            .find_map(|l| l.strip_prefix("X-Timestamp: "))
            .unwrap();
        let (secs, micros) = stamp.split_once('.').unwrap();
        assert!(secs.parse::<i64>().unwrap() > 1_600_000_000);
        assert_eq!(micros.len(), 6);
    }

    #[test]
    fn every_frame_released_before_next_acquire() {
        let shots = vec![
            Shot::jpeg(b"\xFF\xD8a\xFF\xD9"),
            Shot::raw(PixelFormat::Rgb888, vec![90; 8 * 8 * 3], 8, 8),
            Shot::jpeg(b"\xFF\xD8b\xFF\xD9"),
            Shot::raw(PixelFormat::Grayscale, vec![90; 8 * 8], 8, 8),
        ];
        let driver = Arc::new(ScriptedDriver::new(shots));
        let server = server_with(driver.clone());
        let mut sink = VecSink::default();

        run_stream(&server, &mut sink);

        let expected: Vec<Event> = (0..4)
            .flat_map(|seq| [Event::Acquire(seq), Event::Release(seq)])
            .collect();
        assert_eq!(driver.events(), expected);
        assert_eq!(driver.acquired(), 4);
        assert_eq!(driver.released(), 4);
        assert_eq!(driver.outstanding(), 0);

        let parts = split_parts(&sink.concat(), STREAM_BOUNDARY);
        assert_eq!(parts.len(), 4);
        for (_, payload) in &parts {
            assert_eq!(payload[..2], [0xFF, 0xD8]);
        }
    }

    #[test]
    fn encode_failure_ends_stream_without_leak() {
        let shots = vec![
            Shot::jpeg(b"\xFF\xD8a\xFF\xD9"),
            Shot::raw(PixelFormat::Rgb888, vec![0; 5], 8, 8),
            Shot::jpeg(b"\xFF\xD8never\xFF\xD9"),
        ];
        let driver = Arc::new(ScriptedDriver::new(shots));
        let (server, led) = server_with_lamp(driver.clone());
        let mut sink = VecSink::default();

        let end = run_stream(&server, &mut sink);

        assert!(matches!(end, StreamEnd::EncodeFailed(_)));
        assert_eq!(driver.acquired(), 2);
        assert_eq!(driver.released(), 2);
        assert_eq!(sink.chunks.len(), 3);
        assert_eq!(led.current(), 0);
    }

    #[test]
    fn disconnect_releases_frame_and_turns_lamp_off() {
        let driver = Arc::new(ScriptedDriver::endless(
            Shot::jpeg(b"\xFF\xD8loop\xFF\xD9"),
            Duration::ZERO,
        ));
        let (server, led) = server_with_lamp(driver.clone());
        let mut sink = VecSink::disconnect_after(7).watching(led.clone());

        let end = run_stream(&server, &mut sink);

        assert!(matches!(end, StreamEnd::Disconnected));
        assert_eq!(driver.acquired(), 3);
        assert_eq!(driver.released(), 3);
        assert_eq!(driver.outstanding(), 0);
        assert!(sink.duty_at_write.iter().all(|&d| d == 100));
        assert_eq!(led.current(), 0);
        assert!(!server.lamp().unwrap().is_continuous());
    }

    #[test]
    fn acquisition_failure_turns_lamp_off() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Shot::jpeg(b"\xFF\xD8a\xFF\xD9"),
            Shot::Fail,
        ]));
        let (server, led) = server_with_lamp(driver.clone());
        let mut sink = VecSink::default().watching(led.clone());

        let end = run_stream(&server, &mut sink);

        assert!(matches!(end, StreamEnd::AcquireFailed(CaptureError::Device(_))));
        assert_eq!(sink.duty_at_write, vec![100, 100, 100]);
        assert_eq!(led.duties(), vec![100, 0]);
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn immediate_failure_still_restores_lamp() {
        let driver = Arc::new(ScriptedDriver::failing());
        let (server, led) = server_with_lamp(driver);
        let mut sink = VecSink::default();

        run_stream(&server, &mut sink);

        assert!(sink.chunks.is_empty());
        assert_eq!(led.duties(), vec![100, 0]);
    }

    #[test]
    fn stopped_server_ends_stream_before_acquiring() {
        let driver = Arc::new(ScriptedDriver::endless(
            Shot::jpeg(b"\xFF\xD8loop\xFF\xD9"),
            Duration::ZERO,
        ));
        let (server, led) = server_with_lamp(driver.clone());
        server.stop_streams();
        let mut sink = VecSink::default();

        let end = run_stream(&server, &mut sink);

        assert!(matches!(end, StreamEnd::Shutdown));
        assert_eq!(driver.acquired(), 0);
        assert!(sink.chunks.is_empty());
        assert_eq!(led.duties(), vec![100, 0]);
    }

    #[test]
    fn intervals_feed_running_average() {
        let driver = Arc::new(ScriptedDriver::new(
            (0..5).map(|_| Shot::jpeg(b"\xFF\xD8\xFF\xD9")).collect(),
        ));
        let server = server_with(driver);
        let mut sink = VecSink::default();

        run_stream(&server, &mut sink);

        assert_eq!(server.interval_samples(), 5);
    }

    #[test]
    fn fps_of_zero_interval_is_zero() {
        assert_eq!(fps(0), 0.0);
        assert_eq!(fps(50), 20.0);
    }
}
