use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use portal_common::config::ServerConfig;
use portal_common::frame::Frame;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::driver::{CaptureDriver, CaptureError};
use crate::encode::{EncodeError, EncodedFrame};
use crate::filter::RunningAverage;
use crate::illumination::Lamp;
use crate::still::capture_handler;
use crate::stream::stream_handler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Everything the two endpoints share: the camera, the optional lamp and
/// the frame-interval filter the stream writes to.
pub struct MediaServer {
    driver: Arc<dyn CaptureDriver>,
    lamp: Option<Lamp>,
    flash: Duration,
    filter: Mutex<RunningAverage>,
    filter_samples: usize,
    stream_quality: u8,
    stop: watch::Sender<bool>,
}

impl MediaServer {
    pub fn new(driver: Arc<dyn CaptureDriver>, config: &ServerConfig) -> Self {
        Self {
            driver,
            lamp: None,
            flash: Duration::ZERO,
            filter: Mutex::new(RunningAverage::new(config.filter_samples)),
            filter_samples: config.filter_samples,
            stream_quality: config.stream_quality,
            stop: watch::channel(false).0,
        }
    }

    /// Attach illumination; `flash` is how long the lamp burns before a
    /// still exposure.
    pub fn with_lamp(mut self, lamp: Lamp, flash: Duration) -> Self {
        self.lamp = Some(lamp);
        self.flash = flash;
        self
    }

    pub fn driver(&self) -> &dyn CaptureDriver {
        self.driver.as_ref()
    }

    pub fn lamp(&self) -> Option<&Lamp> {
        self.lamp.as_ref()
    }

    pub fn stream_quality(&self) -> u8 {
        self.stream_quality
    }

    /// Acquire one frame for a still, flashing the lamp if there is one.
    /// The lamp is switched back even when acquisition fails.
    pub fn capture_photo(&self) -> Result<Frame, CaptureError> {
        let Some(lamp) = &self.lamp else {
            return self.driver.acquire_frame();
        };
        let _flash = lamp.flash();
        std::thread::sleep(self.flash);
        self.driver.acquire_frame()
    }

    /// Capture a still as JPEG. The caller owns the result and must
    /// [`release`](EncodedFrame::release) it to this server's driver.
    pub fn capture_encoded(&self) -> Result<EncodedFrame, ServerError> {
        let frame = self.capture_photo()?;
        Ok(EncodedFrame::prepare(frame, self.stream_quality, self.driver())?)
    }

    /// Capture a still and hand back its JPEG bytes, the frame already
    /// returned to the driver.
    pub fn capture_jpeg(&self) -> Result<Bytes, ServerError> {
        let encoded = self.capture_encoded()?;
        let jpeg = encoded.bytes().clone();
        encoded.release(self.driver());
        Ok(jpeg)
    }

    /// Tell every open stream to finish its current frame and end.
    pub fn stop_streams(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves `changed()` once [`stop_streams`](Self::stop_streams) is called.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Feed one inter-frame interval, returning the smoothed interval.
    pub fn record_interval(&self, interval_ms: u32) -> u32 {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .run(interval_ms)
    }

    pub fn average_interval_ms(&self) -> u32 {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .average()
    }

    pub fn interval_samples(&self) -> usize {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples()
    }

    /// Start the still listener on `base_port` and the stream listener on
    /// `base_port + 1`.
    ///
    /// A listener that fails to bind is logged and left out; the other one
    /// still runs. Calling this twice on the same ports leaves the second
    /// call with nothing bound.
    pub async fn start(self: &Arc<Self>, bind: &str, base_port: u16) -> RunningServers {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) =
            RunningAverage::new(self.filter_samples);
        self.stop.send_replace(false);

        let still =
            match ListenerHandle::bind("capture", bind, base_port, still_router(Arc::clone(self)))
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(error = %e, "still capture listener failed to start");
                    None
                }
            };

        let stream = match base_port.checked_add(1) {
            Some(port) => {
                match ListenerHandle::bind("stream", bind, port, stream_router(Arc::clone(self)))
                    .await
                {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!(error = %e, "stream listener failed to start");
                        None
                    }
                }
            }
            None => {
                error!(base_port, "no port left for the stream listener");
                None
            }
        };

        RunningServers {
            server: Arc::clone(self),
            still,
            stream,
        }
    }
}

pub fn still_router(server: Arc<MediaServer>) -> Router {
    Router::new()
        .route("/capture", get(capture_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub fn stream_router(server: Arc<MediaServer>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// One serving listener running on its own task, with its own shutdown
/// channel.
pub struct ListenerHandle {
    name: &'static str,
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn bind(
        name: &'static str,
        host: &str,
        port: u16,
        router: Router,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    signal.await.ok();
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, listener = name, "listener stopped with error");
            }
        });

        info!(%addr, listener = name, "listener started");
        Ok(Self {
            name,
            addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait up to a short grace period for the serve
    /// loop to finish.
    ///
    /// Aborting the serve task does not reach connections already handed
    /// to their own tasks. Open streams have to be ended through
    /// [`MediaServer::stop_streams`] first.
    pub async fn shutdown(self) {
        let Self {
            name,
            shutdown,
            mut task,
            ..
        } = self;
        let _ = shutdown.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!(listener = name, "connections still open after grace period, aborting");
            task.abort();
        }
        info!(listener = name, "listener stopped");
    }
}

/// The listeners that came up at start.
pub struct RunningServers {
    server: Arc<MediaServer>,
    pub still: Option<ListenerHandle>,
    pub stream: Option<ListenerHandle>,
}

impl RunningServers {
    pub fn still_addr(&self) -> Option<SocketAddr> {
        self.still.as_ref().map(ListenerHandle::local_addr)
    }

    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(ListenerHandle::local_addr)
    }

    /// End open streams, then stop both listeners.
    pub async fn shutdown(self) {
        self.server.stop_streams();
        if let Some(still) = self.still {
            still.shutdown().await;
        }
        if let Some(stream) = self.stream {
            stream.shutdown().await;
        }
    }
}
