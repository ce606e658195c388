use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{debug, error};

use crate::encode::EncodedFrame;
use crate::server::MediaServer;

/// Keeps the captured frame out of the driver until the response body that
/// points into it has been sent or dropped.
struct HeldFrame {
    server: Arc<MediaServer>,
    frame: Option<EncodedFrame>,
}

impl Drop for HeldFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.release(self.server.driver());
        }
    }
}

/// GET /capture: one JPEG, lamp flashed around the exposure.
pub async fn capture_handler(State(server): State<Arc<MediaServer>>) -> Response {
    let capture = Arc::clone(&server);
    let result = tokio::task::spawn_blocking(move || capture.capture_encoded()).await;

    match result {
        Ok(Ok(encoded)) => {
            let jpeg = encoded.bytes().clone();
            debug!(bytes = jpeg.len(), pass_through = encoded.is_pass_through(), "still capture served");
            let held = HeldFrame {
                server,
                frame: Some(encoded),
            };
            (
                [
                    (header::CONTENT_TYPE, "image/jpeg"),
                    (header::CONTENT_DISPOSITION, "inline; filename=capture.jpg"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                [(header::CONTENT_LENGTH, jpeg.len().to_string())],
                Body::from_stream(single_chunk(jpeg, held)),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "camera capture failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Yield `jpeg` once. `held` goes with the body, so the frame is released
/// after the last poll or when the client goes away mid-transfer.
fn single_chunk(
    jpeg: Bytes,
    held: HeldFrame,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures_util::stream::unfold((Some(jpeg), held), |(jpeg, held)| async move {
        let jpeg = jpeg?;
        Some((Ok(jpeg), (None, held)))
    })
}
