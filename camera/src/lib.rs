//! Media acquisition and streaming for the portal endpoint.
//!
//! Owns the camera through a [`driver::CaptureDriver`], serves single JPEG
//! captures on one listener and a `multipart/x-mixed-replace` stream on a
//! second one, and keeps a smoothed frame interval while streaming.

pub mod driver;
pub mod encode;
pub mod filter;
pub mod illumination;
pub mod multipart;
pub mod server;
pub mod sim;
pub mod still;
pub mod stream;
#[cfg(feature = "v4l2")]
pub mod v4l2;

#[cfg(test)]
mod testing;

pub use driver::{open_driver, CaptureDriver, CaptureError};
pub use server::{MediaServer, RunningServers, ServerError};
