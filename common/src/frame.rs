use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Pixel layout of a frame as delivered by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Compressed JPEG, the wire format of both endpoints.
    Jpeg,
    /// 3 bytes per pixel, R G B.
    Rgb888,
    /// 2 bytes per pixel, little-endian 5-6-5.
    Rgb565,
    /// YUV 4:2:2 packed as `[Y0, U, Y1, V]`.
    Yuyv,
    /// 1 byte per pixel.
    Grayscale,
}

impl PixelFormat {
    pub fn is_jpeg(self) -> bool {
        self == PixelFormat::Jpeg
    }

    /// Bytes one uncompressed pixel occupies, `None` for JPEG.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgb565 | PixelFormat::Yuyv => Some(2),
            PixelFormat::Grayscale => Some(1),
        }
    }
}

/// One image buffer acquired from a capture driver.
///
/// A frame belongs to whoever acquired it until it is handed back to the
/// driver it came from. `data` is reference counted, so passing it on to a
/// response body does not copy the pixels.
#[derive(Debug)]
pub struct Frame {
    pub data: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub seq: u64,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capture time as `<seconds>.<microseconds>` since the Unix epoch.
    pub fn timestamp(&self) -> String {
        format!(
            "{}.{:06}",
            self.captured_at.timestamp(),
            self.captured_at.timestamp_subsec_micros()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(millis: i64) -> Frame {
        Frame {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            format: PixelFormat::Jpeg,
            width: 2,
            height: 2,
            captured_at: DateTime::from_timestamp_millis(millis).unwrap(),
            seq: 0,
        }
    }

    #[test]
    fn timestamp_pads_microseconds() {
        assert_eq!(frame_at(1_708_300_000_007).timestamp(), "1708300000.007000");
        assert_eq!(frame_at(1_708_300_000_000).timestamp(), "1708300000.000000");
    }

    #[test]
    fn bytes_per_pixel_by_format() {
        assert_eq!(PixelFormat::Jpeg.bytes_per_pixel(), None);
        assert_eq!(PixelFormat::Rgb888.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Yuyv.bytes_per_pixel(), Some(2));
        assert_eq!(PixelFormat::Grayscale.bytes_per_pixel(), Some(1));
    }

    #[test]
    fn len_reflects_payload() {
        let frame = frame_at(0);
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_empty());
        assert!(frame.format.is_jpeg());
    }
}
