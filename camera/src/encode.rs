use std::borrow::Cow;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use portal_common::frame::{Frame, PixelFormat};

use crate::driver::CaptureDriver;

/// JPEG bytes ready for the wire, tagged with who owns the memory.
///
/// `PoolOwned` keeps the native frame alive and sends its buffer as is;
/// `HeapOwned` holds a re-encoded copy whose native frame has already gone
/// back to the driver. [`release`](Self::release) is the only way to get rid
/// of either, so a frame cannot be both released and freed.
#[derive(Debug)]
pub enum EncodedFrame {
    PoolOwned(Frame),
    HeapOwned(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{format:?} frame holds {got} bytes, {width}x{height} needs {expected}")]
    ShortBuffer {
        format: PixelFormat,
        width: u32,
        height: u32,
        got: usize,
        expected: usize,
    },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

impl EncodedFrame {
    /// Turn an acquired frame into JPEG.
    ///
    /// A JPEG frame passes through untouched. Anything else is encoded at
    /// `quality` and the native frame is released before the result is
    /// inspected, so a failed encode never leaks a buffer.
    pub fn prepare(
        frame: Frame,
        quality: u8,
        driver: &dyn CaptureDriver,
    ) -> Result<Self, EncodeError> {
        if frame.format.is_jpeg() {
            return Ok(Self::PoolOwned(frame));
        }
        let encoded = encode_jpeg(&frame, quality);
        driver.release_frame(frame);
        Ok(Self::HeapOwned(Bytes::from(encoded?)))
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Self::PoolOwned(frame) => &frame.data,
            Self::HeapOwned(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PoolOwned(_))
    }

    pub fn release(self, driver: &dyn CaptureDriver) {
        match self {
            Self::PoolOwned(frame) => driver.release_frame(frame),
            Self::HeapOwned(buf) => drop(buf),
        }
    }
}

/// Encode an uncompressed frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let Some(bpp) = frame.format.bytes_per_pixel() else {
        return Ok(frame.data.to_vec());
    };
    let pixels = frame.width as usize * frame.height as usize;
    let expected = pixels * bpp;
    if frame.data.len() < expected {
        return Err(EncodeError::ShortBuffer {
            format: frame.format,
            width: frame.width,
            height: frame.height,
            got: frame.data.len(),
            expected,
        });
    }

    let raw = &frame.data[..expected];
    let (pixels, color): (Cow<'_, [u8]>, _) = match frame.format {
        PixelFormat::Rgb888 => (Cow::Borrowed(raw), ExtendedColorType::Rgb8),
        PixelFormat::Grayscale => (Cow::Borrowed(raw), ExtendedColorType::L8),
        PixelFormat::Rgb565 => (Cow::Owned(rgb565_to_rgb(raw)), ExtendedColorType::Rgb8),
        PixelFormat::Yuyv => (Cow::Owned(yuyv_to_rgb(raw)), ExtendedColorType::Rgb8),
        PixelFormat::Jpeg => unreachable!("jpeg has no fixed pixel size"),
    };

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        &pixels,
        frame.width,
        frame.height,
        color,
    )?;
    Ok(out)
}

/// Encode packed RGB888 pixels.
pub fn jpeg_from_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        rgb,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Little-endian RGB565 to RGB888, replicating high bits into the low ones.
fn rgb565_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(2) {
        let v = u16::from_le_bytes([px[0], px[1]]);
        let r = ((v >> 11) & 0x1F) as u8;
        let g = ((v >> 5) & 0x3F) as u8;
        let b = (v & 0x1F) as u8;
        rgb.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
    }
    rgb
}

/// YUYV (BT.601) to RGB888. Each `[Y0, U, Y1, V]` group yields two pixels.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}
