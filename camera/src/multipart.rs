use bytes::Bytes;
use tokio::sync::mpsc;

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";
/// Written before every part, including the first.
pub const STREAM_BOUNDARY: &[u8] = b"\r\n--123456789000000000000987654321\r\n";

/// The peer stopped reading; nothing more can be written to this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Where stream chunks go, one chunk per write.
pub trait ChunkSink {
    fn send_chunk(&mut self, chunk: Bytes) -> Result<(), Disconnected>;
}

/// Feeds a response body. The channel is bounded, so a slow reader blocks
/// the writer; a dropped body closes the channel and ends the stream.
impl ChunkSink for mpsc::Sender<Bytes> {
    fn send_chunk(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        self.blocking_send(chunk).map_err(|_| Disconnected)
    }
}

pub fn part_header(len: usize, timestamp: &str) -> Bytes {
    Bytes::from(format!(
        "Content-Type: image/jpeg\r\nContent-Length: {len}\r\nX-Timestamp: {timestamp}\r\n\r\n"
    ))
}

/// Write one part: boundary, part header, then the JPEG bytes.
pub fn write_part(
    sink: &mut impl ChunkSink,
    jpeg: Bytes,
    timestamp: &str,
) -> Result<(), Disconnected> {
    sink.send_chunk(Bytes::from_static(STREAM_BOUNDARY))?;
    sink.send_chunk(part_header(jpeg.len(), timestamp))?;
    sink.send_chunk(jpeg)
}
