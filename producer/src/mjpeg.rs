use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use stream_gate_common::frame::Frame;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{decode_image, FrameSource, SourceError};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the first delimiter line `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next delimiter.
    CollectingJpeg,
    /// Saw the closing delimiter `--<boundary>--`; the rest is epilogue.
    Closed,
}

/// Result of looking for a delimiter line in the buffer.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Delimiter at `pos`. `close` is set for the final `--<boundary>--`.
    Found { pos: usize, close: bool },
    /// Nothing complete yet; a later scan can start at `resume`.
    NeedMore { resume: usize },
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies. Bytes go in
/// through `push` in whatever chunks the network delivers; complete JPEG
/// parts come out of `next_jpeg`.
pub(crate) struct MjpegParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegParser {
    pub(crate) fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        Self {
            delimiter: format!("--{boundary}").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        if self.state != ParseState::Closed {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// True once the closing delimiter has been seen.
    pub(crate) fn is_closed(&self) -> bool {
        self.state == ParseState::Closed
    }

    /// Pop the next complete JPEG, or `None` if more bytes are needed.
    pub(crate) fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        // Delimiter plus the `\r\n` or `--` after it
        let line = self.delimiter.len() + 2;
        loop {
            match self.state {
                ParseState::Closed => return None,
                ParseState::SeekingBoundary => {
                    match scan_delimiter(&self.buffer, &self.delimiter, 0) {
                        Scan::Found { pos, close } => {
                            let _ = self.buffer.split_to(pos + line);
                            if close {
                                self.close();
                                return None;
                            }
                            self.state = ParseState::SeekingHeaderEnd;
                        }
                        Scan::NeedMore { resume } => {
                            // Keep the tail in case the boundary spans chunks
                            let _ = self.buffer.split_to(resume);
                            return None;
                        }
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        return None;
                    }
                }
                ParseState::CollectingJpeg => {
                    let (pos, close) =
                        match scan_delimiter(&self.buffer, &self.delimiter, self.jpeg_start) {
                            Scan::Found { pos, close } => (pos, close),
                            Scan::NeedMore { resume } => {
                                // Resume the scan near the end instead of from the start
                                self.jpeg_start = resume;
                                return None;
                            }
                        };
                    // Strip trailing \r\n before the delimiter
                    let end = if self.buffer[..pos].ends_with(b"\r\n") {
                        pos - 2
                    } else {
                        pos
                    };
                    let jpeg = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(pos + line);
                    if close {
                        self.close();
                    } else {
                        self.state = ParseState::SeekingHeaderEnd;
                    }
                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        debug!("closing multipart delimiter received");
        self.state = ParseState::Closed;
        self.buffer.clear();
    }
}

/// Find the next delimiter line at or after `from`. A match only counts when
/// it is followed by `\r\n` (another part) or `--` (end of body).
fn scan_delimiter(buffer: &[u8], delimiter: &[u8], from: usize) -> Scan {
    let mut start = from;
    while let Some(offset) = find_subsequence(&buffer[start..], delimiter) {
        let pos = start + offset;
        let after = pos + delimiter.len();
        match buffer.get(after..after + 2) {
            Some(b"\r\n") => return Scan::Found { pos, close: false },
            Some(b"--") => return Scan::Found { pos, close: true },
            Some(_) => start = pos + 1,
            None => return Scan::NeedMore { resume: pos },
        }
    }
    Scan::NeedMore {
        resume: buffer.len().saturating_sub(delimiter.len()).max(from.min(buffer.len())),
    }
}

/// Live MJPEG over HTTP (`multipart/x-mixed-replace`), as served by most IP
/// cameras and `/stream` endpoints. Ends when the server closes the stream;
/// reconnecting is left to whoever opened it.
pub struct MjpegSource {
    url: String,
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: MjpegParser,
    origin: Instant,
    seq: u64,
}

impl MjpegSource {
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(SourceError::HttpConnect)?;

        info!(url, "connecting to MJPEG stream");
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Open(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError::Open(format!(
                "{url}: HTTP status {}",
                response.status().as_u16()
            )));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

        info!(status = %response.status(), boundary, "connected to MJPEG stream");

        Ok(Self {
            url: url.to_string(),
            stream: response.bytes_stream().boxed(),
            parser: MjpegParser::new(&boundary),
            origin: Instant::now(),
            seq: 0,
        })
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        loop {
            if let Some(jpeg) = self.parser.next_jpeg() {
                let captured_at = self.origin.elapsed();
                let seq = self.seq;
                self.seq += 1;
                debug!(seq, bytes = jpeg.len(), "received MJPEG part");
                let image = decode_image(&jpeg)?;
                return Ok(Some(Frame::new(image, captured_at, Some(seq))));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(SourceError::HttpStream(e)),
                None => {
                    info!(url = self.url, closed = self.parser.is_closed(), "MJPEG stream ended");
                    return Ok(None);
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Extract the `boundary=` parameter from a multipart content type.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|param| {
        param
            .strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
