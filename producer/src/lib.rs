//! Frame sources.
//!
//! Every source is a pull-based sequence: `next_frame()` yields the next
//! frame, `Ok(None)` once a finite source is exhausted, or a `SourceError`
//! that says whether pulling again makes sense.
//!
//! Sources that need a video decoder (devices, RTSP, YouTube) are rejected
//! at open time.

mod directory;
mod mjpeg;
mod pacing;
mod polling;
mod still;

use async_trait::async_trait;
use stream_gate_common::config::SourceKind;
use stream_gate_common::frame::Frame;
use tracing::info;

pub use directory::DirectorySource;
pub use mjpeg::MjpegSource;
pub use polling::ImageUrlSource;
pub use still::StillImageSource;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0} sources need a video decoder, which this build does not include")]
    Unsupported(SourceKind),
    #[error("cannot infer a source kind from {0:?}")]
    CannotInfer(String),
    #[error("failed to open source: {0}")]
    Open(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode image: {0}")]
    Decode(String),
}

impl SourceError {
    /// Transient errors mean "no frame this time"; the next pull may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Decode(_) | SourceError::HttpStatus(_) | SourceError::HttpConnect(_)
        )
    }
}

/// A pull-based sequence of frames in capture order.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `Ok(None)` signals end of stream.
    ///
    /// Callers race this against other events and may drop the future, so
    /// implementations must not lose a frame that was not yet returned.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Build a source of the given kind. `fps` paces sources that would
/// otherwise produce frames as fast as they can be read (0 disables pacing).
pub async fn open_source(
    kind: SourceKind,
    source: &str,
    fps: f64,
) -> Result<Box<dyn FrameSource>, SourceError> {
    let resolved = kind
        .resolve(source)
        .ok_or_else(|| SourceError::CannotInfer(source.to_string()))?;

    info!(source, requested = %kind, resolved = %resolved, "opening frame source");

    match resolved {
        SourceKind::Directory => Ok(Box::new(DirectorySource::open(source, fps)?)),
        SourceKind::File => Ok(Box::new(StillImageSource::open(source)?)),
        SourceKind::ImageUrl => Ok(Box::new(ImageUrlSource::new(source, fps)?)),
        SourceKind::Mjpeg => Ok(Box::new(MjpegSource::connect(source).await?)),
        other @ (SourceKind::Device | SourceKind::Rtsp | SourceKind::Youtube) => {
            Err(SourceError::Unsupported(other))
        }
        SourceKind::Infer => Err(SourceError::CannotInfer(source.to_string())),
    }
}

/// Decode an encoded image (JPEG, PNG, ...) from memory.
pub(crate) fn decode_image(bytes: &[u8]) -> Result<image::DynamicImage, SourceError> {
    image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| SourceError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| SourceError::Decode(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decoder_sources_are_unsupported() {
        for kind in [SourceKind::Device, SourceKind::Rtsp, SourceKind::Youtube] {
            let err = open_source(kind, "anything", 5.0).await.err().unwrap();
            assert!(matches!(err, SourceError::Unsupported(k) if k == kind));
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn inferred_device_is_unsupported() {
        let err = open_source(SourceKind::Infer, "0", 5.0).await.err().unwrap();
        assert!(matches!(err, SourceError::Unsupported(SourceKind::Device)));
    }

    #[tokio::test]
    async fn uninferable_source_rejected() {
        let err = open_source(SourceKind::Infer, "not-a-source", 5.0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::CannotInfer(_)));
    }

    #[test]
    fn decode_garbage_is_transient() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(err.is_transient());
    }
}
