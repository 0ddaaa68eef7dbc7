use async_trait::async_trait;
use std::path::{Path, PathBuf};
use stream_gate_common::frame::Frame;
use tokio::time::Instant;
use tracing::debug;

use crate::{decode_image, FrameSource, SourceError};

/// A single image file, yielded once.
///
/// Video files need a decoder and are not handled here; a file that does
/// not decode as an image fails at open time.
pub struct StillImageSource {
    path: PathBuf,
    frame: Option<Frame>,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let origin = Instant::now();
        let bytes = std::fs::read(&path)
            .map_err(|e| SourceError::Open(format!("{}: {e}", path.display())))?;
        let image = decode_image(&bytes)
            .map_err(|e| SourceError::Open(format!("{}: {e}", path.display())))?;

        debug!(
            path = path.display().to_string(),
            width = image.width(),
            height = image.height(),
            "loaded still image"
        );

        Ok(Self {
            frame: Some(Frame::new(image, origin.elapsed(), Some(0))),
            path,
        })
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(self.frame.take())
    }

    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::encoded_image;
    use image::ImageFormat;

    #[tokio::test]
    async fn yields_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        std::fs::write(&path, encoded_image(10, 5, 200, ImageFormat::Png)).unwrap();

        let mut source = StillImageSource::open(&path).unwrap();
        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (10, 5));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn non_image_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42").unwrap();
        assert!(matches!(StillImageSource::open(&path), Err(SourceError::Open(_))));
    }
}
