use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;

/// A decoded camera frame with capture metadata.
///
/// Pixels live behind an `Arc`, so cloning a frame is cheap and every clone
/// is an immutable snapshot. This is what lets a submitted frame travel to a
/// dispatch task while the capture loop keeps pulling new frames.
///
/// `captured_at` is measured from the producing source's monotonic origin,
/// not wall-clock time, so it never jumps backwards with NTP adjustments.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<DynamicImage>,
    pub captured_at: Duration,
    /// Sequence number assigned by the source, when it has one.
    pub seq: Option<u64>,
}

impl Frame {
    pub fn new(image: DynamicImage, captured_at: Duration, seq: Option<u64>) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
            seq,
        }
    }

    /// Wrap a derived image while keeping this frame's timestamp and sequence.
    pub fn with_image(&self, image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: self.captured_at,
            seq: self.seq,
        }
    }

    // -- Convenience accessors --------------------------------------------------

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Number of colour channels per pixel (1 for luma, 3 for RGB, 4 for RGBA).
    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    /// Returns true if the frame has no pixels.
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Returns true if both frames share the same pixel buffer.
    pub fn shares_pixels(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }

    /// Capture timestamp in fractional seconds, for logging.
    pub fn captured_secs(&self) -> f64 {
        self.captured_at.as_secs_f64()
    }
}
