use image::imageops::FilterType;
use stream_gate_common::config::{ConfigError, CropFractions, ImageConfig};
use stream_gate_common::frame::Frame;

/// Crop and resize applied to frames picked for submission.
///
/// Built once from validated settings; `process` is a pure function of the
/// input frame, so it can run on any task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FramePreprocessor {
    crop: Option<CropFractions>,
    width: Option<u32>,
    height: Option<u32>,
}

impl FramePreprocessor {
    pub fn new(crop: Option<CropFractions>, width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            // A full-frame crop is a no-op, keep it off the hot path
            crop: crop.filter(|c| !c.is_full_frame()),
            width: width.filter(|w| *w > 0),
            height: height.filter(|h| *h > 0),
        }
    }

    pub fn from_config(image: &ImageConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(image.crop_fractions()?, image.width, image.height))
    }

    /// True when `process` returns its input untouched.
    pub fn is_identity(&self) -> bool {
        self.crop.is_none() && self.width.is_none() && self.height.is_none()
    }

    pub fn process(&self, frame: &Frame) -> Frame {
        if self.is_identity() || frame.is_empty() {
            return frame.clone();
        }

        let cropped = match self.crop {
            Some(crop) => {
                let (x, y, w, h) = crop_bounds(frame.width(), frame.height(), &crop);
                frame.with_image(frame.image().crop_imm(x, y, w, h))
            }
            None => frame.clone(),
        };

        let (width, height) =
            target_size(cropped.width(), cropped.height(), self.width, self.height);
        if (width, height) == (cropped.width(), cropped.height()) {
            return cropped;
        }
        cropped.with_image(
            cropped
                .image()
                .resize_exact(width, height, FilterType::Triangle),
        )
    }
}

/// Pixel rectangle `(x, y, width, height)` for a fractional crop. The near
/// edge rounds down and the far edge rounds up, so the region is never
/// empty.
fn crop_bounds(width: u32, height: u32, crop: &CropFractions) -> (u32, u32, u32, u32) {
    let (x0, x1) = span(width, crop.x0, crop.x1);
    let (y0, y1) = span(height, crop.y0, crop.y1);
    (x0, y0, x1 - x0, y1 - y0)
}

fn span(len: u32, from: f64, to: f64) -> (u32, u32) {
    let len_f = len as f64;
    let start = ((from * len_f).floor() as u32).min(len.saturating_sub(1));
    let end = ((to * len_f).ceil() as u32).min(len).max(start + 1);
    (start, end)
}

/// Output size for the requested width and/or height. A single dimension
/// keeps the aspect ratio, truncating the other side (but never below 1).
fn target_size(
    width: u32,
    height: u32,
    target_w: Option<u32>,
    target_h: Option<u32>,
) -> (u32, u32) {
    match (target_w, target_h) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale(height, w, width)),
        (None, Some(h)) => (scale(width, h, height), h),
        (None, None) => (width, height),
    }
}

fn scale(side: u32, numerator: u32, denominator: u32) -> u32 {
    ((side as u64 * numerator as u64) / denominator.max(1) as u64).clamp(1, u32::MAX as u64) as u32
}
