use image::GrayImage;
use stream_gate_common::frame::Frame;
use tracing::{debug, info};

use super::traits::FrameFilter;

/// A pixel counts as changed only if its luma moved by more than this.
pub const PIXEL_NOISE_FLOOR: u8 = 20;

/// Frame-differencing motion detector.
///
/// Each frame is reduced to 8-bit luma and compared pixel by pixel with the
/// previous one. Motion is reported when the share of pixels whose intensity
/// changed by more than [`PIXEL_NOISE_FLOOR`] reaches `threshold_percent`.
///
/// The baseline always moves to the newest frame, so slow drift (daylight,
/// auto-exposure) never accumulates into a trigger.
pub struct MotionDetector {
    baseline: Option<GrayImage>,
    threshold_percent: f64,
    last_motion: bool,
}

impl MotionDetector {
    pub fn new(threshold_percent: f64) -> Self {
        Self {
            baseline: None,
            threshold_percent,
            last_motion: false,
        }
    }

    /// Result of the most recent comparison.
    pub fn last_motion(&self) -> bool {
        self.last_motion
    }

    fn changed_percent(previous: &GrayImage, current: &GrayImage) -> f64 {
        let total = current.as_raw().len();
        let changed = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .filter(|(a, b)| a.abs_diff(**b) > PIXEL_NOISE_FLOOR)
            .count();
        changed as f64 * 100.0 / total as f64
    }
}

impl FrameFilter for MotionDetector {
    fn detect(&mut self, frame: &Frame) -> bool {
        if frame.is_empty() {
            debug!(seq = frame.seq, "empty frame, keeping previous baseline");
            self.last_motion = false;
            return false;
        }

        let current = frame.image().to_luma8();

        let motion = match self.baseline.take() {
            None => {
                debug!(
                    width = current.width(),
                    height = current.height(),
                    "first frame, storing motion baseline"
                );
                false
            }
            Some(previous) if previous.dimensions() != current.dimensions() => {
                info!(
                    from = format!("{}x{}", previous.width(), previous.height()),
                    to = format!("{}x{}", current.width(), current.height()),
                    "frame size changed, resetting motion baseline"
                );
                false
            }
            Some(previous) => {
                let pct = Self::changed_percent(&previous, &current);
                let motion = pct >= self.threshold_percent;
                debug!(
                    changed_pct = format!("{:.3}", pct),
                    threshold = self.threshold_percent,
                    motion,
                    "motion comparison"
                );
                motion
            }
        };

        self.baseline = Some(current);
        self.last_motion = motion;
        motion
    }

    fn name(&self) -> &str {
        "motion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Luma, RgbImage};
    use std::time::Duration;

    fn gray_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(
            DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value]))),
            Duration::ZERO,
            None,
        )
    }

    /// A 10x10 gray frame with the first `changed` pixels brightened by `delta`.
    fn frame_with_changes(changed: usize, delta: u8) -> Frame {
        let mut img = GrayImage::from_pixel(10, 10, Luma([100]));
        for (i, pixel) in img.pixels_mut().enumerate() {
            if i < changed {
                pixel.0[0] = 100 + delta;
            }
        }
        Frame::new(DynamicImage::ImageLuma8(img), Duration::ZERO, None)
    }

    #[test]
    fn first_frame_is_never_motion() {
        let mut detector = MotionDetector::new(1.0);
        assert!(!detector.detect(&gray_frame(8, 8, 0)));
        assert!(detector.baseline.is_some());
    }

    #[test]
    fn identical_frames_are_still() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(8, 8, 120));
        assert!(!detector.detect(&gray_frame(8, 8, 120)));
    }

    #[test]
    fn large_change_is_motion() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(8, 8, 0));
        assert!(detector.detect(&gray_frame(8, 8, 255)));
        assert!(detector.last_motion());
    }

    #[test]
    fn threshold_is_inclusive() {
        // 1 of 100 pixels changed is exactly 1%
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&frame_with_changes(0, 0));
        assert!(detector.detect(&frame_with_changes(1, 60)));

        let mut detector = MotionDetector::new(2.0);
        detector.detect(&frame_with_changes(0, 0));
        assert!(!detector.detect(&frame_with_changes(1, 60)));
    }

    #[test]
    fn changes_at_noise_floor_are_ignored() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&frame_with_changes(0, 0));
        // Every pixel moved, but only by the noise floor itself
        assert!(!detector.detect(&frame_with_changes(100, PIXEL_NOISE_FLOOR)));
        assert!(detector.detect(&frame_with_changes(100, PIXEL_NOISE_FLOOR + 1)));
    }

    #[test]
    fn moderate_change_counts() {
        // A 30-level shift across the frame is motion, 15 is sensor noise
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(8, 8, 100));
        assert!(!detector.detect(&gray_frame(8, 8, 115)));
        assert!(detector.detect(&gray_frame(8, 8, 145)));
    }

    #[test]
    fn baseline_slides_to_latest_frame() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(8, 8, 0));
        assert!(detector.detect(&gray_frame(8, 8, 200)));
        // Compared against the 200 frame now, not the original 0 frame
        assert!(!detector.detect(&gray_frame(8, 8, 200)));
    }

    #[test]
    fn resolution_change_resets_baseline() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(640, 480, 0));
        assert!(!detector.detect(&gray_frame(320, 240, 255)));
        assert_eq!(
            detector.baseline.as_ref().map(|b| b.dimensions()),
            Some((320, 240))
        );
        // The next frame of the new size is compared normally
        assert!(detector.detect(&gray_frame(320, 240, 0)));
    }

    #[test]
    fn empty_frame_keeps_baseline() {
        let mut detector = MotionDetector::new(1.0);
        detector.detect(&gray_frame(4, 4, 0));
        assert!(!detector.detect(&gray_frame(0, 0, 0)));
        assert_eq!(detector.baseline.as_ref().map(|b| b.dimensions()), Some((4, 4)));
        assert!(detector.detect(&gray_frame(4, 4, 255)));
    }

    #[test]
    fn colour_frames_compare_by_luma() {
        let mut detector = MotionDetector::new(1.0);
        let red = RgbImage::from_pixel(6, 6, image::Rgb([120, 0, 0]));
        let blue = RgbImage::from_pixel(6, 6, image::Rgb([0, 0, 255]));
        detector.detect(&Frame::new(DynamicImage::ImageRgb8(red), Duration::ZERO, None));
        // Dark red (luma 25) and pure blue (luma 18) differ by less than the floor
        assert!(!detector.detect(&Frame::new(
            DynamicImage::ImageRgb8(blue),
            Duration::ZERO,
            None
        )));
    }
}
