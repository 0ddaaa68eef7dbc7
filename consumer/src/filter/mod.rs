pub mod motion;
pub mod traits;

pub use motion::MotionDetector;
pub use traits::FrameFilter;
