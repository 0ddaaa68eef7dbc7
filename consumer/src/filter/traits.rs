use stream_gate_common::frame::Frame;

/// Per-frame change detector consulted by the capture session.
///
/// Implementations are stateful: each call compares the frame against
/// whatever they remember from earlier frames, so calls must arrive in
/// capture order.
pub trait FrameFilter: Send {
    /// Returns `true` if this frame differs enough from the previous one to
    /// count as activity.
    fn detect(&mut self, frame: &Frame) -> bool;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
