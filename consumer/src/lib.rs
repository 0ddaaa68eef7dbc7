//! Motion-gated frame submission.
//!
//! Frames flow source → motion filter → scheduler → preprocessor →
//! dispatcher, one at a time and in capture order. Only the final
//! submission runs concurrently with intake.

pub mod dispatch;
pub mod filter;
pub mod preprocess;
pub mod scheduler;
pub mod session;
