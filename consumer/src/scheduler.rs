use std::fmt;
use std::time::Duration;

use stream_gate_common::config::{ConfigError, MotionConfig, StreamConfig};
use tracing::{debug, trace};

/// Why a frame was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReason {
    /// Nothing has been submitted yet this session.
    ForcedFirst,
    /// Motion is off and the frame cleared the rate ceiling.
    Rate,
    /// Motion on this frame, or inside the post-motion hold window.
    Motion,
    /// Heartbeat: nothing was sent for `max_interval`.
    MaxInterval,
}

impl fmt::Display for SubmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmitReason::ForcedFirst => "forced_first",
            SubmitReason::Rate => "rate",
            SubmitReason::Motion => "motion",
            SubmitReason::MaxInterval => "max_interval",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Submit(SubmitReason),
    Skip,
}

impl Decision {
    pub fn is_submit(&self) -> bool {
        matches!(self, Decision::Submit(_))
    }

    pub fn reason(&self) -> Option<SubmitReason> {
        match self {
            Decision::Submit(reason) => Some(*reason),
            Decision::Skip => None,
        }
    }
}

/// Timing policy for one capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Target submissions per second; 0 means uncapped.
    pub fps: f64,
    pub motion_enabled: bool,
    pub post_motion: Duration,
    pub max_interval: Duration,
}

impl SchedulerConfig {
    pub fn from_config(stream: &StreamConfig, motion: &MotionConfig) -> Result<Self, ConfigError> {
        if !(stream.fps.is_finite() && stream.fps >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "stream.fps",
                reason: format!("must be a non-negative number, got {}", stream.fps),
            });
        }
        Ok(Self {
            fps: stream.fps,
            motion_enabled: motion.enabled,
            post_motion: seconds("motion.post_motion_secs", motion.post_motion_secs)?,
            max_interval: seconds("motion.max_interval_secs", motion.max_interval_secs)?,
        })
    }

    /// Shortest allowed gap between submissions, if the rate is capped.
    pub fn min_interval(&self) -> Option<Duration> {
        if self.fps > 0.0 {
            Some(Duration::try_from_secs_f64(1.0 / self.fps).unwrap_or(Duration::MAX))
        } else {
            None
        }
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidValue {
        field,
        reason: format!("must be a non-negative number of seconds, got {value}"),
    })
}

/// Decision counters, reported at the end of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub forced_first: u64,
    pub rate: u64,
    pub motion: u64,
    pub max_interval: u64,
    pub skipped: u64,
}

impl SchedulerStats {
    pub fn submitted(&self) -> u64 {
        self.forced_first + self.rate + self.motion + self.max_interval
    }

    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Submit(SubmitReason::ForcedFirst) => self.forced_first += 1,
            Decision::Submit(SubmitReason::Rate) => self.rate += 1,
            Decision::Submit(SubmitReason::Motion) => self.motion += 1,
            Decision::Submit(SubmitReason::MaxInterval) => self.max_interval += 1,
            Decision::Skip => self.skipped += 1,
        }
    }
}

/// Decides, frame by frame, whether to submit.
///
/// Rules are checked in a fixed order and the first match wins:
///
/// 1. forced first: nothing submitted yet this session
/// 2. rate ceiling: closer than `1/fps` to the last submission, skip
/// 3. motion: motion on this frame (opens or extends the hold window), or
///    still inside the hold window; with motion disabled, any frame that
///    cleared the rate ceiling is submitted instead
/// 4. max interval: nothing submitted for `max_interval`
/// 5. skip
///
/// Timestamps are offsets from the source's monotonic origin. Boundaries
/// count as due: a frame exactly `max_interval` after the last submission is
/// sent, as is one exactly at the end of the hold window.
#[derive(Debug)]
pub struct CaptureScheduler {
    config: SchedulerConfig,
    min_interval: Option<Duration>,
    last_submit: Option<Duration>,
    motion_active_until: Option<Duration>,
    stats: SchedulerStats,
}

impl CaptureScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            config,
            last_submit: None,
            motion_active_until: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn decide(&mut self, now: Duration, motion: bool) -> Decision {
        let decision = self.evaluate(now, motion);
        self.stats.record(decision);
        match decision {
            Decision::Submit(reason) => {
                // Late frames never move the clock backwards
                self.last_submit = Some(self.last_submit.map_or(now, |last| last.max(now)));
                debug!(
                    t = format!("{:.3}", now.as_secs_f64()),
                    reason = %reason,
                    motion,
                    "submit"
                );
            }
            Decision::Skip => {
                trace!(t = format!("{:.3}", now.as_secs_f64()), motion, "skip");
            }
        }
        decision
    }

    fn evaluate(&mut self, now: Duration, motion: bool) -> Decision {
        let Some(last) = self.last_submit else {
            return Decision::Submit(SubmitReason::ForcedFirst);
        };
        let elapsed = now.saturating_sub(last);

        if let Some(min_interval) = self.min_interval {
            if elapsed < min_interval {
                return Decision::Skip;
            }
        }

        if self.config.motion_enabled {
            if motion {
                let until = now
                    .checked_add(self.config.post_motion)
                    .unwrap_or(Duration::MAX);
                self.motion_active_until =
                    Some(self.motion_active_until.map_or(until, |u| u.max(until)));
                return Decision::Submit(SubmitReason::Motion);
            }
            if self.motion_active_until.is_some_and(|until| now <= until) {
                return Decision::Submit(SubmitReason::Motion);
            }
        } else {
            return Decision::Submit(SubmitReason::Rate);
        }

        if elapsed >= self.config.max_interval {
            return Decision::Submit(SubmitReason::MaxInterval);
        }

        Decision::Skip
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn last_submit(&self) -> Option<Duration> {
        self.last_submit
    }

    pub fn motion_active_until(&self) -> Option<Duration> {
        self.motion_active_until
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}
