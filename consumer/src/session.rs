use std::fmt;
use std::time::Duration;

use stream_gate_api::{QueryHandle, SubmissionError};
use stream_gate_common::config::ConfigError;
use stream_gate_common::frame::Frame;
use stream_gate_producer::{FrameSource, SourceError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::filter::FrameFilter;
use crate::preprocess::FramePreprocessor;
use crate::scheduler::{CaptureScheduler, SchedulerStats};

/// Pause before pulling again after a frame could not be read.
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("frame source failed: {0}")]
    Source(#[from] SourceError),
    #[error("submission failed: {0}")]
    Submission(#[from] SubmissionError),
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    Cancelled,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::EndOfStream => f.write_str("end of stream"),
            SessionEnd::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub frames: u64,
    pub decisions: SchedulerStats,
    pub handles: Vec<QueryHandle>,
    /// Frames picked for submission that never got a query handle.
    pub abandoned: u64,
    /// Frames whose handling took longer than one frame period.
    pub overruns: u64,
    pub end: SessionEnd,
}

impl SessionReport {
    pub fn log_summary(&self) {
        info!(
            end = %self.end,
            frames = self.frames,
            submitted = self.decisions.submitted(),
            skipped = self.decisions.skipped,
            forced_first = self.decisions.forced_first,
            rate = self.decisions.rate,
            motion = self.decisions.motion,
            max_interval = self.decisions.max_interval,
            queries = self.handles.len(),
            abandoned = self.abandoned,
            overruns = self.overruns,
            "capture session finished"
        );
    }
}

/// One streaming session: pulls frames in order, runs them through the
/// motion filter and scheduler, and hands selected frames to the dispatcher.
///
/// Motion and scheduler state live here and die with the session.
pub struct CaptureSession {
    source: Box<dyn FrameSource>,
    motion: Option<Box<dyn FrameFilter>>,
    scheduler: CaptureScheduler,
    preprocessor: FramePreprocessor,
    dispatcher: Dispatcher,
    shutdown_grace: Duration,
    frames: u64,
    overruns: u64,
}

impl CaptureSession {
    /// `motion` is `None` when motion detection is disabled.
    pub fn new(
        source: Box<dyn FrameSource>,
        motion: Option<Box<dyn FrameFilter>>,
        scheduler: CaptureScheduler,
        preprocessor: FramePreprocessor,
        dispatcher: Dispatcher,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            source,
            motion,
            scheduler,
            preprocessor,
            dispatcher,
            shutdown_grace,
            frames: 0,
            overruns: 0,
        }
    }

    /// Run until the source ends, `cancel` flips to `true`, or something
    /// fails for good.
    ///
    /// Cancellation is honoured while waiting for a frame and while waiting
    /// for dispatch capacity, so shutdown never takes much longer than the
    /// grace period.
    pub async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, SessionError> {
        info!(
            source = self.source.name(),
            filter = self.motion.as_ref().map(|m| m.name()).unwrap_or("none"),
            "capture session started"
        );
        let frame_period = self.scheduler.config().min_interval();

        let end = 'intake: loop {
            if *cancel.borrow() {
                break SessionEnd::Cancelled;
            }

            let next = tokio::select! {
                biased;
                changed = cancel.changed() => {
                    // A dropped sender means nobody is left to keep us running
                    if changed.is_err() || *cancel.borrow() {
                        break SessionEnd::Cancelled;
                    }
                    continue;
                }
                finished = self.dispatcher.next_finished() => {
                    if let Err(e) = finished {
                        error!(error = %e, "stopping capture session");
                        return Err(e.into());
                    }
                    continue;
                }
                next = self.source.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break SessionEnd::EndOfStream,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "no frame captured, retrying");
                    tokio::time::sleep(SOURCE_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "frame source failed");
                    self.dispatcher.abort();
                    return Err(e.into());
                }
            };

            let started = Instant::now();
            if let Some(selected) = self.select(frame) {
                while !self.dispatcher.has_capacity() {
                    tokio::select! {
                        biased;
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                self.dispatcher.abandon(&selected);
                                break 'intake SessionEnd::Cancelled;
                            }
                        }
                        ready = self.dispatcher.wait_for_capacity() => {
                            if let Err(e) = ready {
                                error!(error = %e, "stopping capture session");
                                return Err(e.into());
                            }
                        }
                    }
                }
                self.dispatcher.spawn(selected);
            }
            self.check_pace(frame_period, started.elapsed());
        };

        info!(end = %end, frames = self.frames, "frame intake stopped");
        self.dispatcher.finish(self.shutdown_grace).await?;

        let (handles, abandoned) = self.dispatcher.into_results();
        Ok(SessionReport {
            frames: self.frames,
            decisions: self.scheduler.stats(),
            handles,
            abandoned,
            overruns: self.overruns,
            end,
        })
    }

    /// Run motion detection and the scheduler on one frame. Returns the
    /// preprocessed frame when it should be submitted.
    fn select(&mut self, frame: Frame) -> Option<Frame> {
        self.frames += 1;
        if self.frames % 100 == 0 {
            debug!(frames = self.frames, "frames processed");
        }

        if frame.is_empty() {
            warn!(seq = frame.seq, "empty frame from source, ignoring");
            return None;
        }

        let motion = match self.motion.as_mut() {
            Some(filter) => filter.detect(&frame),
            None => false,
        };

        let decision = self.scheduler.decide(frame.captured_at, motion);
        decision
            .is_submit()
            .then(|| self.preprocessor.process(&frame))
    }

    /// Warn when handling a frame took longer than the frame period, which
    /// means the source is read slower than the configured rate.
    fn check_pace(&mut self, frame_period: Option<Duration>, took: Duration) {
        let Some(period) = frame_period else {
            return;
        };
        if took > period {
            self.overruns += 1;
            warn!(
                fps = self.scheduler.config().fps,
                took_ms = took.as_millis() as u64,
                period_ms = period.as_millis() as u64,
                "cannot maintain configured frame rate"
            );
        }
    }
}
