use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Holds a source to a target frame rate and stamps each frame with its
/// scheduled capture time. At 0 fps it never waits.
///
/// Stamps are tick deadlines, not the time the read finished, so two paced
/// frames are never closer than one period however long each read takes.
pub(crate) struct Pacer {
    origin: Instant,
    ticker: Option<Interval>,
}

impl Pacer {
    pub(crate) fn new(fps: f64) -> Self {
        let origin = Instant::now();
        let period = (fps > 0.0)
            .then(|| Duration::try_from_secs_f64(1.0 / fps).ok())
            .flatten()
            .filter(|p| !p.is_zero());
        let ticker = period.map(|period| {
            let mut ticker = tokio::time::interval_at(origin, period);
            // A slow read should not be followed by a burst of catch-up frames.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        Self { origin, ticker }
    }

    /// Wait until the next frame is due and return its capture time,
    /// measured from when the pacer was created. The first call returns
    /// immediately.
    pub(crate) async fn wait(&mut self) -> Duration {
        match &mut self.ticker {
            Some(ticker) => {
                let deadline = ticker.tick().await;
                deadline.saturating_duration_since(self.origin)
            }
            None => self.origin.elapsed(),
        }
    }
}
