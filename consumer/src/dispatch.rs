use std::sync::Arc;
use std::time::Duration;

use stream_gate_api::{QueryHandle, SubmissionClient, SubmissionError};
use stream_gate_common::config::DispatchConfig;
use stream_gate_common::frame::Frame;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Limits for in-flight submissions and their retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_in_flight: usize,
    /// Retries after the first attempt. Only transient errors are retried.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight.max(1),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Submit one frame, retrying transient failures with exponential backoff.
///
/// Returns the first success, the first permanent error, or the last
/// transient error once the retry budget is spent.
pub async fn submit_with_retry(
    client: &dyn SubmissionClient,
    frame: &Frame,
    policy: &DispatchPolicy,
) -> Result<QueryHandle, SubmissionError> {
    let mut delay = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        let err = match client.submit(frame).await {
            Ok(handle) => return Ok(handle),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;

        // Honour the server's requested wait when it sends one
        let wait = err.retry_after().unwrap_or(delay);
        warn!(
            seq = frame.seq,
            attempt,
            max_retries = policy.max_retries,
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "submission failed, retrying"
        );
        tokio::time::sleep(wait).await;
        delay = delay.saturating_mul(2).min(policy.max_backoff);
    }
}

type TaskResult = (Option<u64>, Result<QueryHandle, SubmissionError>);

/// Runs submissions as background tasks, at most `max_in_flight` at a time.
///
/// `dispatch` returns once the frame's task is spawned. When the cap is
/// reached it first waits for a running submission to finish, so intake
/// slows down instead of frames being dropped.
pub struct Dispatcher {
    client: Arc<dyn SubmissionClient>,
    policy: DispatchPolicy,
    tasks: JoinSet<TaskResult>,
    handles: Vec<QueryHandle>,
    abandoned: u64,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn SubmissionClient>, policy: DispatchPolicy) -> Self {
        Self {
            client,
            policy,
            tasks: JoinSet::new(),
            handles: Vec::new(),
            abandoned: 0,
        }
    }

    /// Queue a frame for submission. Fails only when an earlier submission
    /// hit a permanent error; the remaining tasks are aborted in that case.
    pub async fn dispatch(&mut self, frame: Frame) -> Result<(), SubmissionError> {
        self.wait_for_capacity().await?;
        self.spawn(frame);
        Ok(())
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.policy.max_in_flight
    }

    /// Wait until another submission may start. Cancel safe: dropping the
    /// future loses no results.
    pub async fn wait_for_capacity(&mut self) -> Result<(), SubmissionError> {
        self.reap()?;
        while !self.has_capacity() {
            debug!(in_flight = self.tasks.len(), "dispatch at capacity, waiting");
            match self.tasks.join_next().await {
                Some(joined) => self.record(joined)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Start a submission without checking the cap. Callers wait for
    /// capacity first.
    pub fn spawn(&mut self, frame: Frame) {
        let client = Arc::clone(&self.client);
        let policy = self.policy.clone();
        self.tasks.spawn(async move {
            let result = submit_with_retry(client.as_ref(), &frame, &policy).await;
            (frame.seq, result)
        });
    }

    /// Resolve when the next running submission finishes. Never resolves
    /// while nothing is in flight. Cancel safe.
    pub async fn next_finished(&mut self) -> Result<(), SubmissionError> {
        match self.tasks.join_next().await {
            Some(joined) => self.record(joined),
            None => std::future::pending().await,
        }
    }

    /// Count a frame that was picked for submission but never sent.
    pub fn abandon(&mut self, frame: &Frame) {
        debug!(seq = frame.seq, "dropping frame that was never sent");
        self.abandoned += 1;
    }

    /// Collect submissions that already finished, without waiting.
    pub fn reap(&mut self) -> Result<(), SubmissionError> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined)?;
        }
        Ok(())
    }

    /// Wait up to `grace` for outstanding submissions, then abort the rest.
    pub async fn finish(&mut self, grace: Duration) -> Result<(), SubmissionError> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        info!(
            in_flight = self.tasks.len(),
            grace_secs = grace.as_secs_f64(),
            "waiting for in-flight submissions"
        );

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                self.record(joined)?;
            }
            Ok::<(), SubmissionError>(())
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => {
                let remaining = self.tasks.len() as u64;
                warn!(remaining, "grace period elapsed, abandoning submissions");
                self.abort();
                self.abandoned += remaining;
                Ok(())
            }
        }
    }

    /// Drop every running submission.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
        self.tasks.detach_all();
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn handles(&self) -> &[QueryHandle] {
        &self.handles
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    pub fn into_results(self) -> (Vec<QueryHandle>, u64) {
        (self.handles, self.abandoned)
    }

    fn record(&mut self, joined: Result<TaskResult, JoinError>) -> Result<(), SubmissionError> {
        match joined {
            Ok((seq, Ok(handle))) => {
                info!(seq, query_id = handle.id, "frame submitted");
                self.handles.push(handle);
                Ok(())
            }
            Ok((seq, Err(e))) if e.is_transient() => {
                warn!(seq, error = %e, "retries exhausted, skipping frame");
                self.abandoned += 1;
                Ok(())
            }
            Ok((seq, Err(e))) => {
                self.abort();
                warn!(seq, error = %e, "permanent submission failure");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "submission task did not complete");
                self.abandoned += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Client that replays a fixed script of results, then succeeds.
    pub struct ScriptedClient {
        script: Mutex<VecDeque<Result<(), SubmissionError>>>,
        delay: Duration,
        pub calls: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedClient {
        pub fn new(script: Vec<Result<(), SubmissionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SubmissionClient for ScriptedClient {
        async fn submit(&self, frame: &Frame) -> Result<QueryHandle, SubmissionError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(frame.seq);
                calls.len()
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Err(e)) => Err(e),
                _ => Ok(QueryHandle {
                    id: format!("iq_{n}"),
                }),
            }
        }
    }

    pub fn test_frame(seq: u64) -> Frame {
        use image::{DynamicImage, RgbImage};
        Frame::new(
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
            Duration::from_millis(seq * 100),
            Some(seq),
        )
    }

    pub fn fast_policy(max_in_flight: usize, max_retries: u32) -> DispatchPolicy {
        DispatchPolicy {
            max_in_flight,
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }
}
