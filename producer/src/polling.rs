use async_trait::async_trait;
use std::time::Duration;
use stream_gate_common::frame::Frame;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::pacing::Pacer;
use crate::{decode_image, FrameSource, SourceError};

/// Polls a single image URL (a camera snapshot endpoint, say) once per
/// frame. Never ends on its own.
///
/// A failed fetch is reported as a transient error so the caller can poll
/// again; the URL staying unreachable is the caller's problem to notice.
pub struct ImageUrlSource {
    url: String,
    client: reqwest::Client,
    pacer: Pacer,
    seq: u64,
}

impl ImageUrlSource {
    pub fn new(url: &str, fps: f64) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(SourceError::HttpConnect)?;
        info!(url, fps, "polling image URL");
        Ok(Self {
            url: url.to_string(),
            client,
            pacer: Pacer::new(fps),
            seq: 0,
        })
    }
}

#[async_trait]
impl FrameSource for ImageUrlSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let captured_at = self.pacer.wait().await;

        let started = Instant::now();
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(SourceError::HttpConnect)?;
        if !resp.status().is_success() {
            return Err(SourceError::HttpStatus(resp.status().as_u16()));
        }
        let body = resp.bytes().await.map_err(SourceError::HttpConnect)?;
        let image = decode_image(&body)?;

        let seq = self.seq;
        self.seq += 1;
        debug!(
            url = self.url,
            seq,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched image from URL"
        );
        Ok(Some(Frame::new(image, captured_at, Some(seq))))
    }

    fn name(&self) -> &str {
        &self.url
    }
}
