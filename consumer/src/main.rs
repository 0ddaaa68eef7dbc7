use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stream_gate::dispatch::{DispatchPolicy, Dispatcher};
use stream_gate::filter::{FrameFilter, MotionDetector};
use stream_gate::preprocess::FramePreprocessor;
use stream_gate::scheduler::{CaptureScheduler, SchedulerConfig};
use stream_gate::session::{CaptureSession, SessionError, SessionReport};
use stream_gate_api::HttpSubmissionClient;
use stream_gate_common::config::{Config, ConfigError};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!(
        endpoint = config.api.endpoint,
        detector_id = config.api.detector_id,
        source = config.stream.source,
        kind = %config.stream.kind,
        fps = config.stream.fps,
        motion = config.motion.enabled,
        threshold_pct = config.motion.threshold_percent,
        post_motion_secs = config.motion.post_motion_secs,
        max_interval_secs = config.motion.max_interval_secs,
        max_in_flight = config.dispatch.max_in_flight,
        "starting stream-gate"
    );

    match run(config).await {
        Ok(report) => report.log_summary(),
        Err(e) => {
            error!(error = %e, "capture session failed");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<SessionReport, SessionError> {
    // Everything that can be rejected is checked before the source opens
    let scheduler = CaptureScheduler::new(SchedulerConfig::from_config(
        &config.stream,
        &config.motion,
    )?);
    let preprocessor = FramePreprocessor::from_config(&config.image)?;
    let token = config
        .api
        .resolved_token()
        .ok_or(ConfigError::MissingToken)?;

    let client = HttpSubmissionClient::new(
        &config.api.endpoint,
        &token,
        &config.api.detector_id,
        Duration::from_secs(config.api.timeout_secs),
    )?;
    if let Err(e) = client.whoami().await {
        if !e.is_transient() {
            return Err(e.into());
        }
        warn!(error = %e, "could not verify API credentials, continuing");
    }

    let source = stream_gate_producer::open_source(
        config.stream.kind,
        &config.stream.source,
        config.stream.fps,
    )
    .await?;

    let motion: Option<Box<dyn FrameFilter>> = if config.motion.enabled {
        Some(Box::new(MotionDetector::new(config.motion.threshold_percent)))
    } else {
        None
    };

    let dispatcher = Dispatcher::new(
        Arc::new(client),
        DispatchPolicy::from_config(&config.dispatch),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = cancel_tx.send(true);
            }
            Err(e) => {
                // Keep the sender alive so the session is not taken as cancelled
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    });

    CaptureSession::new(
        source,
        motion,
        scheduler,
        preprocessor,
        dispatcher,
        Duration::from_secs(config.dispatch.shutdown_grace_secs),
    )
    .run(cancel_rx)
    .await
}
