use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Environment variable consulted when `[api] token` is absent.
pub const TOKEN_ENV_VAR: &str = "GROUNDLIGHT_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    pub detector_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f64,
    #[serde(default = "default_post_motion_secs")]
    pub post_motion_secs: f64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub crop: Option<CropSetting>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Where frames come from. `Infer` guesses from the source string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Infer,
    Device,
    Directory,
    Rtsp,
    Youtube,
    File,
    ImageUrl,
    Mjpeg,
}

impl SourceKind {
    /// Resolve `Infer` against a source identifier. Other kinds pass through.
    ///
    /// Returns `None` when nothing about the identifier gives its kind away.
    pub fn resolve(self, source: &str) -> Option<SourceKind> {
        if self != SourceKind::Infer {
            return Some(self);
        }
        if source.parse::<u32>().is_ok() {
            Some(SourceKind::Device)
        } else if source.contains('*') {
            Some(SourceKind::Directory)
        } else if source.starts_with("rtsp") {
            Some(SourceKind::Rtsp)
        } else if source.contains("youtube.com") {
            Some(SourceKind::Youtube)
        } else if Path::new(source).is_file() {
            Some(SourceKind::File)
        } else if source.starts_with("http") {
            Some(SourceKind::ImageUrl)
        } else {
            None
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Infer => "infer",
            SourceKind::Device => "device",
            SourceKind::Directory => "directory",
            SourceKind::Rtsp => "rtsp",
            SourceKind::Youtube => "youtube",
            SourceKind::File => "file",
            SourceKind::ImageUrl => "image_url",
            SourceKind::Mjpeg => "mjpeg",
        };
        f.write_str(name)
    }
}

/// Crop region as written in the config file: either `[x0, y0, x1, y1]`
/// or the command-line style string `"x0,y0,x1,y1"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CropSetting {
    Fractions([f64; 4]),
    Text(String),
}

/// A validated crop rectangle in fractional image coordinates.
///
/// Corners satisfy `0 <= x0 < x1 <= 1` and `0 <= y0 < y1 <= 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropFractions {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl CropFractions {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Result<Self, ConfigError> {
        for v in [x0, y0, x1, y1] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::InvalidCrop(format!(
                    "{v} is outside [0, 1]; crop values are fractions of the image"
                )));
            }
        }
        if x0 >= x1 {
            return Err(ConfigError::InvalidCrop(format!(
                "x0 ({x0}) must be less than x1 ({x1})"
            )));
        }
        if y0 >= y1 {
            return Err(ConfigError::InvalidCrop(format!(
                "y0 ({y0}) must be less than y1 ({y1})"
            )));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    /// Parse `"x0,y0,x1,y1"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(ConfigError::InvalidCrop(format!(
                "expected four comma-separated numbers, got {}",
                parts.len()
            )));
        }
        let mut values = [0.0f64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| ConfigError::InvalidCrop(format!("{part:?} is not a number")))?;
        }
        Self::new(values[0], values[1], values[2], values[3])
    }

    /// True when the region covers the whole image.
    pub fn is_full_frame(&self) -> bool {
        self.x0 == 0.0 && self.y0 == 0.0 && self.x1 == 1.0 && self.y1 == 1.0
    }
}

impl CropSetting {
    pub fn to_fractions(&self) -> Result<CropFractions, ConfigError> {
        match self {
            CropSetting::Fractions([x0, y0, x1, y1]) => CropFractions::new(*x0, *y0, *x1, *y1),
            CropSetting::Text(text) => CropFractions::parse(text),
        }
    }
}

impl ImageConfig {
    /// Validated crop region, if one is configured.
    pub fn crop_fractions(&self) -> Result<Option<CropFractions>, ConfigError> {
        self.crop.as_ref().map(CropSetting::to_fractions).transpose()
    }
}

impl ApiConfig {
    /// The configured token, or the one from the environment.
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty()))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every value the capture session depends on. Runs before any
    /// frame is read so a bad config never produces partial work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.detector_id.trim().is_empty() {
            return Err(invalid("api.detector_id", "must not be empty"));
        }
        if self.api.resolved_token().is_none() {
            return Err(ConfigError::MissingToken);
        }
        non_negative("stream.fps", self.stream.fps)?;
        non_negative("motion.post_motion_secs", self.motion.post_motion_secs)?;
        non_negative("motion.max_interval_secs", self.motion.max_interval_secs)?;
        if !(self.motion.threshold_percent.is_finite() && self.motion.threshold_percent > 0.0) {
            return Err(invalid("motion.threshold_percent", "must be greater than 0"));
        }
        self.image.crop_fractions()?;
        if self.image.width == Some(0) {
            return Err(invalid("image.width", "must be a positive number of pixels"));
        }
        if self.image.height == Some(0) {
            return Err(invalid("image.height", "must be a positive number of pixels"));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(invalid("dispatch.max_in_flight", "must be at least 1"));
        }
        if self.stream.fps == 0.0 && !self.motion.enabled {
            warn!("stream.fps is 0 and motion is disabled, every frame will be submitted");
        }
        Ok(())
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(field, &format!("must be a non-negative number, got {value}")))
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("invalid crop: {0}")]
    InvalidCrop(String),
    #[error("no API token: set [api] token or GROUNDLIGHT_API_TOKEN")]
    MissingToken,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            kind: SourceKind::default(),
            fps: default_fps(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_percent: default_threshold_percent(),
            post_motion_secs: default_post_motion_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_endpoint() -> String {
    "https://api.groundlight.ai/device-api".into()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_source() -> String {
    "0".into()
}
fn default_fps() -> f64 {
    5.0
}
fn default_threshold_percent() -> f64 {
    1.0
}
fn default_post_motion_secs() -> f64 {
    1.0
}
fn default_max_interval_secs() -> f64 {
    1000.0
}
fn default_max_in_flight() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}
