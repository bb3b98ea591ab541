use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::recordings::{RecordingConfig, RecordingFormat};
use crate::validation;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamSourceType {
  Rtsp,
  Hls,
  Mjpeg,
  File,
  Url,
  WebrtcDirect,
}

impl StreamSourceType {
  /// Pull sources are opened and probed by us; push sources deliver frames
  /// without a transport we can validate up front.
  pub fn is_pull(&self) -> bool {
    !matches!(self, StreamSourceType::WebrtcDirect)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceAuth {
  pub username: String,
  #[serde(default)]
  pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_secs: f64,
  #[serde(default)]
  pub max_retries: u32,
  #[serde(default = "default_backoff_start")]
  pub backoff_start_ms: u64,
  #[serde(default = "default_backoff_max")]
  pub backoff_max_ms: u64,
}

fn default_connect_timeout() -> f64 {
  10.0
}

fn default_backoff_start() -> u64 {
  500
}

fn default_backoff_max() -> u64 {
  10_000
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      connect_timeout_secs: default_connect_timeout(),
      max_retries: 0,
      backoff_start_ms: default_backoff_start(),
      backoff_max_ms: default_backoff_max(),
    }
  }
}

impl RetryPolicy {
  /// Per-attempt timeout. Values outside the validated range fall back to the default.
  pub fn connect_timeout(&self) -> Duration {
    validation::validate_period_secs(self.connect_timeout_secs, "connect_timeout_secs")
      .unwrap_or_else(|_| Duration::from_secs_f64(default_connect_timeout()))
  }

  /// Exponential backoff before retry `attempt` (1-based), capped at `backoff_max_ms`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let ms = self
      .backoff_start_ms
      .saturating_mul(1u64 << shift)
      .min(self.backoff_max_ms);
    Duration::from_millis(ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSourceConfig {
  #[serde(rename = "type")]
  pub source_type: StreamSourceType,
  pub url: String,
  #[serde(default)]
  pub auth: Option<SourceAuth>,
  #[serde(default)]
  pub retry_policy: Option<RetryPolicy>,
}

impl StreamSourceConfig {
  pub fn new(source_type: StreamSourceType, url: impl Into<String>) -> Self {
    Self {
      source_type,
      url: url.into(),
      auth: None,
      retry_policy: None,
    }
  }

  /// URL with credentials injected into the userinfo part, when configured
  /// and not already present.
  pub fn authenticated_url(&self) -> String {
    let Some(auth) = &self.auth else {
      return self.url.clone();
    };
    let Some((scheme, rest)) = self.url.split_once("://") else {
      return self.url.clone();
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.contains('@') {
      return self.url.clone();
    }
    match &auth.password {
      Some(password) => format!("{}://{}:{}@{}", scheme, auth.username, password, rest),
      None => format!("{}://{}@{}", scheme, auth.username, rest),
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
  RawH264,
  RawVp8,
  RawVp9,
  Webm,
  Mp4,
  Hls,
  Mjpeg,
}

impl OutputFormat {
  /// Container used when an output records without an explicit recording config.
  pub fn recording_format(&self) -> RecordingFormat {
    match self {
      OutputFormat::Mp4 => RecordingFormat::Mp4,
      OutputFormat::Webm | OutputFormat::RawVp8 | OutputFormat::RawVp9 => RecordingFormat::Webm,
      OutputFormat::Mjpeg => RecordingFormat::Mkv,
      OutputFormat::RawH264 | OutputFormat::Hls => RecordingFormat::Ts,
    }
  }
}

/// Per-output processing hints. Only `encrypt` changes pipeline behaviour;
/// the rest travels with the output as descriptive metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingOptions {
  #[serde(default)]
  pub encrypt: bool,
  #[serde(default)]
  pub width: Option<u32>,
  #[serde(default)]
  pub height: Option<u32>,
  #[serde(default)]
  pub frame_rate: Option<f64>,
  #[serde(default)]
  pub bitrate_kbps: Option<u32>,
  #[serde(default)]
  pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamOutputConfig {
  pub format: OutputFormat,
  #[serde(default)]
  pub processing_options: Option<ProcessingOptions>,
  #[serde(default)]
  pub recording_enabled: bool,
  #[serde(default)]
  pub recording_config: Option<RecordingConfig>,
}

impl StreamOutputConfig {
  pub fn new(format: OutputFormat) -> Self {
    Self {
      format,
      processing_options: None,
      recording_enabled: false,
      recording_config: None,
    }
  }

  pub fn recorded(format: OutputFormat, recording_config: RecordingConfig) -> Self {
    Self {
      format,
      processing_options: None,
      recording_enabled: true,
      recording_config: Some(recording_config),
    }
  }

  pub fn encrypts(&self) -> bool {
    self.processing_options.as_ref().is_some_and(|o| o.encrypt)
  }
}

pub fn output_key(index: usize) -> String {
  format!("output_{}", index)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
  Video,
  Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaTrackInfo {
  pub id: String,
  pub kind: TrackKind,
  pub codec: String,
  #[serde(default)]
  pub width: Option<u32>,
  #[serde(default)]
  pub height: Option<u32>,
  #[serde(default)]
  pub frame_rate: Option<f64>,
  #[serde(default)]
  pub bitrate: Option<u64>,
  #[serde(default)]
  pub sample_rate: Option<u32>,
  #[serde(default)]
  pub channels: Option<u32>,
}

impl MediaTrackInfo {
  pub fn video(id: impl Into<String>, codec: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      kind: TrackKind::Video,
      codec: codec.into(),
      width: None,
      height: None,
      frame_rate: None,
      bitrate: None,
      sample_rate: None,
      channels: None,
    }
  }

  pub fn audio(id: impl Into<String>, codec: impl Into<String>) -> Self {
    Self {
      kind: TrackKind::Audio,
      ..Self::video(id, codec)
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
  #[default]
  Unknown,
  Healthy,
  Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamHealthStatus {
  pub status: HealthState,
  pub last_frame_received_at: Option<DateTime<Utc>>,
  pub frame_delay_seconds: Option<f64>,
  pub bitrate: Option<f64>,
  pub frame_rate: Option<f64>,
  pub drop_rate: Option<f64>,
  pub error: Option<String>,
  pub checked_at: Option<DateTime<Utc>>,
}

impl StreamHealthStatus {
  /// Stamp a frame arrival. The stored timestamp only moves forward.
  pub fn record_frame(&mut self, at: DateTime<Utc>) {
    self.last_frame_received_at = Some(self.last_frame_received_at.map_or(at, |prev| prev.max(at)));
  }

  pub fn record_check(&mut self, at: DateTime<Utc>) {
    self.checked_at = Some(self.checked_at.map_or(at, |prev| prev.max(at)));
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
  Idle,
  Connecting,
  Streaming,
  Reconnecting,
  Stopped,
  Error,
}

impl PipelineState {
  /// Idle and Stopped are the only states without health evaluation.
  pub fn is_monitored(&self) -> bool {
    !matches!(self, PipelineState::Idle | PipelineState::Stopped)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      PipelineState::Idle => "idle",
      PipelineState::Connecting => "connecting",
      PipelineState::Streaming => "streaming",
      PipelineState::Reconnecting => "reconnecting",
      PipelineState::Stopped => "stopped",
      PipelineState::Error => "error",
    }
  }
}

impl fmt::Display for PipelineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
