use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::validation;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
  #[default]
  Mp4,
  Mkv,
  Ts,
  Webm,
}

impl RecordingFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      RecordingFormat::Mp4 => "mp4",
      RecordingFormat::Mkv => "mkv",
      RecordingFormat::Ts => "ts",
      RecordingFormat::Webm => "webm",
    }
  }
}

impl fmt::Display for RecordingFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.extension())
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingQuality {
  High,
  #[default]
  Medium,
  Low,
}

/// Per-recorder settings. Field names on the wire follow the recording
/// configuration surface (`outputDir`, `segmentDuration`, `maxSegmentSize`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
  pub output_dir: PathBuf,
  #[serde(default)]
  pub format: RecordingFormat,
  #[serde(default)]
  pub quality: RecordingQuality,
  /// Seconds, 0 = unbounded
  #[serde(default, rename = "segmentDuration")]
  pub segment_duration_secs: f64,
  /// Megabytes, 0 = unbounded
  #[serde(default, rename = "maxSegmentSize")]
  pub max_segment_size_mb: f64,
  #[serde(default = "default_true")]
  pub include_audio: bool,
  #[serde(default)]
  pub generate_thumbnails: bool,
  #[serde(default = "default_thumbnail_interval", rename = "thumbnailInterval")]
  pub thumbnail_interval_secs: f64,
  #[serde(default = "default_true")]
  pub include_metadata: bool,
  #[serde(default = "default_name_prefix")]
  pub name_prefix: String,
  #[serde(default)]
  pub custom_metadata: BTreeMap<String, String>,
}

fn default_true() -> bool {
  true
}

fn default_thumbnail_interval() -> f64 {
  10.0
}

fn default_name_prefix() -> String {
  "recording".to_string()
}

impl RecordingConfig {
  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self {
      output_dir: output_dir.into(),
      format: RecordingFormat::default(),
      quality: RecordingQuality::default(),
      segment_duration_secs: 0.0,
      max_segment_size_mb: 0.0,
      include_audio: true,
      generate_thumbnails: false,
      thumbnail_interval_secs: default_thumbnail_interval(),
      include_metadata: true,
      name_prefix: default_name_prefix(),
      custom_metadata: BTreeMap::new(),
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.output_dir.as_os_str().is_empty() {
      return Err(anyhow!("outputDir is required"));
    }
    validation::validate_path_components(&self.output_dir, None, "outputDir")?;
    validation::validate_id(&self.name_prefix, "namePrefix")?;
    validation::validate_optional_period_secs(self.segment_duration_secs, "segmentDuration")?;
    validation::validate_non_negative_secs(self.max_segment_size_mb, "maxSegmentSize")?;
    if self.generate_thumbnails {
      validation::validate_period_secs(self.thumbnail_interval_secs, "thumbnailInterval")?;
    }
    Ok(())
  }

  /// Rotation period, `None` when disabled or out of the range `validate` accepts
  pub fn segment_duration(&self) -> Option<Duration> {
    validation::validate_optional_period_secs(self.segment_duration_secs, "segmentDuration")
      .ok()
      .flatten()
  }

  pub fn max_segment_size_bytes(&self) -> Option<u64> {
    (self.max_segment_size_mb > 0.0).then(|| ((self.max_segment_size_mb * BYTES_PER_MB) as u64).max(1))
  }

  pub fn thumbnail_interval(&self) -> Option<Duration> {
    if !self.generate_thumbnails {
      return None;
    }
    validation::validate_period_secs(self.thumbnail_interval_secs, "thumbnailInterval").ok()
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
  Idle,
  Recording,
  Paused,
  Stopped,
  Error,
}

impl RecordingState {
  pub fn is_active(&self) -> bool {
    matches!(self, RecordingState::Recording | RecordingState::Paused)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      RecordingState::Idle => "idle",
      RecordingState::Recording => "recording",
      RecordingState::Paused => "paused",
      RecordingState::Stopped => "stopped",
      RecordingState::Error => "error",
    }
  }
}

impl fmt::Display for RecordingState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
  pub id: String,
  pub index: u32,
  pub filename: String,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  pub duration_seconds: Option<f64>,
  pub size_bytes: u64,
  pub thumbnail_filename: Option<String>,
}

impl RecordingSegment {
  pub fn open(recording_id: &str, index: u32, format: RecordingFormat) -> Self {
    Self {
      id: format!("{}-{:05}", recording_id, index),
      index,
      filename: format!("segment_{}.{}", index, format.extension()),
      start_time: Utc::now(),
      end_time: None,
      duration_seconds: None,
      size_bytes: 0,
      thumbnail_filename: None,
    }
  }

  /// Stamp end time and duration. Consumes the open segment so the finalized
  /// value cannot be written to again.
  pub fn finalize(mut self, end_time: DateTime<Utc>) -> Self {
    let end_time = end_time.max(self.start_time);
    self.duration_seconds = Some(seconds_between(self.start_time, end_time));
    self.end_time = Some(end_time);
    self
  }

  pub fn is_finalized(&self) -> bool {
    self.end_time.is_some()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
  pub id: String,
  pub source_stream_id: Option<String>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub duration_seconds: Option<f64>,
  pub format: RecordingFormat,
  pub quality: RecordingQuality,
  pub segment_count: usize,
  pub total_size: u64,
  pub has_thumbnails: bool,
  pub custom_metadata: BTreeMap<String, String>,
  pub segments: Vec<RecordingSegment>,
}

impl RecordingMetadata {
  pub fn new(id: impl Into<String>, source_stream_id: Option<String>, config: &RecordingConfig) -> Self {
    Self {
      id: id.into(),
      source_stream_id,
      start_time: None,
      end_time: None,
      duration_seconds: None,
      format: config.format,
      quality: config.quality,
      segment_count: 0,
      total_size: 0,
      has_thumbnails: config.generate_thumbnails,
      custom_metadata: config.custom_metadata.clone(),
      segments: Vec::new(),
    }
  }

  /// Append a finalized segment, keeping `segment_count` and `total_size`
  /// consistent with `segments`.
  pub fn push_segment(&mut self, segment: RecordingSegment) {
    self.total_size += segment.size_bytes;
    self.segments.push(segment);
    self.segment_count = self.segments.len();
  }

  pub fn close(&mut self, end_time: DateTime<Utc>) {
    if let Some(start) = self.start_time {
      let end_time = end_time.max(start);
      self.duration_seconds = Some(seconds_between(start, end_time));
      self.end_time = Some(end_time);
    }
  }
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
  (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_recording_config_defaults_from_json() {
    let config: RecordingConfig = serde_json::from_str(r#"{"outputDir": "/data/rec"}"#).unwrap();
    assert_eq!(config.format, RecordingFormat::Mp4);
    assert_eq!(config.quality, RecordingQuality::Medium);
    assert_eq!(config.segment_duration(), None);
    assert_eq!(config.max_segment_size_bytes(), None);
    assert!(config.include_metadata);
    assert_eq!(config.name_prefix, "recording");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_recording_config_surface_names() {
    let json = r#"{
      "outputDir": "/data/rec",
      "format": "webm",
      "quality": "high",
      "segmentDuration": 60,
      "maxSegmentSize": 2,
      "generateThumbnails": true,
      "thumbnailInterval": 5,
      "namePrefix": "cam1",
      "customMetadata": {"site": "lobby"}
    }"#;
    let config: RecordingConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.format, RecordingFormat::Webm);
    assert_eq!(config.segment_duration(), Some(Duration::from_secs(60)));
    assert_eq!(config.max_segment_size_bytes(), Some(2 * 1024 * 1024));
    assert_eq!(config.thumbnail_interval(), Some(Duration::from_secs(5)));
    assert_eq!(config.custom_metadata.get("site").map(String::as_str), Some("lobby"));
  }

  #[test]
  fn test_recording_config_rejects_invalid_bounds() {
    let mut config = RecordingConfig::new("/data/rec");
    config.segment_duration_secs = -1.0;
    assert!(config.validate().is_err());

    let mut config = RecordingConfig::new("/data/rec");
    config.max_segment_size_mb = -0.5;
    assert!(config.validate().is_err());

    let mut config = RecordingConfig::new("/data/rec");
    config.generate_thumbnails = true;
    config.thumbnail_interval_secs = 0.0;
    assert!(config.validate().is_err());

    let mut config = RecordingConfig::new("/data/rec");
    config.segment_duration_secs = 1e20;
    assert!(config.validate().is_err());
    assert_eq!(config.segment_duration(), None);

    let mut config = RecordingConfig::new("/data/rec");
    config.segment_duration_secs = 1e-12;
    assert!(config.validate().is_err());
    assert_eq!(config.segment_duration(), None);

    let mut config = RecordingConfig::new("/data/rec");
    config.generate_thumbnails = true;
    config.thumbnail_interval_secs = 1e-9;
    assert!(config.validate().is_err());

    // interval is irrelevant when thumbnails are off
    let mut config = RecordingConfig::new("/data/rec");
    config.thumbnail_interval_secs = 0.0;
    assert!(config.validate().is_ok());

    let config = RecordingConfig::new("");
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_recording_state_is_active() {
    assert!(RecordingState::Recording.is_active());
    assert!(RecordingState::Paused.is_active());
    assert!(!RecordingState::Idle.is_active());
    assert!(!RecordingState::Stopped.is_active());
    assert!(!RecordingState::Error.is_active());
  }

  #[test]
  fn test_metadata_push_segment_keeps_totals() {
    let config = RecordingConfig::new("/data/rec");
    let mut metadata = RecordingMetadata::new("rec-1", None, &config);

    for (i, size) in [100u64, 250, 0].into_iter().enumerate() {
      let mut segment = RecordingSegment::open("rec-1", i as u32, config.format);
      segment.size_bytes = size;
      metadata.push_segment(segment.finalize(Utc::now()));
    }

    assert_eq!(metadata.segment_count, 3);
    assert_eq!(metadata.segment_count, metadata.segments.len());
    assert_eq!(metadata.total_size, 350);
  }

  #[test]
  fn test_segment_finalize_never_negative() {
    let segment = RecordingSegment::open("rec-1", 0, RecordingFormat::Ts);
    let earlier = segment.start_time - chrono::Duration::seconds(5);
    let segment = segment.finalize(earlier);
    assert_eq!(segment.duration_seconds, Some(0.0));
    assert_eq!(segment.filename, "segment_0.ts");
    assert!(segment.is_finalized());
  }
}
