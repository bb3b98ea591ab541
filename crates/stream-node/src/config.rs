use anyhow::{anyhow, Context, Result};
use common::recordings::RecordingConfig;
use common::streams::{StreamOutputConfig, StreamSourceConfig};
use common::validation;
use frame_crypto::EncryptionConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthMonitorPolicy {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_check_interval")]
  pub check_interval_secs: f64,
  #[serde(default = "default_max_frame_delay")]
  pub max_frame_delay_secs: f64,
  #[serde(default = "default_true")]
  pub auto_reconnect: bool,
  /// Reconnects without a frame in between before the monitor gives up, 0 = never
  #[serde(default = "default_max_reconnect_attempts")]
  pub max_reconnect_attempts: u32,
}

fn default_true() -> bool {
  true
}

fn default_check_interval() -> f64 {
  5.0
}

fn default_max_frame_delay() -> f64 {
  10.0
}

fn default_max_reconnect_attempts() -> u32 {
  5
}

impl Default for HealthMonitorPolicy {
  fn default() -> Self {
    Self {
      enabled: true,
      check_interval_secs: default_check_interval(),
      max_frame_delay_secs: default_max_frame_delay(),
      auto_reconnect: true,
      max_reconnect_attempts: default_max_reconnect_attempts(),
    }
  }
}

impl HealthMonitorPolicy {
  /// Falls back to the default when the configured value is out of range
  pub fn check_interval(&self) -> Duration {
    validation::validate_period_secs(self.check_interval_secs, "health.check_interval_secs")
      .unwrap_or_else(|_| Duration::from_secs_f64(default_check_interval()))
  }

  pub fn max_frame_delay(&self) -> Duration {
    validation::validate_period_secs(self.max_frame_delay_secs, "health.max_frame_delay_secs")
      .unwrap_or_else(|_| Duration::from_secs_f64(default_max_frame_delay()))
  }

  /// `attempts` counts reconnects since the last frame arrived
  pub fn reconnects_exhausted(&self, attempts: u32) -> bool {
    self.max_reconnect_attempts > 0 && attempts >= self.max_reconnect_attempts
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
  pub stream_id: String,
  pub source: StreamSourceConfig,
  pub outputs: Vec<StreamOutputConfig>,
  /// Scratch space; defaults to `$TMPDIR/vms-ingest`
  #[serde(default)]
  pub temp_dir: Option<PathBuf>,
  #[serde(default)]
  pub health: Option<HealthMonitorPolicy>,
  /// Engine settings for outputs with `processing_options.encrypt`
  #[serde(default)]
  pub encryption: Option<EncryptionConfig>,
}

impl PipelineConfig {
  pub fn new(stream_id: impl Into<String>, source: StreamSourceConfig) -> Self {
    Self {
      stream_id: stream_id.into(),
      source,
      outputs: Vec::new(),
      temp_dir: None,
      health: None,
      encryption: None,
    }
  }

  pub fn with_output(mut self, output: StreamOutputConfig) -> Self {
    self.outputs.push(output);
    self
  }

  pub fn from_yaml_str(yaml: &str) -> Result<Self> {
    serde_yaml::from_str(yaml).context("failed to parse pipeline config")
  }

  pub fn from_yaml_file(path: &Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read pipeline config {}", path.display()))?;
    Self::from_yaml_str(&raw)
  }

  /// Fill in the temp dir, the health policy and missing recording configs.
  pub fn with_defaults(mut self) -> Self {
    let temp_dir = self
      .temp_dir
      .get_or_insert_with(|| env::temp_dir().join("vms-ingest"))
      .clone();
    self.health.get_or_insert_with(HealthMonitorPolicy::default);
    for output in &mut self.outputs {
      if output.recording_enabled && output.recording_config.is_none() {
        let mut recording = RecordingConfig::new(temp_dir.join("recordings"));
        recording.format = output.format.recording_format();
        output.recording_config = Some(recording);
      }
    }
    self
  }

  pub fn health_policy(&self) -> HealthMonitorPolicy {
    self.health.clone().unwrap_or_default()
  }

  pub fn validate(&self) -> Result<()> {
    validation::validate_id(&self.stream_id, "stream_id")?;
    validation::validate_uri(&self.source.url, "source.url")?;

    if let Some(policy) = &self.source.retry_policy {
      validation::validate_period_secs(policy.connect_timeout_secs, "source.retry_policy.connect_timeout_secs")?;
    }

    if self.outputs.is_empty() {
      return Err(anyhow!("at least one output is required"));
    }
    for (i, output) in self.outputs.iter().enumerate() {
      if output.recording_enabled {
        let recording = output
          .recording_config
          .as_ref()
          .ok_or_else(|| anyhow!("outputs[{}]: recording enabled without recording_config", i))?;
        recording.validate().with_context(|| format!("outputs[{}].recording_config", i))?;
      }
    }

    if let Some(policy) = &self.health {
      if policy.enabled {
        validation::validate_period_secs(policy.check_interval_secs, "health.check_interval_secs")?;
        validation::validate_period_secs(policy.max_frame_delay_secs, "health.max_frame_delay_secs")?;
      }
    }

    if let Some(encryption) = &self.encryption {
      validation::validate_optional_period_secs(
        encryption.key_rotation_interval_secs as f64,
        "encryption.key_rotation_interval_secs",
      )?;
    }
    Ok(())
  }
}

fn env_u32(key: &str, def: u32) -> u32 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(def)
}

fn env_u64(key: &str, def: u64) -> u64 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(def)
}

/// Process-level knobs for the `stream-node` binary
#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub recordings_root: PathBuf,
  pub ffmpeg_bin: String,
  pub ffprobe_bin: String,
  pub relay_chunk_bytes: usize,
  pub relay_max_retries: u32,
  pub relay_backoff_start_ms: u64,
  pub relay_backoff_max_ms: u64,
}

impl ServiceConfig {
  pub fn from_env() -> Result<Self> {
    let recordings_root =
      PathBuf::from(env::var("RECORDINGS_ROOT").unwrap_or_else(|_| "./data/recordings".to_string()));
    validation::validate_path_components(&recordings_root, None, "RECORDINGS_ROOT")?;

    let relay_chunk_bytes = env_u64("RELAY_CHUNK_BYTES", 64 * 1024);
    let relay_chunk_bytes = usize::try_from(relay_chunk_bytes)
      .ok()
      .filter(|n| *n > 0)
      .context("invalid RELAY_CHUNK_BYTES")?;

    Ok(Self {
      recordings_root,
      ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
      ffprobe_bin: env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()),
      relay_chunk_bytes,
      relay_max_retries: env_u32("RESTART_MAX_RETRIES", 5),
      relay_backoff_start_ms: env_u64("RESTART_BACKOFF_MS_START", 500),
      relay_backoff_max_ms: env_u64("RESTART_BACKOFF_MS_MAX", 10_000),
    })
  }

  /// Recording outputs without their own config record under `RECORDINGS_ROOT`
  pub fn apply_defaults(&self, config: &mut PipelineConfig) {
    for output in &mut config.outputs {
      if output.recording_enabled && output.recording_config.is_none() {
        let mut recording = RecordingConfig::new(&self.recordings_root);
        recording.format = output.format.recording_format();
        output.recording_config = Some(recording);
      }
    }
  }
}
