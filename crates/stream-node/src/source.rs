//! Source connection: probing the transport, retrying with backoff and owning
//! any process a connector leaves running.

use async_trait::async_trait;
use common::streams::{MediaTrackInfo, StreamSourceConfig, StreamSourceType, TrackKind};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::PipelineError;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A running helper process tied to a pipeline connection. It is killed on
/// stop and on reconnect; the child must be spawned with `kill_on_drop`.
#[derive(Debug)]
pub struct OwnedProcess {
  label: String,
  child: Child,
}

impl OwnedProcess {
  pub fn new(label: impl Into<String>, child: Child) -> Self {
    Self {
      label: label.into(),
      child,
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn id(&self) -> Option<u32> {
    self.child.id()
  }

  /// Kill the process and reap it
  pub async fn terminate(mut self) {
    if let Err(e) = self.child.start_kill() {
      debug!(process = %self.label, error = %e, "process already gone");
    }
    match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
      Ok(Ok(status)) => info!(process = %self.label, %status, "process terminated"),
      Ok(Err(e)) => warn!(process = %self.label, error = %e, "failed to reap process"),
      Err(_) => warn!(process = %self.label, "process did not exit after kill"),
    }
  }
}

/// Result of a successful connect
#[derive(Debug, Default)]
pub struct SourceConnection {
  pub tracks: Vec<MediaTrackInfo>,
  pub process: Option<OwnedProcess>,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
  /// One connection attempt. Timeouts and retries are applied by the caller.
  async fn connect(&self, source: &StreamSourceConfig) -> Result<SourceConnection, PipelineError>;
}

/// Validates sources with `ffprobe`: the transport must open and report at
/// least one decodable stream.
#[derive(Debug, Clone)]
pub struct FfprobeConnector {
  ffprobe_bin: String,
}

impl Default for FfprobeConnector {
  fn default() -> Self {
    Self::new("ffprobe")
  }
}

impl FfprobeConnector {
  pub fn new(ffprobe_bin: impl Into<String>) -> Self {
    Self {
      ffprobe_bin: ffprobe_bin.into(),
    }
  }

  fn build_args(source: &StreamSourceConfig) -> Vec<String> {
    let mut args = vec![
      "-v".to_string(),
      "error".to_string(),
      "-print_format".to_string(),
      "json".to_string(),
      "-show_streams".to_string(),
    ];
    if source.source_type == StreamSourceType::Rtsp {
      args.push("-rtsp_transport".to_string());
      args.push("tcp".to_string());
    }
    args.push(source.authenticated_url());
    args
  }

  async fn probe(&self, source: &StreamSourceConfig) -> Result<Vec<MediaTrackInfo>, PipelineError> {
    let args = Self::build_args(source);
    debug!(url = %source.url, bin = %self.ffprobe_bin, "probing source");

    let output = Command::new(&self.ffprobe_bin)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| PipelineError::connection(&source.url, format!("failed to run {}: {}", self.ffprobe_bin, e)))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(PipelineError::connection(&source.url, stderr.trim()));
    }

    let tracks = parse_ffprobe_streams(&output.stdout).map_err(|e| PipelineError::connection(&source.url, e))?;
    if tracks.is_empty() {
      return Err(PipelineError::connection(&source.url, "no decodable stream"));
    }
    Ok(tracks)
  }
}

#[async_trait]
impl SourceConnector for FfprobeConnector {
  async fn connect(&self, source: &StreamSourceConfig) -> Result<SourceConnection, PipelineError> {
    match source.source_type {
      StreamSourceType::WebrtcDirect => Ok(SourceConnection::default()),
      StreamSourceType::File => {
        let path = source.url.strip_prefix("file://").unwrap_or(&source.url);
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
          return Err(PipelineError::connection(&source.url, "file does not exist"));
        }
        let tracks = self.probe(source).await?;
        Ok(SourceConnection { tracks, process: None })
      }
      _ => {
        let tracks = self.probe(source).await?;
        Ok(SourceConnection { tracks, process: None })
      }
    }
  }
}

/// Map `ffprobe -show_streams` JSON to track descriptors. Streams that are
/// neither audio nor video are skipped.
pub fn parse_ffprobe_streams(json: &[u8]) -> anyhow::Result<Vec<MediaTrackInfo>> {
  let value: serde_json::Value = serde_json::from_slice(json)?;
  let Some(streams) = value.get("streams").and_then(|s| s.as_array()) else {
    return Ok(Vec::new());
  };

  let mut tracks = Vec::new();
  for (position, stream) in streams.iter().enumerate() {
    let kind = match stream.get("codec_type").and_then(|t| t.as_str()) {
      Some("video") => TrackKind::Video,
      Some("audio") => TrackKind::Audio,
      _ => continue,
    };
    let index = stream.get("index").and_then(|i| i.as_u64()).unwrap_or(position as u64);
    let codec = stream
      .get("codec_name")
      .and_then(|c| c.as_str())
      .unwrap_or("unknown");

    let id = match kind {
      TrackKind::Video => format!("video_{}", index),
      TrackKind::Audio => format!("audio_{}", index),
    };
    let mut track = match kind {
      TrackKind::Video => MediaTrackInfo::video(id, codec),
      TrackKind::Audio => MediaTrackInfo::audio(id, codec),
    };

    track.width = stream.get("width").and_then(|w| w.as_u64()).and_then(|w| u32::try_from(w).ok());
    track.height = stream.get("height").and_then(|h| h.as_u64()).and_then(|h| u32::try_from(h).ok());
    track.frame_rate = stream
      .get("r_frame_rate")
      .and_then(|f| f.as_str())
      .and_then(parse_rational);
    track.bitrate = stream
      .get("bit_rate")
      .and_then(|b| b.as_str())
      .and_then(|b| b.parse().ok());
    track.sample_rate = stream
      .get("sample_rate")
      .and_then(|s| s.as_str())
      .and_then(|s| s.parse().ok());
    track.channels = stream.get("channels").and_then(|c| c.as_u64()).and_then(|c| u32::try_from(c).ok());

    tracks.push(track);
  }
  Ok(tracks)
}

fn parse_rational(value: &str) -> Option<f64> {
  let (num, den) = value.split_once('/')?;
  let (n, d) = (num.parse::<f64>().ok()?, den.parse::<f64>().ok()?);
  (d != 0.0 && n > 0.0).then(|| n / d)
}

/// Connect with the source's retry policy. Each attempt is bounded by the
/// connect timeout; failed attempts back off exponentially.
pub async fn connect_with_retry(
  connector: &dyn SourceConnector,
  source: &StreamSourceConfig,
) -> Result<SourceConnection, PipelineError> {
  let policy = source.retry_policy.clone().unwrap_or_default();
  let timeout = policy.connect_timeout();
  let mut attempt: u32 = 0;

  loop {
    attempt += 1;
    let result = match tokio::time::timeout(timeout, connector.connect(source)).await {
      Ok(result) => result,
      Err(_) => Err(PipelineError::ConnectionTimeout {
        url: source.url.clone(),
        timeout_secs: policy.connect_timeout_secs,
      }),
    };

    match result {
      Ok(connection) => {
        debug!(url = %source.url, attempt, tracks = connection.tracks.len(), "source connected");
        return Ok(connection);
      }
      Err(e) if attempt <= policy.max_retries => {
        let backoff = policy.backoff(attempt);
        warn!(
          url = %source.url,
          attempt,
          backoff_ms = backoff.as_millis() as u64,
          error = %e,
          "connect failed, retrying"
        );
        tokio::time::sleep(backoff).await;
      }
      Err(e) => return Err(e),
    }
  }
}
