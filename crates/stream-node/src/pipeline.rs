use chrono::Utc;
use common::events::{Event, EventBus, EventKind, DEFAULT_EVENT_CAPACITY};
use common::recordings::RecordingState;
use common::streams::{
  output_key, HealthState, MediaTrackInfo, OutputFormat, PipelineState, StreamHealthStatus, StreamOutputConfig,
};
use frame_crypto::EncryptionEngine;
use recorder_node::{SegmentRecorder, ThumbnailGenerator};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use telemetry::metrics::{INGEST_ACTIVE_PIPELINES, INGEST_BYTES, INGEST_FRAMES, INGEST_RECONNECTS, INGEST_STALLS};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HealthMonitorPolicy, PipelineConfig};
use crate::error::PipelineError;
use crate::source::{connect_with_retry, OwnedProcess, SourceConnection, SourceConnector};

#[derive(Debug, Clone, Serialize)]
pub struct OutputStats {
  pub key: String,
  pub format: OutputFormat,
  pub bytes: u64,
  pub frames: u64,
  pub recording_enabled: bool,
  pub recording_id: Option<String>,
  pub recording_state: Option<RecordingState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
  pub stream_id: String,
  pub state: PipelineState,
  pub uptime_seconds: f64,
  pub bytes_received: u64,
  pub frames_received: u64,
  pub reconnect_count: u32,
  pub tracks: Vec<MediaTrackInfo>,
  pub outputs: Vec<OutputStats>,
  pub health: StreamHealthStatus,
}

struct OutputRuntime {
  key: String,
  config: StreamOutputConfig,
  bytes: u64,
  frames: u64,
  recorder: Option<SegmentRecorder>,
}

struct Monitor {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

struct PipelineInner {
  state: PipelineState,
  started_at: Option<Instant>,
  bytes_received: u64,
  frames_received: u64,
  window_started: Instant,
  window_bytes: u64,
  window_frames: u64,
  last_frame: Option<Instant>,
  reconnect_count: u32,
  reconnects_without_frames: u32,
  gave_up: bool,
  tracks: BTreeMap<String, MediaTrackInfo>,
  outputs: Vec<OutputRuntime>,
  health: StreamHealthStatus,
  process: Option<OwnedProcess>,
  monitor: Option<Monitor>,
  counted_active: bool,
}

impl PipelineInner {
  fn reset_window(&mut self, now: Instant) {
    self.window_started = now;
    self.window_bytes = 0;
    self.window_frames = 0;
  }
}

struct Shared {
  stream_id: String,
  config: PipelineConfig,
  policy: HealthMonitorPolicy,
  temp_dir: PathBuf,
  connector: Arc<dyn SourceConnector>,
  encryption: Option<Arc<EncryptionEngine>>,
  thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
  events: EventBus,
  reconnected: watch::Sender<u32>,
  inner: Mutex<PipelineInner>,
}

pub struct PipelineBuilder {
  config: PipelineConfig,
  connector: Arc<dyn SourceConnector>,
  encryption: Option<Arc<EncryptionEngine>>,
  thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
  event_capacity: usize,
}

impl PipelineBuilder {
  /// Engine used by outputs whose processing options request encryption
  pub fn encryption(mut self, engine: Arc<EncryptionEngine>) -> Self {
    self.encryption = Some(engine);
    self
  }

  pub fn thumbnail_generator(mut self, generator: Arc<dyn ThumbnailGenerator>) -> Self {
    self.thumbnails = Some(generator);
    self
  }

  pub fn event_capacity(mut self, capacity: usize) -> Self {
    self.event_capacity = capacity;
    self
  }

  pub fn build(self) -> Result<IngestionPipeline, PipelineError> {
    let config = self.config.with_defaults();
    config.validate().map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
    if self.encryption.is_none() && config.outputs.iter().any(StreamOutputConfig::encrypts) {
      return Err(PipelineError::Config(
        "an output requests encryption but no encryption engine is configured".to_string(),
      ));
    }

    let policy = config.health_policy();
    let temp_dir = config.temp_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("vms-ingest"));
    let outputs = config
      .outputs
      .iter()
      .enumerate()
      .map(|(i, output)| OutputRuntime {
        key: output_key(i),
        config: output.clone(),
        bytes: 0,
        frames: 0,
        recorder: None,
      })
      .collect();

    let now = Instant::now();
    let (reconnected, _) = watch::channel(0u32);
    Ok(IngestionPipeline {
      shared: Arc::new(Shared {
        stream_id: config.stream_id.clone(),
        policy,
        temp_dir,
        connector: self.connector,
        encryption: self.encryption,
        thumbnails: self.thumbnails,
        events: EventBus::new(self.event_capacity),
        reconnected,
        inner: Mutex::new(PipelineInner {
          state: PipelineState::Idle,
          started_at: None,
          bytes_received: 0,
          frames_received: 0,
          window_started: now,
          window_bytes: 0,
          window_frames: 0,
          last_frame: None,
          reconnect_count: 0,
          reconnects_without_frames: 0,
          gave_up: false,
          tracks: BTreeMap::new(),
          outputs,
          health: StreamHealthStatus::default(),
          process: None,
          monitor: None,
          counted_active: false,
        }),
        config,
      }),
    })
  }
}

/// Keeps one camera source connected and fans its frames out to the
/// configured outputs, recording those that ask for it.
///
/// Frames are pushed in by an external producer through [`handle_frame`].
/// A health task watches the frame cadence and reconnects on stalls.
///
/// [`handle_frame`]: IngestionPipeline::handle_frame
#[derive(Clone)]
pub struct IngestionPipeline {
  shared: Arc<Shared>,
}

impl IngestionPipeline {
  pub fn builder(config: PipelineConfig, connector: Arc<dyn SourceConnector>) -> PipelineBuilder {
    PipelineBuilder {
      config,
      connector,
      encryption: None,
      thumbnails: None,
      event_capacity: DEFAULT_EVENT_CAPACITY,
    }
  }

  pub fn new(config: PipelineConfig, connector: Arc<dyn SourceConnector>) -> Result<Self, PipelineError> {
    Self::builder(config, connector).build()
  }

  pub fn stream_id(&self) -> &str {
    &self.shared.stream_id
  }

  /// Effective configuration, defaults included
  pub fn config(&self) -> &PipelineConfig {
    &self.shared.config
  }

  pub fn temp_dir(&self) -> &std::path::Path {
    &self.shared.temp_dir
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.shared.events.subscribe()
  }

  /// Holds the attempt number of the latest successful reconnect.
  /// Frame producers watch it to reopen their own source handles.
  pub fn watch_reconnects(&self) -> watch::Receiver<u32> {
    self.shared.reconnected.subscribe()
  }

  pub async fn state(&self) -> PipelineState {
    self.shared.inner.lock().await.state
  }

  pub async fn health(&self) -> StreamHealthStatus {
    self.shared.inner.lock().await.health.clone()
  }

  pub async fn recorder(&self, output_key: &str) -> Option<SegmentRecorder> {
    let inner = self.shared.inner.lock().await;
    inner
      .outputs
      .iter()
      .find(|o| o.key == output_key)
      .and_then(|o| o.recorder.clone())
  }

  pub async fn start(&self) -> Result<(), PipelineError> {
    let shared = &self.shared;
    shared
      .config
      .validate()
      .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

    {
      let mut inner = shared.inner.lock().await;
      match inner.state {
        PipelineState::Streaming => return Err(PipelineError::AlreadyStreaming),
        PipelineState::Connecting | PipelineState::Reconnecting => {
          return Err(PipelineError::InvalidState {
            operation: "start",
            state: inner.state,
          })
        }
        _ => {}
      }
      let from = inner.state;
      inner.state = PipelineState::Connecting;
      shared.emit(EventKind::state_change(from, PipelineState::Connecting));
    }

    info!(stream_id = %shared.stream_id, url = %shared.config.source.url, "connecting to source");
    let result = connect_with_retry(shared.connector.as_ref(), &shared.config.source).await;

    let mut inner = shared.inner.lock().await;
    if inner.state != PipelineState::Connecting {
      debug!(stream_id = %shared.stream_id, state = %inner.state, "start superseded by stop");
      if let Ok(connection) = result {
        if let Some(process) = connection.process {
          process.terminate().await;
        }
      }
      return Err(PipelineError::Cancelled);
    }

    let connection = match result {
      Ok(connection) => connection,
      Err(e) => return Err(shared.fail(&mut inner, e)),
    };
    shared.emit(EventKind::Connect {
      url: shared.config.source.url.clone(),
    });
    shared.apply_connection(&mut inner, connection);

    if let Err(e) = shared.configure_outputs(&mut inner).await {
      if let Some(process) = inner.process.take() {
        process.terminate().await;
      }
      return Err(shared.fail(&mut inner, e));
    }

    let now = Instant::now();
    inner.state = PipelineState::Streaming;
    inner.started_at = Some(now);
    inner.last_frame = Some(now);
    inner.reset_window(now);
    inner.reconnects_without_frames = 0;
    inner.gave_up = false;
    if !inner.counted_active {
      inner.counted_active = true;
      INGEST_ACTIVE_PIPELINES.inc();
    }
    if shared.policy.enabled && inner.monitor.is_none() {
      inner.monitor = Some(shared.spawn_monitor());
    }

    info!(
      stream_id = %shared.stream_id,
      tracks = inner.tracks.len(),
      outputs = inner.outputs.len(),
      "pipeline streaming"
    );
    shared.emit(EventKind::Start);
    shared.emit(EventKind::state_change(PipelineState::Connecting, PipelineState::Streaming));
    Ok(())
  }

  /// Tear down in reverse order: health task, source process, recorders.
  pub async fn stop(&self) -> Result<(), PipelineError> {
    let shared = &self.shared;
    let monitor = {
      let mut inner = shared.inner.lock().await;
      if matches!(inner.state, PipelineState::Idle | PipelineState::Stopped) {
        return Ok(());
      }
      inner.monitor.take()
    };
    if let Some(monitor) = monitor {
      monitor.token.cancel();
      if let Err(e) = monitor.handle.await {
        if e.is_panic() {
          error!(stream_id = %shared.stream_id, error = %e, "health monitor panicked");
        }
      }
    }

    let mut inner = shared.inner.lock().await;
    if matches!(inner.state, PipelineState::Idle | PipelineState::Stopped) {
      return Ok(());
    }
    let from = inner.state;

    if let Some(process) = inner.process.take() {
      process.terminate().await;
    }

    for output in &inner.outputs {
      let Some(recorder) = &output.recorder else {
        continue;
      };
      if !recorder.state().await.is_active() {
        continue;
      }
      match recorder.stop().await {
        Ok(metadata) => shared.emit(EventKind::RecordingStop {
          output_key: output.key.clone(),
          recording_id: metadata.id,
          segment_count: metadata.segment_count,
          total_size: metadata.total_size,
        }),
        Err(e) => {
          warn!(stream_id = %shared.stream_id, output = %output.key, error = %e, "failed to stop recorder");
          shared.emit(EventKind::Error {
            message: format!("{}: failed to stop recording: {}", output.key, e),
          });
        }
      }
    }

    let uptime = inner.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or_default();
    inner.state = PipelineState::Stopped;
    if inner.counted_active {
      inner.counted_active = false;
      INGEST_ACTIVE_PIPELINES.dec();
    }

    info!(stream_id = %shared.stream_id, uptime_seconds = uptime, "pipeline stopped");
    shared.emit(EventKind::Stop {
      duration_seconds: uptime,
      segment_count: None,
    });
    shared.emit(EventKind::state_change(from, PipelineState::Stopped));
    Ok(())
  }

  /// Accept one chunk of media for `output_key`. Ignored unless streaming.
  pub async fn handle_frame(&self, output_key: &str, bytes: &[u8]) {
    let shared = &self.shared;
    let mut inner = shared.inner.lock().await;
    if inner.state != PipelineState::Streaming {
      return;
    }
    let Some(index) = inner.outputs.iter().position(|o| o.key == output_key) else {
      warn!(stream_id = %shared.stream_id, output = %output_key, "frame for unknown output");
      shared.emit(EventKind::Warning {
        message: format!("unknown output key: {}", output_key),
      });
      return;
    };

    let len = bytes.len() as u64;
    inner.bytes_received += len;
    inner.frames_received += 1;
    inner.window_bytes += len;
    inner.window_frames += 1;
    inner.last_frame = Some(Instant::now());
    inner.reconnects_without_frames = 0;
    inner.health.record_frame(Utc::now());
    INGEST_FRAMES.with_label_values(&[&shared.stream_id]).inc();
    INGEST_BYTES.with_label_values(&[&shared.stream_id]).inc_by(len);

    let output = &mut inner.outputs[index];
    output.bytes += len;
    output.frames += 1;
    // the recorder reports its own failures on the shared bus
    if let Some(recorder) = &output.recorder {
      if let Err(e) = recorder.handle_frame(bytes).await {
        warn!(stream_id = %shared.stream_id, output = %output_key, error = %e, "recorder rejected frame");
      }
    }

    shared.emit(EventKind::Data {
      output_key: output_key.to_string(),
      bytes: bytes.len(),
    });
  }

  /// Returns false when a track with the same id is already known
  pub async fn add_track(&self, track: MediaTrackInfo) -> bool {
    let mut inner = self.shared.inner.lock().await;
    self.shared.insert_track(&mut inner, track)
  }

  pub async fn remove_track(&self, track_id: &str) -> bool {
    let mut inner = self.shared.inner.lock().await;
    if inner.tracks.remove(track_id).is_none() {
      return false;
    }
    debug!(stream_id = %self.shared.stream_id, track_id, "track removed");
    self.shared.emit(EventKind::TrackRemoved {
      track_id: track_id.to_string(),
    });
    true
  }

  pub async fn stats(&self) -> PipelineStats {
    let inner = self.shared.inner.lock().await;
    let mut outputs = Vec::with_capacity(inner.outputs.len());
    for output in &inner.outputs {
      let recording_state = match &output.recorder {
        Some(recorder) => Some(recorder.state().await),
        None => None,
      };
      outputs.push(OutputStats {
        key: output.key.clone(),
        format: output.config.format,
        bytes: output.bytes,
        frames: output.frames,
        recording_enabled: output.config.recording_enabled,
        recording_id: output.recorder.as_ref().map(|r| r.id().to_string()),
        recording_state,
      });
    }

    let uptime_seconds = match (inner.state, inner.started_at) {
      (PipelineState::Idle | PipelineState::Stopped, _) | (_, None) => 0.0,
      (_, Some(started)) => started.elapsed().as_secs_f64(),
    };

    PipelineStats {
      stream_id: self.shared.stream_id.clone(),
      state: inner.state,
      uptime_seconds,
      bytes_received: inner.bytes_received,
      frames_received: inner.frames_received,
      reconnect_count: inner.reconnect_count,
      tracks: inner.tracks.values().cloned().collect(),
      outputs,
      health: inner.health.clone(),
    }
  }
}

impl Shared {
  fn emit(&self, kind: EventKind) {
    self.events.emit(&self.stream_id, kind);
  }

  fn insert_track(&self, inner: &mut PipelineInner, track: MediaTrackInfo) -> bool {
    if inner.tracks.contains_key(&track.id) {
      return false;
    }
    debug!(stream_id = %self.stream_id, track_id = %track.id, codec = %track.codec, "track added");
    inner.tracks.insert(track.id.clone(), track.clone());
    self.emit(EventKind::TrackAdded { track });
    true
  }

  fn apply_connection(&self, inner: &mut PipelineInner, connection: SourceConnection) {
    for track in connection.tracks {
      self.insert_track(inner, track);
    }
    inner.process = connection.process;
  }

  /// Create missing recorders and start any that are not running
  async fn configure_outputs(&self, inner: &mut PipelineInner) -> Result<(), PipelineError> {
    for output in &mut inner.outputs {
      if !output.config.recording_enabled {
        continue;
      }
      let recorder = match &output.recorder {
        Some(recorder) => recorder.clone(),
        None => {
          let recording = output
            .config
            .recording_config
            .clone()
            .ok_or_else(|| PipelineError::Config(format!("{}: missing recording config", output.key)))?;
          let mut builder = SegmentRecorder::builder(recording)
            .source_stream_id(self.stream_id.clone())
            .events(self.events.clone());
          if output.config.encrypts() {
            if let Some(engine) = &self.encryption {
              builder = builder.encryption(Arc::clone(engine));
            }
          }
          if let Some(generator) = &self.thumbnails {
            builder = builder.thumbnail_generator(Arc::clone(generator));
          }
          let recorder = builder.build()?;
          output.recorder = Some(recorder.clone());
          recorder
        }
      };

      if recorder.state().await.is_active() {
        continue;
      }
      recorder.start().await?;
      info!(stream_id = %self.stream_id, output = %output.key, recording_id = %recorder.id(), "recording started");
      self.emit(EventKind::RecordingStart {
        output_key: output.key.clone(),
        recording_id: recorder.id().to_string(),
      });
    }
    Ok(())
  }

  fn fail(&self, inner: &mut PipelineInner, err: PipelineError) -> PipelineError {
    let from = inner.state;
    inner.state = PipelineState::Error;
    inner.health.status = HealthState::Error;
    inner.health.error = Some(err.to_string());

    error!(stream_id = %self.stream_id, error = %err, "pipeline failed");
    self.emit(EventKind::Error {
      message: err.to_string(),
    });
    if from != PipelineState::Error {
      self.emit(EventKind::state_change(from, PipelineState::Error));
    }
    err
  }

  fn spawn_monitor(self: &Arc<Self>) -> Monitor {
    let token = CancellationToken::new();
    let handle = tokio::spawn(monitor_loop(
      Arc::downgrade(self),
      token.clone(),
      self.policy.check_interval(),
    ));
    Monitor { token, handle }
  }

  /// One health evaluation. Returns true when a reconnect should follow.
  /// A stall that outlasts the reconnect cap fails the pipeline once.
  async fn health_tick(&self) -> bool {
    let mut inner = self.inner.lock().await;
    if !inner.state.is_monitored() || inner.state == PipelineState::Reconnecting {
      return false;
    }

    let now = Instant::now();
    let delay = inner
      .last_frame
      .or(inner.started_at)
      .map(|t| now.saturating_duration_since(t))
      .unwrap_or_default();
    let window = now.saturating_duration_since(inner.window_started).as_secs_f64();
    if window > 0.0 {
      inner.health.bitrate = Some(inner.window_bytes as f64 * 8.0 / window);
      inner.health.frame_rate = Some(inner.window_frames as f64 / window);
    }
    inner.reset_window(now);
    inner.health.frame_delay_seconds = Some(delay.as_secs_f64());
    inner.health.record_check(Utc::now());

    let stalled = delay > self.policy.max_frame_delay();
    if stalled {
      inner.health.status = HealthState::Error;
      inner.health.error = Some(format!("no frames received for {:.1}s", delay.as_secs_f64()));
      INGEST_STALLS.inc();
      warn!(stream_id = %self.stream_id, delay_seconds = delay.as_secs_f64(), "stream stalled");
    } else {
      inner.health.status = HealthState::Healthy;
      inner.health.error = None;
    }
    self.emit(EventKind::HealthStatus {
      health: inner.health.clone(),
    });

    if !stalled || !self.policy.auto_reconnect {
      return false;
    }
    let attempts = inner.reconnects_without_frames;
    if !self.policy.reconnects_exhausted(attempts) {
      return true;
    }
    if !inner.gave_up {
      inner.gave_up = true;
      warn!(stream_id = %self.stream_id, attempts, "giving up on reconnect");
      self.fail(&mut inner, PipelineError::ReconnectExhausted { attempts });
    }
    false
  }

  async fn reconnect(&self, cancel: &CancellationToken) {
    let (attempt, process) = {
      let mut inner = self.inner.lock().await;
      if inner.state == PipelineState::Reconnecting || !inner.state.is_monitored() {
        return;
      }
      let from = inner.state;
      inner.state = PipelineState::Reconnecting;
      inner.reconnect_count += 1;
      inner.reconnects_without_frames += 1;
      self.emit(EventKind::state_change(from, PipelineState::Reconnecting));
      self.emit(EventKind::Reconnect {
        attempt: inner.reconnect_count,
      });
      (inner.reconnect_count, inner.process.take())
    };

    info!(stream_id = %self.stream_id, attempt, "reconnecting to source");
    if let Some(process) = process {
      process.terminate().await;
    }

    let result = tokio::select! {
      _ = cancel.cancelled() => return,
      result = connect_with_retry(self.connector.as_ref(), &self.config.source) => result,
    };

    let mut inner = self.inner.lock().await;
    if inner.state != PipelineState::Reconnecting {
      if let Ok(connection) = result {
        if let Some(process) = connection.process {
          process.terminate().await;
        }
      }
      return;
    }

    let outcome = match result {
      Ok(connection) => {
        self.apply_connection(&mut inner, connection);
        self.configure_outputs(&mut inner).await
      }
      Err(e) => Err(e),
    };

    match outcome {
      Ok(()) => {
        let now = Instant::now();
        inner.state = PipelineState::Streaming;
        inner.last_frame = Some(now);
        inner.reset_window(now);
        inner.health.status = HealthState::Unknown;
        inner.health.error = None;
        inner.health.frame_delay_seconds = None;
        INGEST_RECONNECTS.with_label_values(&[&self.stream_id, "success"]).inc();
        info!(stream_id = %self.stream_id, attempt, "reconnected");
        self.emit(EventKind::state_change(PipelineState::Reconnecting, PipelineState::Streaming));
        self.reconnected.send_replace(attempt);
      }
      Err(e) => {
        INGEST_RECONNECTS.with_label_values(&[&self.stream_id, "failure"]).inc();
        self.fail(&mut inner, e);
      }
    }
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    if let Some(monitor) = self.inner.get_mut().monitor.take() {
      monitor.token.cancel();
    }
  }
}

async fn monitor_loop(shared: Weak<Shared>, token: CancellationToken, period: Duration) {
  let mut ticker = interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {
        let Some(shared) = shared.upgrade() else { break };
        if shared.health_tick().await {
          shared.reconnect(&token).await;
        }
      }
    }
  }
}
