use chrono::{DateTime, Utc};
use common::events::{EventBus, EventKind};
use common::recordings::{seconds_between, RecordingConfig, RecordingMetadata, RecordingSegment, RecordingState};
use common::validation;
use frame_crypto::EncryptionEngine;
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use telemetry::metrics::{
  RECORDER_ACTIVE_RECORDINGS, RECORDER_BYTES_WRITTEN, RECORDER_FAILURES, RECORDER_SEGMENTS,
  RECORDER_SEGMENT_DURATION,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sink::SegmentSink;
use super::thumbnail::{FfmpegThumbnailGenerator, ThumbnailGenerator};
use crate::error::{RecorderError, Result};

pub const METADATA_FILENAME: &str = "metadata.json";
pub const THUMBNAILS_DIR: &str = "thumbnails";

/// Point-in-time view of a recorder
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStats {
  pub recording_id: String,
  pub state: RecordingState,
  pub segment_count: usize,
  pub total_size: u64,
  pub frames_written: u64,
  pub bytes_written: u64,
  pub current_segment_index: Option<u32>,
  pub current_segment_size: u64,
  pub started_at: Option<DateTime<Utc>>,
  pub duration_seconds: f64,
  pub last_error: Option<String>,
}

struct OpenSegment {
  segment: RecordingSegment,
  sink: SegmentSink,
}

struct Timer {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

struct RecorderInner {
  state: RecordingState,
  current: Option<OpenSegment>,
  next_index: u32,
  metadata: RecordingMetadata,
  frames_written: u64,
  bytes_written: u64,
  last_error: Option<String>,
  timers: Vec<Timer>,
}

struct Shared {
  id: String,
  config: RecordingConfig,
  dir: PathBuf,
  events: EventBus,
  encryption: Option<Arc<EncryptionEngine>>,
  thumbnails: Arc<dyn ThumbnailGenerator>,
  inner: Mutex<RecorderInner>,
}

pub struct RecorderBuilder {
  config: RecordingConfig,
  recording_id: Option<String>,
  source_stream_id: Option<String>,
  events: Option<EventBus>,
  encryption: Option<Arc<EncryptionEngine>>,
  thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
}

impl RecorderBuilder {
  pub fn recording_id(mut self, id: impl Into<String>) -> Self {
    self.recording_id = Some(id.into());
    self
  }

  pub fn source_stream_id(mut self, id: impl Into<String>) -> Self {
    self.source_stream_id = Some(id.into());
    self
  }

  /// Publish onto an existing bus instead of a private one
  pub fn events(mut self, events: EventBus) -> Self {
    self.events = Some(events);
    self
  }

  pub fn encryption(mut self, engine: Arc<EncryptionEngine>) -> Self {
    self.encryption = Some(engine);
    self
  }

  pub fn thumbnail_generator(mut self, generator: Arc<dyn ThumbnailGenerator>) -> Self {
    self.thumbnails = Some(generator);
    self
  }

  pub fn build(self) -> Result<SegmentRecorder> {
    self
      .config
      .validate()
      .map_err(|e| RecorderError::Config(format!("{:#}", e)))?;

    let id = self
      .recording_id
      .unwrap_or_else(|| format!("{}_{}", self.config.name_prefix, uuid::Uuid::new_v4().simple()));
    validation::validate_id(&id, "recordingId").map_err(|e| RecorderError::Config(format!("{:#}", e)))?;

    let dir = self.config.output_dir.join(&id);
    let metadata = RecordingMetadata::new(id.clone(), self.source_stream_id, &self.config);

    Ok(SegmentRecorder {
      shared: Arc::new(Shared {
        id,
        dir,
        events: self.events.unwrap_or_default(),
        encryption: self.encryption,
        thumbnails: self
          .thumbnails
          .unwrap_or_else(|| Arc::new(FfmpegThumbnailGenerator::default())),
        inner: Mutex::new(RecorderInner {
          state: RecordingState::Idle,
          current: None,
          next_index: 0,
          metadata,
          frames_written: 0,
          bytes_written: 0,
          last_error: None,
          timers: Vec::new(),
        }),
        config: self.config,
      }),
    })
  }
}

/// Writes a continuous frame stream into a directory of bounded segment
/// files, with periodic thumbnails and a `metadata.json` written on stop.
///
/// Cloning yields another handle to the same recording.
#[derive(Clone)]
pub struct SegmentRecorder {
  shared: Arc<Shared>,
}

impl SegmentRecorder {
  pub fn builder(config: RecordingConfig) -> RecorderBuilder {
    RecorderBuilder {
      config,
      recording_id: None,
      source_stream_id: None,
      events: None,
      encryption: None,
      thumbnails: None,
    }
  }

  pub fn new(config: RecordingConfig) -> Result<Self> {
    Self::builder(config).build()
  }

  pub fn id(&self) -> &str {
    &self.shared.id
  }

  pub fn config(&self) -> &RecordingConfig {
    &self.shared.config
  }

  /// `<output_dir>/<recording_id>`
  pub fn directory(&self) -> &Path {
    &self.shared.dir
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<common::events::Event> {
    self.shared.events.subscribe()
  }

  pub async fn state(&self) -> RecordingState {
    self.shared.inner.lock().await.state
  }

  pub async fn start(&self) -> Result<()> {
    let shared = &self.shared;
    let mut inner = shared.inner.lock().await;
    match inner.state {
      RecordingState::Recording => {
        return Err(RecorderError::InvalidState {
          operation: "start",
          state: inner.state,
        })
      }
      RecordingState::Paused => {
        drop(inner);
        return self.resume().await;
      }
      _ => {}
    }

    let from = inner.state;
    if let Err(e) = shared.prepare_directories().await {
      return Err(shared.fail(&mut inner, e));
    }
    if let Err(e) = shared.open_segment(&mut inner).await {
      return Err(shared.fail(&mut inner, e));
    }

    if inner.metadata.start_time.is_none() {
      inner.metadata.start_time = Some(Utc::now());
    }
    inner.state = RecordingState::Recording;
    inner.last_error = None;
    shared.arm_timers(&mut inner);
    RECORDER_ACTIVE_RECORDINGS.inc();

    info!(
      recording_id = %shared.id,
      dir = %shared.dir.display(),
      format = %shared.config.format,
      segment_index = inner.next_index.saturating_sub(1),
      "recording started"
    );
    shared.emit(EventKind::Start);
    shared.emit(EventKind::state_change(from, RecordingState::Recording));
    Ok(())
  }

  /// Finalize the open segment, persist metadata and return it.
  pub async fn stop(&self) -> Result<RecordingMetadata> {
    let shared = &self.shared;
    let timers = shared.take_timers("stop", |s| s.is_active()).await?;
    cancel_timers(timers).await;

    let mut inner = shared.inner.lock().await;
    if !inner.state.is_active() {
      return Err(RecorderError::InvalidState {
        operation: "stop",
        state: inner.state,
      });
    }
    let from = inner.state;

    if let Err(e) = shared.finalize_current(&mut inner).await {
      return Err(shared.fail(&mut inner, e));
    }
    inner.metadata.close(Utc::now());

    if shared.config.include_metadata {
      if let Err(e) = shared.persist_metadata(&inner.metadata).await {
        return Err(shared.fail(&mut inner, e));
      }
    }

    inner.state = RecordingState::Stopped;
    RECORDER_ACTIVE_RECORDINGS.dec();

    let duration_seconds = inner.metadata.duration_seconds.unwrap_or_default();
    let segment_count = inner.metadata.segment_count;
    info!(
      recording_id = %shared.id,
      duration_seconds,
      segment_count,
      total_size = inner.metadata.total_size,
      "recording stopped"
    );
    shared.emit(EventKind::Stop {
      duration_seconds,
      segment_count: Some(segment_count),
    });
    shared.emit(EventKind::state_change(from, RecordingState::Stopped));
    Ok(inner.metadata.clone())
  }

  pub async fn pause(&self) -> Result<()> {
    let shared = &self.shared;
    let timers = shared
      .take_timers("pause", |s| s == RecordingState::Recording)
      .await?;
    cancel_timers(timers).await;

    let mut inner = shared.inner.lock().await;
    if inner.state != RecordingState::Recording {
      return Err(RecorderError::InvalidState {
        operation: "pause",
        state: inner.state,
      });
    }
    if let Err(e) = shared.finalize_current(&mut inner).await {
      return Err(shared.fail(&mut inner, e));
    }

    inner.state = RecordingState::Paused;
    info!(recording_id = %shared.id, "recording paused");
    shared.emit(EventKind::Pause);
    shared.emit(EventKind::state_change(RecordingState::Recording, RecordingState::Paused));
    Ok(())
  }

  pub async fn resume(&self) -> Result<()> {
    let shared = &self.shared;
    let mut inner = shared.inner.lock().await;
    if inner.state != RecordingState::Paused {
      return Err(RecorderError::InvalidState {
        operation: "resume",
        state: inner.state,
      });
    }
    if let Err(e) = shared.open_segment(&mut inner).await {
      return Err(shared.fail(&mut inner, e));
    }

    inner.state = RecordingState::Recording;
    shared.arm_timers(&mut inner);
    info!(recording_id = %shared.id, "recording resumed");
    shared.emit(EventKind::Resume);
    shared.emit(EventKind::state_change(RecordingState::Paused, RecordingState::Recording));
    Ok(())
  }

  /// Append one frame to the open segment. Outside `Recording` this is a
  /// no-op. Size rotation happens before the write.
  pub async fn handle_frame(&self, bytes: &[u8]) -> Result<()> {
    let shared = &self.shared;
    let mut inner = shared.inner.lock().await;
    if inner.state != RecordingState::Recording {
      return Ok(());
    }

    if let Some(max) = shared.config.max_segment_size_bytes() {
      let full = inner.current.as_ref().is_some_and(|open| open.segment.size_bytes > max);
      if full {
        if let Err(e) = shared.rotate(&mut inner).await {
          return Err(shared.fail(&mut inner, e));
        }
      }
    }

    let payload: Cow<'_, [u8]> = match &shared.encryption {
      Some(engine) => match engine.seal_frame(bytes) {
        Ok(sealed) => Cow::Owned(sealed),
        Err(e) => {
          RECORDER_FAILURES.with_label_values(&["crypto"]).inc();
          warn!(recording_id = %shared.id, error = %e, "frame encryption failed");
          shared.emit(EventKind::Error {
            message: format!("frame encryption failed: {}", e),
          });
          return Err(e.into());
        }
      },
      None => Cow::Borrowed(bytes),
    };

    let Some(open) = inner.current.as_mut() else {
      return Ok(());
    };
    if let Err(e) = open.sink.write(&payload).await {
      return Err(shared.fail(&mut inner, e.into()));
    }

    let len = payload.len() as u64;
    open.segment.size_bytes += len;
    inner.frames_written += 1;
    inner.bytes_written += len;
    RECORDER_BYTES_WRITTEN.inc_by(len);
    Ok(())
  }

  pub async fn stats(&self) -> RecorderStats {
    let inner = self.shared.inner.lock().await;
    let (current_segment_index, current_segment_size) = inner
      .current
      .as_ref()
      .map(|open| (Some(open.segment.index), open.segment.size_bytes))
      .unwrap_or((None, 0));
    let duration_seconds = match (inner.metadata.start_time, inner.state.is_active()) {
      (Some(start), true) => seconds_between(start, Utc::now()),
      _ => inner.metadata.duration_seconds.unwrap_or_default(),
    };

    RecorderStats {
      recording_id: self.shared.id.clone(),
      state: inner.state,
      segment_count: inner.metadata.segment_count,
      total_size: inner.metadata.total_size,
      frames_written: inner.frames_written,
      bytes_written: inner.bytes_written,
      current_segment_index,
      current_segment_size,
      started_at: inner.metadata.start_time,
      duration_seconds,
      last_error: inner.last_error.clone(),
    }
  }

  /// Finalized segments only; the open one is reported by `current_segment`
  pub async fn metadata(&self) -> RecordingMetadata {
    self.shared.inner.lock().await.metadata.clone()
  }

  pub async fn current_segment(&self) -> Option<RecordingSegment> {
    let inner = self.shared.inner.lock().await;
    inner.current.as_ref().map(|open| open.segment.clone())
  }

  pub async fn last_error(&self) -> Option<String> {
    self.shared.inner.lock().await.last_error.clone()
  }
}

impl Shared {
  fn emit(&self, kind: EventKind) {
    self.events.emit(&self.id, kind);
  }

  async fn prepare_directories(&self) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir).await?;
    if self.config.generate_thumbnails {
      tokio::fs::create_dir_all(self.dir.join(THUMBNAILS_DIR)).await?;
    }
    Ok(())
  }

  async fn open_segment(&self, inner: &mut RecorderInner) -> Result<()> {
    let index = inner.next_index;
    let segment = RecordingSegment::open(&self.id, index, self.config.format);
    let sink = SegmentSink::create(self.dir.join(&segment.filename)).await?;
    inner.next_index += 1;

    debug!(recording_id = %self.id, segment = %segment.filename, "segment opened");
    inner.current = Some(OpenSegment { segment, sink });
    Ok(())
  }

  async fn finalize_current(&self, inner: &mut RecorderInner) -> Result<()> {
    let Some(open) = inner.current.take() else {
      return Ok(());
    };
    let size = open.sink.finish().await?;
    let mut segment = open.segment;
    segment.size_bytes = size;
    let segment = segment.finalize(Utc::now());

    let duration = segment.duration_seconds.unwrap_or_default();
    RECORDER_SEGMENTS.inc();
    RECORDER_SEGMENT_DURATION.observe(duration);
    info!(
      recording_id = %self.id,
      segment = %segment.filename,
      size_bytes = segment.size_bytes,
      duration_seconds = duration,
      "segment finalized"
    );

    inner.metadata.push_segment(segment.clone());
    self.emit(EventKind::SegmentComplete { segment });
    Ok(())
  }

  async fn rotate(&self, inner: &mut RecorderInner) -> Result<()> {
    self.finalize_current(inner).await?;
    self.open_segment(inner).await
  }

  async fn persist_metadata(&self, metadata: &RecordingMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata)?;
    let path = self.dir.join(METADATA_FILENAME);
    let tmp = self.dir.join(format!("{}.tmp", METADATA_FILENAME));
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!(recording_id = %self.id, path = %path.display(), "metadata written");
    Ok(())
  }

  /// Record a terminal failure. Timers are cancelled but not awaited, since
  /// this may run inside one of them.
  fn fail(&self, inner: &mut RecorderInner, err: RecorderError) -> RecorderError {
    let from = inner.state;
    inner.state = RecordingState::Error;
    inner.last_error = Some(err.to_string());
    for timer in inner.timers.drain(..) {
      timer.token.cancel();
    }
    if let Some(open) = inner.current.take() {
      warn!(
        recording_id = %self.id,
        segment = %open.segment.filename,
        "discarding open segment after failure"
      );
    }
    if from.is_active() {
      RECORDER_ACTIVE_RECORDINGS.dec();
    }
    RECORDER_FAILURES.with_label_values(&[err.kind()]).inc();

    error!(recording_id = %self.id, error = %err, "recording failed");
    self.emit(EventKind::Error {
      message: err.to_string(),
    });
    if from != RecordingState::Error {
      self.emit(EventKind::state_change(from, RecordingState::Error));
    }
    err
  }

  async fn take_timers(
    &self,
    operation: &'static str,
    allowed: impl Fn(RecordingState) -> bool,
  ) -> Result<Vec<Timer>> {
    let mut inner = self.inner.lock().await;
    if !allowed(inner.state) {
      return Err(RecorderError::InvalidState {
        operation,
        state: inner.state,
      });
    }
    Ok(std::mem::take(&mut inner.timers))
  }

  fn arm_timers(self: &Arc<Self>, inner: &mut RecorderInner) {
    if let Some(period) = self.config.segment_duration() {
      let token = CancellationToken::new();
      let handle = tokio::spawn(rotation_loop(Arc::downgrade(self), token.clone(), period));
      inner.timers.push(Timer { token, handle });
    }
    if let Some(period) = self.config.thumbnail_interval() {
      let token = CancellationToken::new();
      let handle = tokio::spawn(thumbnail_loop(Arc::downgrade(self), token.clone(), period));
      inner.timers.push(Timer { token, handle });
    }
  }

  async fn capture_thumbnail(&self, token: &CancellationToken) {
    let (index, segment_path) = {
      let mut inner = self.inner.lock().await;
      if token.is_cancelled() || inner.state != RecordingState::Recording {
        return;
      }
      let Some(open) = inner.current.as_mut() else {
        return;
      };
      if let Err(e) = open.sink.flush().await {
        warn!(recording_id = %self.id, error = %e, "flush before thumbnail failed");
      }
      (open.segment.index, open.sink.path().to_path_buf())
    };

    let filename = format!("thumbnail_{}_{}.jpg", index, Utc::now().timestamp_millis());
    let output = self.dir.join(THUMBNAILS_DIR).join(&filename);
    let result = tokio::select! {
      _ = token.cancelled() => return,
      result = self.thumbnails.generate(&segment_path, &output) => result,
    };

    match result {
      Ok(()) => {
        let mut inner = self.inner.lock().await;
        match inner.current.as_mut() {
          Some(open) if open.segment.index == index => {
            open.segment.thumbnail_filename = Some(filename);
          }
          _ => {
            if let Some(segment) = inner.metadata.segments.iter_mut().find(|s| s.index == index) {
              segment.thumbnail_filename = Some(filename);
            }
          }
        }
        debug!(recording_id = %self.id, segment_index = index, "thumbnail captured");
      }
      Err(e) => {
        RECORDER_FAILURES.with_label_values(&["thumbnail"]).inc();
        warn!(recording_id = %self.id, segment_index = index, error = %e, "thumbnail generation failed");
        self.emit(EventKind::Warning {
          message: format!("thumbnail generation failed: {:#}", e),
        });
      }
    }
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    for timer in self.inner.get_mut().timers.drain(..) {
      timer.token.cancel();
    }
  }
}

async fn cancel_timers(timers: Vec<Timer>) {
  for timer in &timers {
    timer.token.cancel();
  }
  for timer in timers {
    if let Err(e) = timer.handle.await {
      if e.is_panic() {
        error!(error = %e, "recorder timer task panicked");
      }
    }
  }
}

async fn rotation_loop(shared: Weak<Shared>, token: CancellationToken, period: Duration) {
  let mut ticker = interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {
        let Some(shared) = shared.upgrade() else { break };
        let mut inner = shared.inner.lock().await;
        if token.is_cancelled() {
          break;
        }
        if inner.state != RecordingState::Recording {
          continue;
        }
        if let Err(e) = shared.rotate(&mut inner).await {
          shared.fail(&mut inner, e);
          break;
        }
      }
    }
  }
}

async fn thumbnail_loop(shared: Weak<Shared>, token: CancellationToken, period: Duration) {
  let mut ticker = interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {
        let Some(shared) = shared.upgrade() else { break };
        shared.capture_thumbnail(&token).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use common::events::Event;
  use frame_crypto::{EncryptionConfig, EncryptionMode};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::broadcast::Receiver;

  fn config(dir: &Path) -> RecordingConfig {
    RecordingConfig::new(dir)
  }

  fn drain(rx: &mut Receiver<Event>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
      names.push(event.kind.name().to_string());
    }
    names
  }

  struct StubThumbnails {
    calls: AtomicUsize,
    fail: bool,
  }

  #[async_trait]
  impl ThumbnailGenerator for StubThumbnails {
    async fn generate(&self, _segment: &Path, output: &Path) -> anyhow::Result<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        anyhow::bail!("no decoder");
      }
      tokio::fs::write(output, b"jpeg").await?;
      Ok(())
    }
  }

  #[test]
  fn test_invalid_config_rejected() {
    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.segment_duration_secs = -1.0;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    let cfg = RecordingConfig::new("");
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.generate_thumbnails = true;
    cfg.thumbnail_interval_secs = 0.0;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    let cfg = RecordingConfig::new("/tmp/recordings");
    let result = SegmentRecorder::builder(cfg).recording_id("../escape").build();
    assert!(matches!(result, Err(RecorderError::Config(_))));
  }

  #[test]
  fn test_unusable_timer_periods_rejected() {
    // overflows Duration
    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.segment_duration_secs = 1e20;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    // rounds down to a zero-length interval
    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.segment_duration_secs = 1e-12;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.generate_thumbnails = true;
    cfg.thumbnail_interval_secs = 1e-12;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));

    let mut cfg = RecordingConfig::new("/tmp/recordings");
    cfg.generate_thumbnails = true;
    cfg.thumbnail_interval_secs = 1e20;
    assert!(matches!(SegmentRecorder::new(cfg), Err(RecorderError::Config(_))));
  }

  #[tokio::test]
  async fn test_recording_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SegmentRecorder::builder(config(dir.path()))
      .recording_id("cam-1")
      .source_stream_id("stream-1")
      .build()
      .unwrap();
    let mut rx = recorder.subscribe();

    recorder.start().await.unwrap();
    assert_eq!(recorder.state().await, RecordingState::Recording);
    recorder.handle_frame(&[1u8; 100]).await.unwrap();
    recorder.handle_frame(&[2u8; 50]).await.unwrap();

    let current = recorder.current_segment().await.unwrap();
    assert_eq!(current.size_bytes, 150);
    assert!(!current.is_finalized());

    let metadata = recorder.stop().await.unwrap();
    assert_eq!(metadata.segment_count, 1);
    assert_eq!(metadata.total_size, 150);
    assert_eq!(metadata.source_stream_id.as_deref(), Some("stream-1"));
    assert!(metadata.end_time.is_some());

    let segment_path = dir.path().join("cam-1").join("segment_0.mp4");
    assert_eq!(tokio::fs::metadata(&segment_path).await.unwrap().len(), 150);

    let json = tokio::fs::read(dir.path().join("cam-1").join(METADATA_FILENAME)).await.unwrap();
    let persisted: RecordingMetadata = serde_json::from_slice(&json).unwrap();
    assert_eq!(persisted, metadata);

    assert_eq!(
      drain(&mut rx),
      vec!["start", "state_change", "segment_complete", "stop", "state_change"]
    );
  }

  #[tokio::test]
  async fn test_frames_ignored_outside_recording() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SegmentRecorder::new(config(dir.path())).unwrap();

    recorder.handle_frame(b"early").await.unwrap();
    let stats = recorder.stats().await;
    assert_eq!(stats.frames_written, 0);
    assert_eq!(stats.state, RecordingState::Idle);

    recorder.start().await.unwrap();
    recorder.pause().await.unwrap();
    recorder.handle_frame(b"paused").await.unwrap();
    assert_eq!(recorder.stats().await.bytes_written, 0);
  }

  #[tokio::test]
  async fn test_invalid_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SegmentRecorder::new(config(dir.path())).unwrap();

    assert!(matches!(recorder.stop().await, Err(RecorderError::InvalidState { .. })));
    assert!(matches!(recorder.pause().await, Err(RecorderError::InvalidState { .. })));
    assert!(matches!(recorder.resume().await, Err(RecorderError::InvalidState { .. })));

    recorder.start().await.unwrap();
    assert!(matches!(recorder.start().await, Err(RecorderError::InvalidState { .. })));
    assert!(matches!(recorder.resume().await, Err(RecorderError::InvalidState { .. })));
    recorder.stop().await.unwrap();
  }

  #[tokio::test]
  async fn test_pause_resume_opens_new_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.include_metadata = false;
    let recorder = SegmentRecorder::builder(cfg).recording_id("pr").build().unwrap();

    recorder.start().await.unwrap();
    recorder.handle_frame(&[0u8; 10]).await.unwrap();
    recorder.pause().await.unwrap();
    assert_eq!(recorder.metadata().await.segment_count, 1);
    assert!(recorder.current_segment().await.is_none());

    // start() while paused resumes
    recorder.start().await.unwrap();
    assert_eq!(recorder.current_segment().await.unwrap().index, 1);
    recorder.handle_frame(&[0u8; 20]).await.unwrap();

    let metadata = recorder.stop().await.unwrap();
    assert_eq!(metadata.segment_count, 2);
    assert_eq!(metadata.total_size, 30);
    assert!(!dir.path().join("pr").join(METADATA_FILENAME).exists());
  }

  #[tokio::test]
  async fn test_restart_continues_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SegmentRecorder::builder(config(dir.path())).recording_id("again").build().unwrap();

    recorder.start().await.unwrap();
    recorder.handle_frame(&[0u8; 5]).await.unwrap();
    let first = recorder.stop().await.unwrap();

    recorder.start().await.unwrap();
    recorder.handle_frame(&[0u8; 7]).await.unwrap();
    let second = recorder.stop().await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.start_time, first.start_time);
    assert_eq!(second.segments.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(second.total_size, 12);
  }

  #[tokio::test]
  async fn test_size_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.max_segment_size_mb = 1.0 / 1024.0; // 1 KiB
    let recorder = SegmentRecorder::new(cfg).unwrap();

    recorder.start().await.unwrap();
    for _ in 0..5 {
      recorder.handle_frame(&[0u8; 600]).await.unwrap();
    }
    let metadata = recorder.stop().await.unwrap();

    // 600+600 passes the limit, so frames land as [2, 2, 1]
    assert_eq!(metadata.segment_count, 3);
    let sizes: Vec<u64> = metadata.segments.iter().map(|s| s.size_bytes).collect();
    assert_eq!(sizes, vec![1200, 1200, 600]);
    assert_eq!(metadata.total_size, 3000);
  }

  #[tokio::test]
  async fn test_duration_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.segment_duration_secs = 0.2;
    let recorder = SegmentRecorder::new(cfg).unwrap();

    recorder.start().await.unwrap();
    for _ in 0..6 {
      recorder.handle_frame(&[0u8; 100]).await.unwrap();
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let metadata = recorder.stop().await.unwrap();

    assert!(metadata.segment_count >= 2, "got {} segments", metadata.segment_count);
    assert_eq!(metadata.segments.len(), metadata.segment_count);
    assert_eq!(metadata.total_size, 600);
    assert_eq!(metadata.total_size, metadata.segments.iter().map(|s| s.size_bytes).sum::<u64>());
  }

  #[tokio::test]
  async fn test_encrypted_frames_decrypt_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EncryptionEngine::new(EncryptionConfig::with_mode(EncryptionMode::AesGcm)));
    let recorder = SegmentRecorder::builder(config(dir.path()))
      .recording_id("sealed")
      .encryption(Arc::clone(&engine))
      .build()
      .unwrap();

    recorder.start().await.unwrap();
    recorder.handle_frame(b"frame-one").await.unwrap();
    recorder.handle_frame(b"frame-two").await.unwrap();
    let metadata = recorder.stop().await.unwrap();

    let bytes = tokio::fs::read(dir.path().join("sealed").join("segment_0.mp4")).await.unwrap();
    assert_eq!(metadata.total_size, bytes.len() as u64);
    let frames = engine.open_frames(&bytes).unwrap();
    assert_eq!(frames, vec![b"frame-one".to_vec(), b"frame-two".to_vec()]);
  }

  #[tokio::test]
  async fn test_thumbnail_attached_to_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.generate_thumbnails = true;
    cfg.thumbnail_interval_secs = 0.1;
    let stub = Arc::new(StubThumbnails {
      calls: AtomicUsize::new(0),
      fail: false,
    });
    let recorder = SegmentRecorder::builder(cfg)
      .recording_id("thumbs")
      .thumbnail_generator(stub.clone())
      .build()
      .unwrap();

    recorder.start().await.unwrap();
    recorder.handle_frame(&[0u8; 10]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let metadata = recorder.stop().await.unwrap();

    assert!(stub.calls.load(Ordering::SeqCst) >= 1);
    let thumbnail = metadata.segments[0].thumbnail_filename.clone().unwrap();
    assert!(thumbnail.starts_with("thumbnail_0_"));
    assert!(dir.path().join("thumbs").join(THUMBNAILS_DIR).join(thumbnail).exists());
  }

  #[tokio::test]
  async fn test_thumbnail_failure_is_warning_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.generate_thumbnails = true;
    cfg.thumbnail_interval_secs = 0.05;
    let recorder = SegmentRecorder::builder(cfg)
      .thumbnail_generator(Arc::new(StubThumbnails {
        calls: AtomicUsize::new(0),
        fail: true,
      }))
      .build()
      .unwrap();
    let mut rx = recorder.subscribe();

    recorder.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.state().await, RecordingState::Recording);
    recorder.stop().await.unwrap();

    let names = drain(&mut rx);
    assert!(names.contains(&"warning".to_string()));
    assert!(!names.contains(&"error".to_string()));
  }

  #[tokio::test]
  async fn test_write_failure_moves_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SegmentRecorder::builder(config(dir.path())).recording_id("gone").build().unwrap();
    let mut rx = recorder.subscribe();

    recorder.start().await.unwrap();
    recorder.handle_frame(&[0u8; 10]).await.unwrap();
    tokio::fs::remove_dir_all(dir.path().join("gone")).await.unwrap();

    // The open descriptor outlives the unlink; the next segment cannot be created
    recorder.pause().await.unwrap();
    assert!(matches!(recorder.resume().await, Err(RecorderError::Io(_))));
    assert_eq!(recorder.state().await, RecordingState::Error);
    assert!(recorder.last_error().await.is_some());

    let names = drain(&mut rx);
    assert!(names.contains(&"error".to_string()));
    assert_eq!(names.last().map(String::as_str), Some("state_change"));
  }
}
