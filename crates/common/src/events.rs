//! Typed lifecycle events shared by the pipeline and its recorders.
//!
//! Every component publishes onto an [`EventBus`]; collaborators (metadata
//! indexers, notification fan-out) hold a receiver from [`EventBus::subscribe`].
//! Subscribers that fall behind lose the oldest events rather than stalling
//! the producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::recordings::RecordingSegment;
use crate::streams::{MediaTrackInfo, StreamHealthStatus};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
  /// Owning stream or recording id
  pub source_id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: EventKind,
}

impl Event {
  pub fn new(source_id: impl Into<String>, kind: EventKind) -> Self {
    Self {
      source_id: source_id.into(),
      timestamp: Utc::now(),
      kind,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
  Connect {
    url: String,
  },
  Start,
  Stop {
    duration_seconds: f64,
    #[serde(default)]
    segment_count: Option<usize>,
  },
  Pause,
  Resume,
  SegmentComplete {
    segment: RecordingSegment,
  },
  Error {
    message: String,
  },
  Warning {
    message: String,
  },
  StateChange {
    from: String,
    to: String,
  },
  Reconnect {
    attempt: u32,
  },
  HealthStatus {
    health: StreamHealthStatus,
  },
  TrackAdded {
    track: MediaTrackInfo,
  },
  TrackRemoved {
    track_id: String,
  },
  Data {
    output_key: String,
    bytes: usize,
  },
  RecordingStart {
    output_key: String,
    recording_id: String,
  },
  RecordingStop {
    output_key: String,
    recording_id: String,
    segment_count: usize,
    total_size: u64,
  },
}

impl EventKind {
  pub fn name(&self) -> &'static str {
    match self {
      EventKind::Connect { .. } => "connect",
      EventKind::Start => "start",
      EventKind::Stop { .. } => "stop",
      EventKind::Pause => "pause",
      EventKind::Resume => "resume",
      EventKind::SegmentComplete { .. } => "segment_complete",
      EventKind::Error { .. } => "error",
      EventKind::Warning { .. } => "warning",
      EventKind::StateChange { .. } => "state_change",
      EventKind::Reconnect { .. } => "reconnect",
      EventKind::HealthStatus { .. } => "health_status",
      EventKind::TrackAdded { .. } => "track_added",
      EventKind::TrackRemoved { .. } => "track_removed",
      EventKind::Data { .. } => "data",
      EventKind::RecordingStart { .. } => "recording_start",
      EventKind::RecordingStop { .. } => "recording_stop",
    }
  }

  pub fn state_change(from: impl ToString, to: impl ToString) -> Self {
    EventKind::StateChange {
      from: from.to_string(),
      to: to.to_string(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(DEFAULT_EVENT_CAPACITY)
  }
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.tx.subscribe()
  }

  /// Publish an event. Having no subscribers is not an error.
  pub fn emit(&self, source_id: &str, kind: EventKind) {
    tracing::trace!(source_id = %source_id, event = kind.name(), "emit");
    let _ = self.tx.send(Event::new(source_id, kind));
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}
