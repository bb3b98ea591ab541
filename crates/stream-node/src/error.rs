use common::streams::PipelineState;
use recorder_node::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("invalid pipeline config: {0}")]
  Config(String),

  #[error("pipeline is already streaming")]
  AlreadyStreaming,

  #[error("cannot {operation} while {state}")]
  InvalidState {
    operation: &'static str,
    state: PipelineState,
  },

  #[error("failed to connect to {url}: {message}")]
  Connection { url: String, message: String },

  #[error("timed out connecting to {url} after {timeout_secs}s")]
  ConnectionTimeout { url: String, timeout_secs: f64 },

  #[error("start was cancelled by stop")]
  Cancelled,

  #[error("giving up after {attempts} reconnect attempts without receiving frames")]
  ReconnectExhausted { attempts: u32 },

  #[error(transparent)]
  Recorder(#[from] RecorderError),
}

impl PipelineError {
  pub(crate) fn connection(url: &str, message: impl std::fmt::Display) -> Self {
    PipelineError::Connection {
      url: url.to_string(),
      message: message.to_string(),
    }
  }

  pub fn is_connection(&self) -> bool {
    matches!(self, PipelineError::Connection { .. } | PipelineError::ConnectionTimeout { .. })
  }
}
