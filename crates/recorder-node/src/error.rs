use frame_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
  #[error("invalid recording config: {0}")]
  Config(String),

  #[error("cannot {operation} while {state}")]
  InvalidState {
    operation: &'static str,
    state: common::recordings::RecordingState,
  },

  #[error("segment io failed: {0}")]
  Io(#[from] std::io::Error),

  #[error("frame encryption failed: {0}")]
  Crypto(#[from] CryptoError),

  #[error("metadata serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl RecorderError {
  /// Label used for the `recorder_failures_total` metric
  pub fn kind(&self) -> &'static str {
    match self {
      RecorderError::Config(_) => "config",
      RecorderError::InvalidState { .. } => "state",
      RecorderError::Io(_) => "io",
      RecorderError::Crypto(_) => "crypto",
      RecorderError::Serialization(_) => "serialization",
    }
  }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
