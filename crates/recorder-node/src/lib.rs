//! Segmented recording of a live frame stream to disk.

pub mod error;
pub mod recording;

pub use error::RecorderError;
pub use recording::{
  FfmpegThumbnailGenerator, RecorderBuilder, RecorderStats, SegmentRecorder, ThumbnailGenerator, METADATA_FILENAME,
  THUMBNAILS_DIR,
};
