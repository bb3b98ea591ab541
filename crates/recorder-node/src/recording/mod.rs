mod recorder;
mod sink;
pub mod thumbnail;

pub use recorder::{RecorderBuilder, RecorderStats, SegmentRecorder, METADATA_FILENAME, THUMBNAILS_DIR};
pub use thumbnail::{FfmpegThumbnailGenerator, ThumbnailGenerator};
