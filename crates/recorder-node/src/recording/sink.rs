use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Buffered append-only writer for one segment file.
pub(crate) struct SegmentSink {
  path: PathBuf,
  writer: BufWriter<File>,
  written: u64,
}

impl SegmentSink {
  pub(crate) async fn create(path: PathBuf) -> std::io::Result<Self> {
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path).await?;
    Ok(Self {
      path,
      writer: BufWriter::new(file),
      written: 0,
    })
  }

  pub(crate) fn path(&self) -> &Path {
    &self.path
  }

  pub(crate) fn written(&self) -> u64 {
    self.written
  }

  /// Suspends until the buffer accepts every byte
  pub(crate) async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
    self.writer.write_all(bytes).await?;
    self.written += bytes.len() as u64;
    Ok(())
  }

  pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
    self.writer.flush().await
  }

  /// Flush, sync and close. Returns the byte count.
  pub(crate) async fn finish(mut self) -> std::io::Result<u64> {
    self.writer.flush().await?;
    let mut file = self.writer.into_inner();
    file.sync_all().await?;
    file.shutdown().await?;
    Ok(self.written)
  }
}
