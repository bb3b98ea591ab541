//! Thumbnail extraction for in-progress segments

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Produces a still image for a segment file.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(&self, segment_path: &Path, output_path: &Path) -> Result<()>;
}

/// ffmpeg-backed generator: grabs the first decodable frame of the segment.
#[derive(Debug, Clone)]
pub struct FfmpegThumbnailGenerator {
    pub ffmpeg_bin: String,
    pub width: u32,
    pub height: u32,
    /// JPEG qscale, 2 (best) to 31
    pub quality: u32,
    pub timeout: Duration,
}

impl Default for FfmpegThumbnailGenerator {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            width: 320,
            height: 180,
            quality: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

impl FfmpegThumbnailGenerator {
    pub fn with_binary(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ..Self::default()
        }
    }

    fn build_args(&self, segment_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            "0".to_string(),
            "-i".to_string(),
            segment_path.to_string_lossy().to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
        ];

        if self.width > 0 || self.height > 0 {
            let scale = match (self.width, self.height) {
                (w, h) if w > 0 && h > 0 => format!("scale={}:{}", w, h),
                (w, _) if w > 0 => format!("scale={}:-1", w),
                (_, h) => format!("scale=-1:{}", h),
            };
            args.push("-vf".to_string());
            args.push(scale);
        }

        args.push("-q:v".to_string());
        args.push(self.quality.clamp(2, 31).to_string());
        args.push("pipe:1".to_string());
        args
    }
}

#[async_trait]
impl ThumbnailGenerator for FfmpegThumbnailGenerator {
    async fn generate(&self, segment_path: &Path, output_path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(segment_path).await.unwrap_or(false) {
            anyhow::bail!("segment file does not exist: {}", segment_path.display());
        }

        let args = self.build_args(segment_path);
        debug!(segment = %segment_path.display(), args = ?args, "spawning ffmpeg for thumbnail");

        let child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.ffmpeg_bin))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .context("ffmpeg thumbnail timed out")?
            .context("failed to wait for ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg thumbnail failed: {}", stderr.trim());
        }
        if output.stdout.is_empty() {
            anyhow::bail!("ffmpeg produced no thumbnail data");
        }

        tokio::fs::write(output_path, &output.stdout)
            .await
            .with_context(|| format!("failed to write {}", output_path.display()))?;

        debug!(
            segment = %segment_path.display(),
            thumbnail = %output_path.display(),
            size_bytes = output.stdout.len(),
            "thumbnail written"
        );
        Ok(())
    }
}
