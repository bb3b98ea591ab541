//! Frame producer for the binary: remuxes a pull source through ffmpeg and
//! feeds the stdout chunks into [`IngestionPipeline::handle_frame`].

use common::streams::{output_key, OutputFormat, RetryPolicy, StreamSourceConfig, StreamSourceType};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::pipeline::IngestionPipeline;

#[derive(Debug, Clone)]
pub struct RelaySettings {
  pub ffmpeg_bin: String,
  pub chunk_bytes: usize,
  /// Restart budget and backoff between ffmpeg restarts
  pub restart: RetryPolicy,
}

impl From<&ServiceConfig> for RelaySettings {
  fn from(cfg: &ServiceConfig) -> Self {
    Self {
      ffmpeg_bin: cfg.ffmpeg_bin.clone(),
      chunk_bytes: cfg.relay_chunk_bytes,
      restart: RetryPolicy {
        max_retries: cfg.relay_max_retries,
        backoff_start_ms: cfg.relay_backoff_start_ms,
        backoff_max_ms: cfg.relay_backoff_max_ms,
        ..RetryPolicy::default()
      },
    }
  }
}

/// ffmpeg arguments that remux `source` into `format` on stdout.
/// Network inputs carry an I/O timeout equal to the source's connect timeout.
pub fn relay_args(source: &StreamSourceConfig, format: OutputFormat) -> Vec<String> {
  let io_timeout_us = source
    .retry_policy
    .as_ref()
    .map(RetryPolicy::connect_timeout)
    .unwrap_or_else(|| RetryPolicy::default().connect_timeout())
    .as_micros()
    .to_string();

  let mut args = vec!["-loglevel".to_string(), "error".to_string()];
  match source.source_type {
    StreamSourceType::Rtsp => args.extend([
      "-rtsp_transport".to_string(),
      "tcp".to_string(),
      "-timeout".to_string(),
      io_timeout_us,
    ]),
    StreamSourceType::Hls | StreamSourceType::Mjpeg | StreamSourceType::Url => {
      args.extend(["-rw_timeout".to_string(), io_timeout_us])
    }
    StreamSourceType::File | StreamSourceType::WebrtcDirect => {}
  }
  args.extend(["-i".to_string(), source.authenticated_url(), "-c".to_string(), "copy".to_string()]);

  let muxer = match format {
    OutputFormat::RawH264 => "h264",
    OutputFormat::RawVp8 | OutputFormat::RawVp9 => "ivf",
    OutputFormat::Webm => "webm",
    OutputFormat::Mp4 => {
      args.extend(["-movflags".to_string(), "frag_keyframe+empty_moov".to_string()]);
      "mp4"
    }
    OutputFormat::Hls => "mpegts",
    OutputFormat::Mjpeg => "mjpeg",
  };
  args.extend(["-f".to_string(), muxer.to_string(), "pipe:1".to_string()]);
  args
}

/// Relay every configured output until `token` is cancelled. Each relay is
/// respawned whenever the pipeline reconnects its source. Push sources have
/// nothing to pull and return at once.
pub async fn run_relay(pipeline: IngestionPipeline, settings: RelaySettings, token: CancellationToken) {
  let source = pipeline.config().source.clone();
  if !source.source_type.is_pull() {
    info!(stream_id = %pipeline.stream_id(), "push source, no relay started");
    return;
  }

  let mut relays = JoinSet::new();
  for (i, output) in pipeline.config().outputs.iter().enumerate() {
    relays.spawn(relay_output(
      pipeline.clone(),
      output_key(i),
      relay_args(&source, output.format),
      settings.clone(),
      token.clone(),
    ));
  }
  while let Some(res) = relays.join_next().await {
    if let Err(e) = res {
      error!(stream_id = %pipeline.stream_id(), error = %e, "relay task panicked");
    }
  }
}

async fn relay_output(
  pipeline: IngestionPipeline,
  key: String,
  args: Vec<String>,
  settings: RelaySettings,
  token: CancellationToken,
) {
  let id = pipeline.stream_id().to_string();
  let mut reconnects = pipeline.watch_reconnects();
  let mut attempts: u32 = 0;
  let mut buf = vec![0u8; settings.chunk_bytes.max(1)];

  loop {
    let child = Command::new(&settings.ffmpeg_bin)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn();

    let mut delivered = false;
    let mut source_reconnected = false;
    match child {
      Ok(mut child) => {
        debug!(%id, output = %key, pid = ?child.id(), "relay started");
        if let Some(mut stdout) = child.stdout.take() {
          loop {
            let read = tokio::select! {
              _ = token.cancelled() => {
                let _ = child.kill().await;
                return;
              }
              Ok(()) = reconnects.changed() => {
                source_reconnected = true;
                break;
              }
              read = stdout.read(&mut buf) => read,
            };
            match read {
              Ok(0) => break,
              Ok(n) => {
                delivered = true;
                pipeline.handle_frame(&key, &buf[..n]).await;
              }
              Err(e) => {
                warn!(%id, output = %key, error = %e, "relay read failed");
                break;
              }
            }
          }
        }
        let _ = child.kill().await;
      }
      Err(e) => error!(%id, output = %key, error = %e, "failed to spawn ffmpeg"),
    }

    if source_reconnected {
      info!(%id, output = %key, "source reconnected, restarting relay");
      attempts = 0;
      continue;
    }

    if delivered {
      attempts = 0;
    }
    attempts += 1;
    if attempts > settings.restart.max_retries {
      warn!(%id, output = %key, "max retries reached, waiting for source reconnect");
      tokio::select! {
        _ = token.cancelled() => return,
        Ok(()) = reconnects.changed() => {}
      }
      attempts = 0;
      continue;
    }

    let backoff = settings.restart.backoff(attempts);
    warn!(%id, output = %key, attempts, backoff_ms = backoff.as_millis() as u64, "relay exited, restarting");
    tokio::select! {
      _ = token.cancelled() => return,
      Ok(()) = reconnects.changed() => attempts = 0,
      _ = tokio::time::sleep(backoff) => {}
    }
  }
}
