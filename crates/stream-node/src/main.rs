use anyhow::Context;
use clap::Parser;
use common::events::EventKind;
use frame_crypto::EncryptionEngine;
use recorder_node::FfmpegThumbnailGenerator;
use std::path::PathBuf;
use std::sync::Arc;
use stream_node::{run_relay, FfprobeConnector, IngestionPipeline, PipelineConfig, RelaySettings, ServiceConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stream-node")]
#[command(about = "Ingest one camera stream, fan it out and record it", long_about = None)]
struct Cli {
  /// Pipeline definition (YAML)
  #[arg(long, env = "PIPELINE_CONFIG")]
  config: PathBuf,

  /// Connect and configure outputs, but do not spawn the ffmpeg relay
  #[arg(long, env = "NO_RELAY")]
  no_relay: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let _guard = telemetry::init_structured_logging(
    telemetry::LogConfig::new("stream-node").with_version(env!("CARGO_PKG_VERSION")),
  );

  let service = ServiceConfig::from_env()?;
  let mut config = PipelineConfig::from_yaml_file(&cli.config)?;
  service.apply_defaults(&mut config);

  let engine = config
    .encryption
    .clone()
    .map(|cfg| Arc::new(EncryptionEngine::new(cfg)));

  let mut builder = IngestionPipeline::builder(config, Arc::new(FfprobeConnector::new(service.ffprobe_bin.clone())))
    .thumbnail_generator(Arc::new(FfmpegThumbnailGenerator::with_binary(service.ffmpeg_bin.clone())));
  if let Some(engine) = &engine {
    if engine.start_rotation() {
      info!(algorithm = %engine.algorithm(), "key rotation scheduled");
    }
    builder = builder.encryption(Arc::clone(engine));
  }
  let pipeline = builder.build().context("failed to build pipeline")?;

  let mut events = pipeline.subscribe();
  tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(event) => match &event.kind {
          EventKind::Data { .. } => {}
          EventKind::Error { message } => error!(source = %event.source_id, %message, "pipeline event"),
          EventKind::Warning { message } => warn!(source = %event.source_id, %message, "pipeline event"),
          kind => debug!(source = %event.source_id, event = kind.name(), "pipeline event"),
        },
        Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagging"),
        Err(RecvError::Closed) => break,
      }
    }
  });

  pipeline.start().await?;
  info!(stream_id = %pipeline.stream_id(), "stream-node started");

  let token = CancellationToken::new();
  let relay = (!cli.no_relay).then(|| {
    tokio::spawn(run_relay(
      pipeline.clone(),
      RelaySettings::from(&service),
      token.clone(),
    ))
  });

  tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
  info!("shutdown requested");

  token.cancel();
  if let Some(relay) = relay {
    let _ = relay.await;
  }
  pipeline.stop().await?;
  if let Some(engine) = engine {
    engine.shutdown().await;
  }
  Ok(())
}
