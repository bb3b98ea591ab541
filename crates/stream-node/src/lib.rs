//! Live camera ingestion: source connection, frame fan-out to outputs,
//! health monitoring with reconnect, and per-output recording.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod source;

pub use config::{HealthMonitorPolicy, PipelineConfig, ServiceConfig};
pub use error::PipelineError;
pub use pipeline::{IngestionPipeline, OutputStats, PipelineBuilder, PipelineStats};
pub use relay::{relay_args, run_relay, RelaySettings};
pub use source::{connect_with_retry, FfprobeConnector, OwnedProcess, SourceConnection, SourceConnector};
