//! Ambient service layer: errors, configuration, logging setup, shutdown
//! signaling and the transport-agnostic consumer protocol surface.

mod app_error;
mod config;
mod pipeline;
mod shutdown;
mod tracing_config;

pub use app_error::{AppError, AppResult};
pub use config::{AssemblerConfig, BatchMode, MetaConfig, PipelineConfig, StoreConfig};
pub use pipeline::{
    recovery_backoff, resume_position, Batch, LogSink, PipelineService, NO_BATCH_ID,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};
