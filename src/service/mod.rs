pub use app_error::{AppError, AppResult};
pub use config::{
    ClaimConfig, ConsumerConfig, ReclaimerConfig, RedisConfig, RetryConfig, StreamConfig,
    TelemetryConfig,
};
pub use metrics::Metrics;
pub use shutdown::{Shutdown, StopSignal};
pub use supervisor::{RunSummary, Supervisor};
pub use tracing_config::{setup_local_tracing, setup_tracing, TelemetryGuard};

mod app_error;
mod config;
mod metrics;
mod shutdown;
mod supervisor;
mod tracing_config;
