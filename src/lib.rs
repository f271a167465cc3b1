#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod core;
mod error;
mod graph;
mod module;
mod pool;
mod product;
mod session;
mod skip;
mod task;
mod utils;

pub use crate::core::BuildSettings;
pub use crate::error::{BuildError, CacheError, ConfigError, TaskError, TataraError};
pub use crate::module::{ModuleConfig, ModuleGraph};
pub use crate::pool::{ExecutionReport, JobExecution, JobOutcome, JobStatus};
pub use crate::product::{
    OutputInfo, Product, ProductOutcome, ProductPromise, ProductRepository, UsedProducts,
};
pub use crate::session::{ProductInfo, Session, SessionConfig};
pub use crate::skip::hash_sources;
pub use crate::task::{SkipHint, Task, TaskContext, TaskOutput, TaskSpec};

/// Installs a default tracing subscriber for CLI front-ends, wiring the
/// indicatif progress layer so log lines and progress bars don't clobber
/// each other.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = tracing_indicatif::IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}
