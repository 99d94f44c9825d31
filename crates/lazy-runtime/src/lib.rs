#[macro_use]
mod log_macros;

pub mod consul;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod sink;
pub mod source;
pub mod task;
pub mod tracing_init;

pub use error::{RuntimeError, RuntimeReason, RuntimeResult};
pub use lifecycle::{Engine, wait_for_signal};
pub use metrics::MetricsRegistry;
pub use pool::{TaskPool, Worker};
pub use task::PipelineTask;
