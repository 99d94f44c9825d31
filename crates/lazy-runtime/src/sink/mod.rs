mod breaker;
mod bulk;
mod kafka;
mod nsq;

use std::sync::Arc;

use async_trait::async_trait;
use orion_error::StructError;
use tokio::sync::mpsc;

use lazy_config::ConnectorConfig;
use lazy_core::Record;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::MetricsRegistry;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker};
pub use bulk::BulkSink;
pub use kafka::KafkaSink;
pub use nsq::NsqSink;

/// Capacity of the workers→sink channel; emission blocks when full, which
/// is the backpressure the pipeline relies on.
pub const SINK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Sink contract
// ---------------------------------------------------------------------------

/// A running record consumer. The consumer task is spawned at construction
/// around the channel handed to the builder; `stop` returns once it has
/// exited and resources are released.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn stop(&self);
}

/// Build and start a sink from its `Type`-discriminated config.
pub async fn build_sink(
    config: &ConnectorConfig,
    task_id: &str,
    rx: mpsc::Receiver<Record>,
    metrics: Arc<MetricsRegistry>,
) -> RuntimeResult<Box<dyn Sink>> {
    match config.kind.as_str() {
        "elasticsearch" => Ok(Box::new(
            BulkSink::start(config, task_id, rx, metrics).await?,
        )),
        "kafka" => Ok(Box::new(KafkaSink::start(config, task_id, rx, metrics)?)),
        "nsq" => Ok(Box::new(NsqSink::start(config, task_id, rx, metrics)?)),
        other => Err(StructError::from(RuntimeReason::Construction)
            .with_detail(format!("not supported sink {other:?}"))),
    }
}
