mod file;
mod kafka;
mod mqtt;
mod nsq;

use std::sync::Arc;

use async_trait::async_trait;
use orion_error::StructError;
use tokio::sync::mpsc;

use lazy_config::ConnectorConfig;
use lazy_core::RawRecord;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::MetricsRegistry;

pub use file::FileSource;
pub use kafka::KafkaSource;
pub use mqtt::MqttSource;
pub use nsq::NsqSource;

/// Capacity of the source→workers channel. Small on purpose: a slow sink
/// must push back to the producers, not buffer unboundedly.
pub const SOURCE_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

/// A running record producer. Producer tasks are spawned at construction and
/// push [`RawRecord`]s into the channel handed to the builder; `stop` returns
/// once every producer task has exited and resources are released.
#[async_trait]
pub trait Source: Send + Sync {
    async fn stop(&self);
}

/// Build and start a source from its `Type`-discriminated config.
///
/// `task_name` is the stable task identity (checkpoint scope); `task_id`
/// additionally carries the instance sequence and labels the metrics.
pub async fn build_source(
    config: &ConnectorConfig,
    task_name: &str,
    task_id: &str,
    tx: mpsc::Sender<RawRecord>,
    metrics: Arc<MetricsRegistry>,
) -> RuntimeResult<Box<dyn Source>> {
    match config.kind.as_str() {
        "file" => Ok(Box::new(
            FileSource::start(config, task_name, task_id, tx, metrics).await?,
        )),
        "nsq" => Ok(Box::new(NsqSource::start(config, task_id, tx, metrics)?)),
        "kafka" => Ok(Box::new(KafkaSource::start(config, task_id, tx, metrics)?)),
        "mqtt" => Ok(Box::new(MqttSource::start(config, task_id, tx, metrics)?)),
        other => Err(StructError::from(RuntimeReason::Construction)
            .with_detail(format!("not supported data source {other:?}"))),
    }
}
