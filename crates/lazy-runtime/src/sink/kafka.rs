use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use orion_error::StructError;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::{Record, Value};

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricKey, MetricsRegistry};

use super::Sink;

// ---------------------------------------------------------------------------
// KafkaSink — structured-record producer
// ---------------------------------------------------------------------------

/// Publishes each record to one Kafka topic: the `rawmsg` bytes when the
/// record carries them, otherwise the record's JSON serialization.
pub struct KafkaSink {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl KafkaSink {
    pub fn start(
        config: &ConnectorConfig,
        task_id: &str,
        mut rx: mpsc::Receiver<Record>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let brokers = config.string_param("KafkaBrokers", "");
        let topic = config.string_param("Topic", "");
        if brokers.is_empty() || topic.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("kafka sink requires KafkaBrokers and Topic"));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| {
                StructError::from(RuntimeReason::Construction)
                    .with_detail(format!("create kafka producer: {e}"))
            })?;

        let labels = [("task", task_id)];
        let published = metrics.counter("lazy_sink_kafka_published_total", &labels);
        let metric_keys = vec![MetricKey::new("lazy_sink_kafka_published_total", &labels)];

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task_label = task_id.to_string();
        let task = tokio::spawn(async move {
            lz_info!(sink, task = %task_label, topic = %topic, "kafka producer started");
            loop {
                let record = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    record = rx.recv() => record,
                };
                let Some(record) = record else { break };
                let payload = record_payload(&record);
                let delivery = producer
                    .send(
                        FutureRecord::<(), Vec<u8>>::to(&topic).payload(&payload),
                        Duration::from_secs(0),
                    )
                    .await;
                match delivery {
                    Ok(_) => {
                        published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err((e, _)) => {
                        lz_warn!(sink, task = %task_label, error = %e, "kafka publish failed");
                    }
                }
            }
            lz_info!(sink, task = %task_label, "kafka producer stopped");
        });

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
            metrics,
            metric_keys,
        })
    }
}

pub(super) fn record_payload(record: &Record) -> Vec<u8> {
    match record.get("rawmsg") {
        Some(Value::Str(s)) => s.clone().into_bytes(),
        Some(Value::Bytes(b)) => b.clone(),
        _ => serde_json::to_vec(record).unwrap_or_default(),
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.metrics.unregister(&self.metric_keys);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_prefers_rawmsg() {
        let mut rec = Record::new();
        rec.insert("rawmsg", "the line");
        rec.insert("tag", "x");
        assert_eq!(record_payload(&rec), b"the line");
    }

    #[test]
    fn payload_falls_back_to_json() {
        let mut rec = Record::new();
        rec.insert("tag", "x");
        let payload = record_payload(&rec);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["tag"], "x");
    }
}
