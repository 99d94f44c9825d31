use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use orion_error::StructError;
use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::RawRecord;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricKey, MetricsRegistry};

use super::Source;

// ---------------------------------------------------------------------------
// KafkaSource — consumer-group subscriber
// ---------------------------------------------------------------------------

/// Consumes one or more topics in a consumer group and yields the raw
/// message payloads. Offsets are auto-committed by the client.
pub struct KafkaSource {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl KafkaSource {
    pub fn start(
        config: &ConnectorConfig,
        task_id: &str,
        tx: mpsc::Sender<RawRecord>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let brokers = config.string_param("KafkaBrokers", "");
        let topics: Vec<String> = config
            .string_param("Topics", "")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() || topics.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("kafka source requires KafkaBrokers and Topics"));
        }
        let group = config.string_param("ConsumerGroup", "lazy");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &group)
            .set("bootstrap.servers", &brokers)
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| {
                StructError::from(RuntimeReason::Construction)
                    .with_detail(format!("create kafka consumer: {e}"))
            })?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(|e| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("subscribe {topics:?}: {e}"))
        })?;

        let labels = [("task", task_id)];
        let consumed = metrics.counter("lazy_source_kafka_messages_total", &labels);
        let metric_keys = vec![MetricKey::new("lazy_source_kafka_messages_total", &labels)];

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task_label = task_id.to_string();
        let task = tokio::spawn(async move {
            lz_info!(src, task = %task_label, topics = ?topics, "kafka consumer started");
            loop {
                let received = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    received = consumer.recv() => received,
                };
                match received {
                    Ok(message) => {
                        let Some(payload) = message.payload() else {
                            continue;
                        };
                        let record = RawRecord::new(payload.to_vec());
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            sent = tx.send(record) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        lz_warn!(src, task = %task_label, error = %e, "kafka receive error");
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            lz_info!(src, task = %task_label, "kafka consumer stopped");
        });

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
            metrics,
            metric_keys,
        })
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.metrics.unregister(&self.metric_keys);
    }
}
