use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use orion_error::StructError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_nsq::{NSQProducerConfig, NSQTopic};
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::Record;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricKey, MetricsRegistry};

use super::Sink;
use super::kafka::record_payload;

// ---------------------------------------------------------------------------
// NsqSink — structured-record producer
// ---------------------------------------------------------------------------

/// Publishes each record to one NSQ topic over a direct nsqd connection;
/// payload selection matches the Kafka sink (`rawmsg` bytes, else JSON).
pub struct NsqSink {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl NsqSink {
    pub fn start(
        config: &ConnectorConfig,
        task_id: &str,
        mut rx: mpsc::Receiver<Record>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let address = config.string_param("NSQAddress", "");
        if address.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("nsq sink requires NSQAddress"));
        }
        let topic_name = config.string_param("Topic", "");
        let topic = NSQTopic::new(topic_name.clone()).ok_or_else(|| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("bad nsq topic {topic_name:?}"))
        })?;

        let labels = [("task", task_id)];
        let published = metrics.counter("lazy_sink_nsq_published_total", &labels);
        let metric_keys = vec![MetricKey::new("lazy_sink_nsq_published_total", &labels)];

        let mut producer = NSQProducerConfig::new(address).build();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task_label = task_id.to_string();
        let task = tokio::spawn(async move {
            lz_info!(sink, task = %task_label, topic = %topic_name, "nsq producer started");
            loop {
                let record = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    record = rx.recv() => record,
                };
                let Some(record) = record else { break };
                let payload = record_payload(&record);
                match producer.publish(&topic, payload).await {
                    Ok(()) => {
                        published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        lz_warn!(sink, task = %task_label, error = %e, "nsq publish failed");
                    }
                }
            }
            lz_info!(sink, task = %task_label, "nsq producer stopped");
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
impl Sink for NsqSink {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.metrics.unregister(&self.metric_keys);
    }
}
