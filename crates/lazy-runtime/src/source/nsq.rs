use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use orion_error::StructError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_nsq::{
    NSQChannel, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig, NSQTopic,
};
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::RawRecord;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricKey, MetricsRegistry};

use super::Source;

// ---------------------------------------------------------------------------
// NsqSource — lookupd-discovered NSQ consumer
// ---------------------------------------------------------------------------

/// Consumes one topic/channel pair via nsqlookupd discovery and yields the
/// raw message bodies.
pub struct NsqSource {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl NsqSource {
    pub fn start(
        config: &ConnectorConfig,
        task_id: &str,
        tx: mpsc::Sender<RawRecord>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let topic_name = config.string_param("Topic", "");
        let topic = NSQTopic::new(topic_name.clone()).ok_or_else(|| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("bad nsq topic {topic_name:?}"))
        })?;
        let channel_name = config.string_param("Channel", "lazy");
        let channel = NSQChannel::new(channel_name.clone()).ok_or_else(|| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("bad nsq channel {channel_name:?}"))
        })?;

        let lookupds: HashSet<String> = config
            .string_param("LookupdAddresses", "")
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| {
                if a.starts_with("http://") || a.starts_with("https://") {
                    a.to_string()
                } else {
                    format!("http://{a}")
                }
            })
            .collect();
        if lookupds.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("nsq source requires LookupdAddresses"));
        }
        let max_in_flight = config.u64_param("MaxInFlight", 100) as u32;

        let labels = [("task", task_id)];
        let consumed = metrics.counter("lazy_source_nsq_messages_total", &labels);
        let metric_keys = vec![MetricKey::new("lazy_source_nsq_messages_total", &labels)];

        let mut consumer = NSQConsumerConfig::new(topic, channel)
            .set_max_in_flight(max_in_flight)
            .set_sources(NSQConsumerConfigSources::Lookup(
                NSQConsumerLookupConfig::new().set_addresses(lookupds),
            ))
            .build();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task_label = task_id.to_string();
        let task = tokio::spawn(async move {
            lz_info!(src, task = %task_label, topic = %topic_name, "nsq consumer started");
            loop {
                let message = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    message = consumer.consume_filtered() => message,
                };
                let Some(message) = message else { break };
                let record = RawRecord::new(message.body.clone());
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    sent = tx.send(record) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                consumed.fetch_add(1, Ordering::Relaxed);
                message.finish().await;
            }
            lz_info!(src, task = %task_label, "nsq consumer stopped");
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
impl Source for NsqSource {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.metrics.unregister(&self.metric_keys);
    }
}
