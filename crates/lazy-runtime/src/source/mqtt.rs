use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use orion_error::StructError;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::RawRecord;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricKey, MetricsRegistry};

use super::Source;

// ---------------------------------------------------------------------------
// MqttSource — broker subscriber
// ---------------------------------------------------------------------------

/// Subscribes to one topic filter and yields `"{topic} {payload}"` records,
/// so downstream parsers can dispatch on the topic. Re-subscribes on every
/// (re)connect acknowledgement.
pub struct MqttSource {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl MqttSource {
    pub fn start(
        config: &ConnectorConfig,
        task_id: &str,
        tx: mpsc::Sender<RawRecord>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let broker = config.string_param("BrokerURL", "");
        let (host, port) = parse_broker_url(&broker).ok_or_else(|| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("bad mqtt BrokerURL {broker:?}"))
        })?;
        let topic = config.string_param("Topic", "#");
        let client_id = config.string_param("Name", task_id);

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(config.bool_param("CleanSession"));
        let user = config.string_param("UserName", "");
        if !user.is_empty() {
            options.set_credentials(user, config.string_param("Password", ""));
        }

        let labels = [("task", task_id)];
        let consumed = metrics.counter("lazy_source_mqtt_messages_total", &labels);
        let metric_keys = vec![MetricKey::new("lazy_source_mqtt_messages_total", &labels)];

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task_label = task_id.to_string();
        let task = tokio::spawn(async move {
            lz_info!(src, task = %task_label, topic = %topic, "mqtt subscriber started");
            loop {
                let event = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                            lz_warn!(src, task = %task_label, error = %e, "mqtt subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.payload.as_ref() == b"Connected" {
                            continue;
                        }
                        let mut msg = publish.topic.clone().into_bytes();
                        msg.push(b' ');
                        msg.extend_from_slice(&publish.payload);
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            sent = tx.send(RawRecord::new(msg)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        lz_warn!(src, task = %task_label, error = %e, "mqtt connection error");
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            lz_info!(src, task = %task_label, "mqtt subscriber stopped");
        });

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
            metrics,
            metric_keys,
        })
    }
}

/// `"tcp://host:port"`, `"host:port"`, or bare `"host"` (default port 1883).
fn parse_broker_url(url: &str) -> Option<(String, u16)> {
    let trimmed = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) => port.parse().ok().map(|p| (host.to_string(), p)),
        None => Some((trimmed.to_string(), 1883)),
    }
}

#[async_trait]
impl Source for MqttSource {
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
    fn broker_url_parsing() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883"),
            Some(("localhost".to_string(), 1883))
        );
        assert_eq!(
            parse_broker_url("broker.local:8883"),
            Some(("broker.local".to_string(), 8883))
        );
        assert_eq!(
            parse_broker_url("justhost"),
            Some(("justhost".to_string(), 1883))
        );
        assert_eq!(parse_broker_url(""), None);
        assert_eq!(parse_broker_url("tcp://host:nan"), None);
    }
}
