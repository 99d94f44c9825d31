use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local};
use orion_error::StructError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::Record;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{Counter, MetricKey, MetricsRegistry};

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::Sink;

const ROLLOVER_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_PAUSE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// BulkSink — batched, circuit-broken Elasticsearch indexer
// ---------------------------------------------------------------------------

/// Groups records into `_bulk` requests sized by count and time, rolls the
/// target index daily, and retries a failed batch (same buffer, 1 s pause)
/// until it lands or the sink shuts down. Shutdown abandons at most one
/// unflushed batch.
pub struct BulkSink {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl BulkSink {
    pub async fn start(
        config: &ConnectorConfig,
        task_id: &str,
        rx: mpsc::Receiver<Record>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let endpoints: Vec<String> = config
            .string_param("ElasticSearchEndPoint", "")
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| {
                let e = e.trim_end_matches('/');
                if e.starts_with("http://") || e.starts_with("https://") {
                    e.to_string()
                } else {
                    format!("http://{e}")
                }
            })
            .collect();
        if endpoints.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("elasticsearch sink requires ElasticSearchEndPoint"));
        }

        let breaker = BreakerConfig {
            timeout: Duration::from_millis(config.u64_param("Timeout", 1000).max(1000)),
            request_volume_threshold: config.u64_param("RequestVolumeThreshold", 20_000),
            max_concurrent: config.usize_param("MaxConcurrentRequests", 100),
            error_percent_threshold: config.u64_param("ErrorPercentThreshold", 25) as u8,
            ..BreakerConfig::default()
        };

        let client = reqwest::Client::new();
        let major = probe_major_version(&client, &endpoints[0]).await?;
        lz_info!(sink, task = %task_id, version = major, "elasticsearch backend detected");

        let labels = [("task", task_id)];
        let worker = BulkWorker {
            client,
            endpoints,
            endpoint_idx: 0,
            index_prefix: config.string_param("IndexPerfix", "lazy"),
            index_type: config.string_param("IndexType", "logs"),
            // Majors before 7 still carry a mapping type in the envelope.
            include_type: major < 7,
            bulk_count: config.usize_param("BulkCount", 100).max(1),
            flush_timeout: Duration::from_secs(config.u64_param("FlushTimeout", 5).max(1)),
            breaker: CircuitBreaker::new(breaker),
            buf: String::new(),
            pending: 0,
            indexed: metrics.counter("lazy_sink_bulk_indexed_total", &labels),
            failed: metrics.counter("lazy_sink_bulk_failed_total", &labels),
            flushed: metrics.counter("lazy_sink_bulk_flushed_total", &labels),
            cancel: CancellationToken::new(),
            task_id: task_id.to_string(),
        };
        let metric_keys = vec![
            MetricKey::new("lazy_sink_bulk_indexed_total", &labels),
            MetricKey::new("lazy_sink_bulk_failed_total", &labels),
            MetricKey::new("lazy_sink_bulk_flushed_total", &labels),
        ];

        let cancel = worker.cancel.clone();
        let task = tokio::spawn(worker.run(rx));

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
            metrics,
            metric_keys,
        })
    }
}

#[async_trait]
impl Sink for BulkSink {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.metrics.unregister(&self.metric_keys);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct BulkWorker {
    client: reqwest::Client,
    endpoints: Vec<String>,
    endpoint_idx: usize,
    index_prefix: String,
    index_type: String,
    include_type: bool,
    bulk_count: usize,
    flush_timeout: Duration,
    breaker: CircuitBreaker,
    buf: String,
    pending: usize,
    indexed: Counter,
    failed: Counter,
    flushed: Counter,
    cancel: CancellationToken,
    task_id: String,
}

impl BulkWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Record>) {
        let mut flush_tick = tokio::time::interval(self.flush_timeout);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut roll_tick = tokio::time::interval(ROLLOVER_INTERVAL);
        let mut index_name = self.current_index();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = roll_tick.tick() => {
                    index_name = self.current_index();
                }
                _ = flush_tick.tick() => {
                    if self.pending > 0 {
                        self.flush().await;
                    }
                }
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    self.append(&index_name, &record);
                    if self.pending >= self.bulk_count {
                        self.flush().await;
                    }
                }
            }
        }
        lz_info!(sink, task = %self.task_id, "bulk indexer stopped");
    }

    fn current_index(&self) -> String {
        current_index(&self.index_prefix)
    }

    /// Append one envelope/document line pair.
    fn append(&mut self, index_name: &str, record: &Record) {
        let doc = match serde_json::to_string(record) {
            Ok(doc) => doc,
            Err(e) => {
                lz_warn!(sink, task = %self.task_id, error = %e, "record serialize failed");
                return;
            }
        };
        if self.include_type {
            self.buf.push_str(&format!(
                "{{\"index\":{{\"_index\":\"{index_name}\",\"_type\":\"{}\"}}}}\n",
                self.index_type
            ));
        } else {
            self.buf
                .push_str(&format!("{{\"index\":{{\"_index\":\"{index_name}\"}}}}\n"));
        }
        self.buf.push_str(&doc);
        self.buf.push('\n');
        self.pending += 1;
    }

    /// Submit the buffer, retrying the identical batch until it lands or
    /// shutdown interrupts. The buffer is only reset on success, so no
    /// record is lost to a transient backend failure.
    async fn flush(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let endpoint = self.endpoints[self.endpoint_idx % self.endpoints.len()].clone();
            self.endpoint_idx = self.endpoint_idx.wrapping_add(1);
            let submit = submit_bulk(&self.client, &endpoint, &self.buf);
            match self.breaker.call(submit).await {
                Ok(()) => {
                    self.indexed
                        .fetch_add(self.pending as u64, Ordering::Relaxed);
                    self.flushed.fetch_add(1, Ordering::Relaxed);
                    self.buf.clear();
                    self.pending = 0;
                    return;
                }
                Err(e) => {
                    self.failed
                        .fetch_add(self.pending as u64, Ordering::Relaxed);
                    lz_warn!(sink, task = %self.task_id, endpoint = %endpoint, error = %e, "bulk submit failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_PAUSE) => {}
                    }
                }
            }
        }
    }
}

/// `{prefix}-YYYY.M.D` from the current local date; month and day are not
/// zero-padded.
fn current_index(prefix: &str) -> String {
    let today = Local::now();
    format!(
        "{}-{}.{}.{}",
        prefix,
        today.year(),
        today.month(),
        today.day()
    )
}

async fn submit_bulk(client: &reqwest::Client, endpoint: &str, body: &str) -> anyhow::Result<()> {
    let response = client
        .post(format!("{endpoint}/_bulk"))
        .header("content-type", "application/x-ndjson")
        .body(body.to_string())
        .send()
        .await?;
    response.error_for_status()?;
    Ok(())
}

/// `GET /` → `{"version": {"number": "7.10.2"}}`; selects the envelope
/// dialect.
async fn probe_major_version(client: &reqwest::Client, endpoint: &str) -> RuntimeResult<u32> {
    let info: serde_json::Value = client
        .get(endpoint)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("elasticsearch info probe {endpoint}: {e}"))
        })?
        .json()
        .await
        .map_err(|e| {
            StructError::from(RuntimeReason::Construction)
                .with_detail(format!("elasticsearch info decode: {e}"))
        })?;
    let number = info
        .get("version")
        .and_then(|v| v.get("number"))
        .and_then(|n| n.as_str())
        .unwrap_or("7");
    Ok(number
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .unwrap_or(7))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
