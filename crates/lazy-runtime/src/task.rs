use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use orion_error::StructError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::TaskConfig;
use lazy_core::filter::{self, Filter, FilterError};
use lazy_core::{LogParser, RawRecord, Record};

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{Counter, MetricKey, MetricsRegistry};
use crate::pool::Worker;
use crate::sink::{self, Sink, SINK_CHANNEL_CAPACITY};
use crate::source::{self, SOURCE_CHANNEL_CAPACITY, Source};

/// Monotonic instance counter: every task start gets a fresh sequence, so
/// metric series from two tasks sharing a name can never collide.
static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// PipelineTask — one source → parser → filter chain → sink pipeline
// ---------------------------------------------------------------------------

/// A running pipeline. Construction builds every component from the task
/// config and spawns the worker loops; [`Worker::stop`] tears everything
/// down in stop-order (source first, sink last).
pub struct PipelineTask {
    name: String,
    task_id: String,
    config_bytes: Vec<u8>,
    cancel: CancellationToken,
    source: Box<dyn Source>,
    sink: Box<dyn Sink>,
    filters: Arc<HashMap<String, Box<dyn Filter>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sink_tx: Mutex<Option<mpsc::Sender<Record>>>,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

impl PipelineTask {
    /// Parse the config, build filters / source / sink, and launch the
    /// parallel worker loops. Filter construction failures are logged and
    /// the filter omitted; source or sink failures fail the whole task.
    pub async fn start(
        name: &str,
        config_bytes: &[u8],
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Arc<Self>> {
        let config = TaskConfig::parse(config_bytes)
            .map_err(|e| StructError::from(RuntimeReason::Config).with_detail(e.to_string()))?;

        let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        let task_id = format!("{name}#{seq}");

        let mut filters: HashMap<String, Box<dyn Filter>> = HashMap::new();
        for (filter_name, filter_config) in &config.filter_settings {
            match filter::build(filter_config) {
                Ok(f) => {
                    filters.insert(filter_name.clone(), f);
                }
                Err(e) => {
                    lz_warn!(conf, task = %task_id, filter = %filter_name, error = %e,
                        "filter construction failed, omitting");
                }
            }
        }

        let parser = LogParser::from_config(&config.log_parser);

        let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (sink_tx, sink_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);

        let source =
            source::build_source(&config.input, name, &task_id, source_tx, Arc::clone(&metrics))
                .await?;
        let sink = sink::build_sink(&config.output, &task_id, sink_rx, Arc::clone(&metrics)).await?;

        let labels = [("task", task_id.as_str())];
        let emitted = metrics.counter("lazy_task_records_emitted_total", &labels);
        let dropped = metrics.counter("lazy_task_records_dropped_total", &labels);
        let parse_errors = metrics.counter("lazy_task_parse_errors_total", &labels);
        let metric_keys = vec![
            MetricKey::new("lazy_task_records_emitted_total", &labels),
            MetricKey::new("lazy_task_records_dropped_total", &labels),
            MetricKey::new("lazy_task_parse_errors_total", &labels),
        ];

        let filters = Arc::new(filters);
        let cancel = CancellationToken::new();
        let source_rx = Arc::new(Mutex::new(source_rx));
        let worker_count = (num_cpus::get() / 2).max(2);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let ctx = WorkerCtx {
                task_id: task_id.clone(),
                parser: parser.clone(),
                filters: Arc::clone(&filters),
                filter_order: config.filter_order.clone(),
                source_rx: Arc::clone(&source_rx),
                sink_tx: sink_tx.clone(),
                cancel: cancel.child_token(),
                emitted: emitted.clone(),
                dropped: dropped.clone(),
                parse_errors: parse_errors.clone(),
            };
            workers.push(tokio::spawn(ctx.run()));
        }
        lz_info!(sys, task = %task_id, workers = worker_count, "pipeline task started");

        Ok(Arc::new(Self {
            name: name.to_string(),
            task_id,
            config_bytes: config_bytes.to_vec(),
            cancel,
            source,
            sink,
            filters,
            workers: Mutex::new(workers),
            sink_tx: Mutex::new(Some(sink_tx)),
            metrics,
            metric_keys,
        }))
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

#[async_trait]
impl Worker for PipelineTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    fn is_valid_config(&self, config: &[u8]) -> bool {
        TaskConfig::is_valid(config)
    }

    /// Stop-order is LIFO with respect to data flow: source, then the
    /// worker loops drain out, filters are cleaned up, and the sink goes
    /// last. No task-owned async task survives this call.
    async fn stop(&self) {
        self.cancel.cancel();
        self.source.stop().await;
        for worker in self.workers.lock().await.drain(..) {
            let _ = worker.await;
        }
        for (_, f) in self.filters.iter() {
            f.cleanup();
        }
        // Closing our sender lets the sink drain anything still queued.
        self.sink_tx.lock().await.take();
        self.sink.stop().await;
        self.metrics.unregister(&self.metric_keys);
        lz_info!(sys, task = %self.task_id, "pipeline task stopped");
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

struct WorkerCtx {
    task_id: String,
    parser: LogParser,
    filters: Arc<HashMap<String, Box<dyn Filter>>>,
    filter_order: Vec<String>,
    source_rx: Arc<Mutex<mpsc::Receiver<RawRecord>>>,
    sink_tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
    emitted: Counter,
    dropped: Counter,
    parse_errors: Counter,
}

impl WorkerCtx {
    async fn run(self) {
        loop {
            // Hold the shared receiver only for the take; parse and filter
            // run outside the lock so workers actually overlap.
            let raw = {
                let mut rx = self.source_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    raw = rx.recv() => raw,
                }
            };
            let Some(raw) = raw else { return };

            let mut record = match self.parser.parse(&raw) {
                Ok(record) => record,
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    lz_debug!(pipe, task = %self.task_id, error = %e, "parse error, dropping");
                    continue;
                }
            };

            if !self.apply_filters(&mut record) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.sink_tx.send(record) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Walk the configured order; absent names are skipped. Returns false
    /// when the record was dropped by an `ignore`; any other filter error
    /// truncates the chain but the record still goes out as-is.
    fn apply_filters(&self, record: &mut Record) -> bool {
        for filter_name in &self.filter_order {
            let Some(f) = self.filters.get(filter_name) else {
                continue;
            };
            match f.handle(record) {
                Ok(()) => {}
                Err(FilterError::Ignore) => return false,
                Err(e) => {
                    lz_debug!(pipe, task = %self.task_id, filter = %filter_name, error = %e,
                        "filter error, truncating chain");
                    break;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
