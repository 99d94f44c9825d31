use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Handle to a single counter or gauge. Components bump it lock-free on the
/// hot path; the registry only participates at register/unregister time and
/// when rendering.
pub type Counter = Arc<AtomicU64>;

// ---------------------------------------------------------------------------
// MetricKey
// ---------------------------------------------------------------------------

/// Identity of a metric: exposition name plus label pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl MetricKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Process-shared metrics store.
///
/// Registration is get-or-create: a second registration of an existing key
/// returns the same handle (duplicate registration is a soft no-op).
/// Components register their keys at start and unregister them at stop;
/// task-derived keys carry the task's instance id in a `task` label, so two
/// tasks sharing a name can never collide.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<MetricKey, Counter>>,
    gauges: RwLock<BTreeMap<MetricKey, Counter>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        Self::get_or_create(&self.counters, MetricKey::new(name, labels))
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        Self::get_or_create(&self.gauges, MetricKey::new(name, labels))
    }

    fn get_or_create(map: &RwLock<BTreeMap<MetricKey, Counter>>, key: MetricKey) -> Counter {
        if let Some(existing) = map.read().expect("metrics lock poisoned").get(&key) {
            return Arc::clone(existing);
        }
        let mut map = map.write().expect("metrics lock poisoned");
        Arc::clone(map.entry(key).or_default())
    }

    /// Remove the given keys from the exposition. Handles already held by
    /// callers stay valid; they just stop being exported.
    pub fn unregister(&self, keys: &[MetricKey]) {
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        let mut gauges = self.gauges.write().expect("metrics lock poisoned");
        for key in keys {
            counters.remove(key);
            gauges.remove(key);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(4 * 1024);
        render_family(
            &mut out,
            &self.counters.read().expect("metrics lock poisoned"),
            "counter",
        );
        render_family(
            &mut out,
            &self.gauges.read().expect("metrics lock poisoned"),
            "gauge",
        );
        out
    }
}

fn render_family(out: &mut String, map: &BTreeMap<MetricKey, Counter>, kind: &str) {
    let mut last_name = "";
    for (key, value) in map {
        if key.name != last_name {
            let _ = writeln!(out, "# TYPE {} {kind}", key.name);
            last_name = &key.name;
        }
        let _ = writeln!(
            out,
            "{}{} {}",
            key.name,
            format_labels(&key.labels),
            value.load(Ordering::Relaxed)
        );
    }
}

fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut out = String::from("{");
    for (idx, (key, value)) in labels.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push('"');
        for ch in value.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                _ => out.push(ch),
            }
        }
        out.push('"');
    }
    out.push('}');
    out
}

// ---------------------------------------------------------------------------
// Exposition endpoint
// ---------------------------------------------------------------------------

/// Serve `GET /metrics` in Prometheus text format until cancelled.
pub async fn run_metrics_task(
    metrics: Arc<MetricsRegistry>,
    listen: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen).await?;
    lz_info!(res, listen = %listen, "metrics exporter started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                let (mut stream, _) = result?;
                let body = metrics.render_prometheus();
                let mut req_buf = [0u8; 512];
                let req_n = stream.read(&mut req_buf).await.unwrap_or(0);
                let is_metrics = req_n > 0
                    && std::str::from_utf8(&req_buf[..req_n]).unwrap_or("").starts_with("GET /metrics");
                if is_metrics {
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    stream.write_all(header.as_bytes()).await?;
                    stream.write_all(body.as_bytes()).await?;
                } else {
                    stream
                        .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await?;
                }
                stream.shutdown().await?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
