use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// Worker — what the pool manages
// ---------------------------------------------------------------------------

/// A running task as seen by the pool: an identity, the config it was built
/// from, a validity probe for replacement configs, and a synchronous-from-
/// the-caller stop.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;
    fn config_bytes(&self) -> &[u8];
    fn is_valid_config(&self, config: &[u8]) -> bool;
    async fn stop(&self);
}

// ---------------------------------------------------------------------------
// TaskPool — registry of running workers, converged by reconcile
// ---------------------------------------------------------------------------

/// At most one worker per name; a worker is either running or absent. The
/// map lock is never held across a worker's `stop`.
#[derive(Default)]
pub struct TaskPool {
    workers: Mutex<HashMap<String, Arc<dyn Worker>>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent add by worker name; a second join with the same name is a
    /// no-op.
    pub async fn join(&self, worker: Arc<dyn Worker>) {
        let mut workers = self.workers.lock().await;
        workers
            .entry(worker.name().to_string())
            .or_insert(worker);
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.workers.lock().await.contains_key(name)
    }

    pub async fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Converge the pool to `desired`:
    /// removed names are stopped; changed configs that parse are stopped for
    /// re-creation (invalid replacements keep the old worker); missing names
    /// are constructed via `build` and joined. A failed construction is
    /// logged and retried on the next reconcile.
    pub async fn reconcile<F, Fut>(&self, desired: &HashMap<String, String>, build: F)
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = RuntimeResult<Arc<dyn Worker>>>,
    {
        // Phase 1: collect workers to stop under the lock, stop them after
        // it is released.
        let to_stop: Vec<Arc<dyn Worker>> = {
            let mut workers = self.workers.lock().await;
            let mut doomed = Vec::new();
            let names: Vec<String> = workers.keys().cloned().collect();
            for name in names {
                let remove = {
                    let worker = workers.get(&name).expect("present under lock");
                    match desired.get(&name) {
                        None => {
                            lz_info!(conf, task = %name, "task removed from desired state");
                            true
                        }
                        Some(config) if config.as_bytes() != worker.config_bytes() => {
                            if worker.is_valid_config(config.as_bytes()) {
                                lz_info!(conf, task = %name, "task config changed, replacing");
                                true
                            } else {
                                lz_warn!(conf, task = %name, "new config invalid, keeping old task");
                                false
                            }
                        }
                        Some(_) => false,
                    }
                };
                if remove {
                    doomed.push(workers.remove(&name).expect("present under lock"));
                }
            }
            doomed
        };
        for worker in to_stop {
            worker.stop().await;
        }

        // Phase 2: start whatever is desired but not running.
        for (name, config) in desired {
            if self.is_running(name).await {
                continue;
            }
            match build(name.clone(), config.clone()).await {
                Ok(worker) => self.join(worker).await,
                Err(e) => {
                    lz_warn!(conf, task = %name, error = %e,
                        "task construction failed, retrying next reconcile");
                }
            }
        }
    }

    /// Stop every worker concurrently; returns when all have stopped.
    pub async fn stop(&self) {
        let workers: Vec<Arc<dyn Worker>> = {
            let mut map = self.workers.lock().await;
            map.drain().map(|(_, w)| w).collect()
        };
        let mut stops = JoinSet::new();
        for worker in workers {
            stops.spawn(async move { worker.stop().await });
        }
        while stops.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orion_error::StructError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::error::RuntimeReason;

    struct FakeWorker {
        name: String,
        config: Vec<u8>,
        stopped: AtomicBool,
        accept_any_config: bool,
    }

    impl FakeWorker {
        fn new(name: &str, config: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                config: config.as_bytes().to_vec(),
                stopped: AtomicBool::new(false),
                accept_any_config: true,
            })
        }

        fn rejecting(name: &str, config: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                config: config.as_bytes().to_vec(),
                stopped: AtomicBool::new(false),
                accept_any_config: false,
            })
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }
        fn config_bytes(&self) -> &[u8] {
            &self.config
        }
        fn is_valid_config(&self, _config: &[u8]) -> bool {
            self.accept_any_config
        }
        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn desired(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn builder(
        count: Arc<AtomicUsize>,
    ) -> impl Fn(String, String) -> std::pin::Pin<Box<dyn Future<Output = RuntimeResult<Arc<dyn Worker>>> + Send>>
    {
        move |name, config| {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(FakeWorker::new(&name, &config) as Arc<dyn Worker>)
            })
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_by_name() {
        let pool = TaskPool::new();
        let first = FakeWorker::new("t", "c1");
        pool.join(first.clone()).await;
        pool.join(FakeWorker::new("t", "c2")).await;
        assert_eq!(pool.running_names().await, vec!["t"]);
        assert!(pool.is_running("t").await);
        // The original worker is still the registered one.
        pool.stop().await;
        assert!(first.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reconcile_converges_to_desired_set() {
        let pool = TaskPool::new();
        let gone = FakeWorker::new("gone", "c");
        pool.join(gone.clone()).await;

        let built = Arc::new(AtomicUsize::new(0));
        pool.reconcile(&desired(&[("a", "ca"), ("b", "cb")]), builder(built.clone()))
            .await;

        assert_eq!(pool.running_names().await, vec!["a", "b"]);
        assert!(gone.stopped.load(Ordering::SeqCst));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconcile_replaces_changed_valid_config() {
        let pool = TaskPool::new();
        let old = FakeWorker::new("t", "old");
        pool.join(old.clone()).await;

        let built = Arc::new(AtomicUsize::new(0));
        pool.reconcile(&desired(&[("t", "new")]), builder(built.clone())).await;

        assert!(old.stopped.load(Ordering::SeqCst));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(pool.is_running("t").await);
    }

    #[tokio::test]
    async fn reconcile_keeps_worker_on_invalid_replacement() {
        let pool = TaskPool::new();
        let old = FakeWorker::rejecting("t", "old");
        pool.join(old.clone()).await;

        let built = Arc::new(AtomicUsize::new(0));
        pool.reconcile(&desired(&[("t", "garbage")]), builder(built.clone()))
            .await;

        assert!(!old.stopped.load(Ordering::SeqCst));
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_leaves_unchanged_workers_alone() {
        let pool = TaskPool::new();
        let same = FakeWorker::new("t", "c");
        pool.join(same.clone()).await;

        let built = Arc::new(AtomicUsize::new(0));
        pool.reconcile(&desired(&[("t", "c")]), builder(built.clone())).await;

        assert!(!same.stopped.load(Ordering::SeqCst));
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn construction_failure_is_retried_next_tick() {
        let pool = TaskPool::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_builder = attempts.clone();
        let flaky = move |name: String, config: String| {
            let n = attempts_in_builder.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(StructError::from(RuntimeReason::Construction)
                        .with_detail("cannot connect"))
                } else {
                    Ok(FakeWorker::new(&name, &config) as Arc<dyn Worker>)
                }
            })
                as std::pin::Pin<Box<dyn Future<Output = RuntimeResult<Arc<dyn Worker>>> + Send>>
        };

        pool.reconcile(&desired(&[("t", "c")]), &flaky).await;
        assert!(!pool.is_running("t").await);

        pool.reconcile(&desired(&[("t", "c")]), &flaky).await;
        assert!(pool.is_running("t").await);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_stops_everything() {
        let pool = TaskPool::new();
        let a = FakeWorker::new("a", "c");
        let b = FakeWorker::new("b", "c");
        pool.join(a.clone()).await;
        pool.join(b.clone()).await;
        pool.stop().await;
        assert!(a.stopped.load(Ordering::SeqCst));
        assert!(b.stopped.load(Ordering::SeqCst));
        assert!(pool.running_names().await.is_empty());
    }
}
