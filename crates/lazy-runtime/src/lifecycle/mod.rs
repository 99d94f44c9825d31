mod signal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use orion_error::compat_prelude::*;
use orion_error::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::EngineConfig;

use crate::consul::ConsulClient;
use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{MetricsRegistry, run_metrics_task};
use crate::pool::{TaskPool, Worker};
use crate::task::PipelineTask;

pub use signal::wait_for_signal;

/// How often the desired-state map is re-read from the KV store.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// TaskGroup — named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks shut down together. Groups are assembled in
/// start order and joined in reverse (LIFO) during [`Engine::wait`]:
///
///   start:  metrics → reconciler
///   join:   reconciler → (task pool stop) → metrics
///
/// so the exporter keeps serving while tasks drain.
struct TaskGroup {
    name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    async fn wait(self) -> RuntimeResult<()> {
        for handle in self.handles {
            handle
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Shutdown)
                        .with_detail(format!("task join error: {e}"))
                })?
                .owe(RuntimeReason::Shutdown)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine — the top-level lifecycle handle
// ---------------------------------------------------------------------------

/// Manages the full lifecycle of the engine: bootstrap, the reconcile loop
/// that converges running tasks to the KV store's desired state, and
/// graceful shutdown.
pub struct Engine {
    cancel: CancellationToken,
    groups: Vec<TaskGroup>,
    pool: Arc<TaskPool>,
}

impl Engine {
    pub async fn start(config: EngineConfig) -> RuntimeResult<Self> {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let consul = ConsulClient::new(
            &config.consul_address,
            &config.datacenter,
            &config.consul_token,
        )?;
        let pool = Arc::new(TaskPool::new());

        let mut groups = Vec::with_capacity(2);

        let mut metrics_group = TaskGroup::new("metrics");
        metrics_group.push(tokio::spawn(run_metrics_task(
            Arc::clone(&metrics),
            config.metric_addr.clone(),
            cancel.child_token(),
        )));
        groups.push(metrics_group);

        let mut reconciler_group = TaskGroup::new("reconciler");
        reconciler_group.push(tokio::spawn(run_reconciler(
            consul,
            config.consul_key.clone(),
            Arc::clone(&pool),
            Arc::clone(&metrics),
            cancel.child_token(),
        )));
        groups.push(reconciler_group);

        lz_info!(sys, consul = %config.consul_address, key = %config.consul_key,
            "engine bootstrap complete");
        Ok(Self {
            cancel,
            groups,
            pool,
        })
    }

    /// Request graceful shutdown of all tasks.
    pub fn shutdown(&self) {
        lz_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Returns a clone of the root cancellation token (for signal
    /// integration).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Join task groups in LIFO order. Once the reconciler has stopped (no
    /// further task churn is possible), every pipeline task is stopped —
    /// which persists file offsets and drains sinks — before the metrics
    /// exporter goes down.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            lz_debug!(sys, task_group = name, "waiting for task group to finish");
            group.wait().await?;
            lz_debug!(sys, task_group = name, "task group finished");

            if name == "reconciler" {
                self.pool.stop().await;
                lz_info!(sys, "all pipeline tasks stopped");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconcile loop
// ---------------------------------------------------------------------------

/// Re-read `{consul_key}/tasks/` on a fixed tick and converge the pool. Two
/// reconciles never overlap; KV read errors are logged, never fatal.
async fn run_reconciler(
    consul: ConsulClient,
    consul_key: String,
    pool: Arc<TaskPool>,
    metrics: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tasks_key = format!("{consul_key}/tasks");
    let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let desired: HashMap<String, String> = match consul.kv_list(&tasks_key).await {
                    Ok(desired) => desired,
                    Err(e) => {
                        lz_warn!(conf, key = %tasks_key, error = %e, "desired-state read failed");
                        continue;
                    }
                };
                lz_debug!(conf, tasks = desired.len(), "reconcile tick");
                pool.reconcile(&desired, |name, config| {
                    let metrics = Arc::clone(&metrics);
                    async move {
                        PipelineTask::start(&name, config.as_bytes(), metrics)
                            .await
                            .map(|task| task as Arc<dyn Worker>)
                    }
                })
                .await;
            }
        }
    }
    Ok(())
}
