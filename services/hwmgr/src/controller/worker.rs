//! Controller background worker.
//!
//! Lists NodePools on a periodic interval and reconciles the ones that are
//! due. Different pools are reconciled concurrently; a pool is never
//! reconciled twice in the same pass.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use hwmgr_reconcile::{
    RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_INTERVAL, DEFAULT_RETRY_WINDOW,
    LONG_REQUEUE_INTERVAL, MEDIUM_REQUEUE_INTERVAL,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::{NodePoolReconciler, ReconcileResult};
use crate::resources::{NodePool, ObjectKey, Resource};
use crate::store::{Client, StoreResult};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub namespace: String,
    /// Tick interval, and the delay before re-checking a settled pool.
    pub resync_interval: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
}

impl WorkerConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub pools_seen: usize,
    pub reconciled: usize,
    pub requeued: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Schedule {
    due: BTreeMap<ObjectKey, Instant>,
    retries: RetryTracker,
}

/// Runs the reconciler over every NodePool in a namespace.
pub struct ControllerWorker {
    reconciler: Arc<NodePoolReconciler>,
    client: Client,
    config: WorkerConfig,
    schedule: Mutex<Schedule>,
}

impl ControllerWorker {
    pub fn new(reconciler: Arc<NodePoolReconciler>, client: Client, config: WorkerConfig) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            reconciler,
            client,
            config,
            schedule: Mutex::new(Schedule {
                due: BTreeMap::new(),
                retries,
            }),
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(namespace = %self.config.namespace))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.resync_interval.as_secs(),
            "Starting controller worker"
        );

        let mut interval = tokio::time::interval(self.config.resync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats.reconciled > 0 => {
                            debug!(
                                pools_seen = stats.pools_seen,
                                reconciled = stats.reconciled,
                                requeued = stats.requeued,
                                failed = stats.failed,
                                "Reconciliation pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to list NodePools"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconciles every pool whose due time has passed.
    pub async fn run_once(&self) -> StoreResult<PassStats> {
        let pools = self.client.list::<NodePool>(&self.config.namespace).await?;
        let now = Instant::now();

        let due: Vec<ObjectKey> = {
            let mut schedule = self.lock_schedule();
            schedule.retries.prune();
            schedule
                .due
                .retain(|key, _| pools.iter().any(|p| &p.key() == key));
            pools
                .iter()
                .map(Resource::key)
                .filter(|key| schedule.due.get(key).is_none_or(|at| *at <= now))
                .collect()
        };

        let results = join_all(due.iter().map(|key| async move {
            let result = self.reconciler.reconcile(key).await;
            (key, result)
        }))
        .await;

        let mut stats = PassStats {
            pools_seen: pools.len(),
            ..Default::default()
        };
        let mut schedule = self.lock_schedule();
        for (key, result) in results {
            stats.reconciled += 1;
            let delay = self.next_delay(&mut schedule.retries, key, &result);
            match &result {
                Ok(requeue) if !requeue.is_done() => stats.requeued += 1,
                Ok(_) => {}
                Err(_) => stats.failed += 1,
            }
            schedule.due.insert(key.clone(), Instant::now() + delay);
        }

        Ok(stats)
    }

    fn next_delay(&self, retries: &mut RetryTracker, key: &ObjectKey, result: &ReconcileResult) -> Duration {
        let resource = key.to_string();
        match result {
            Ok(requeue) => {
                retries.clear(&resource);
                requeue.requeue_after().unwrap_or(self.config.resync_interval)
            }
            Err(failure) => {
                if retries.record_failure(&resource) {
                    error!(pool = %key, error = %failure, "Retries exhausted; backing off");
                    LONG_REQUEUE_INTERVAL
                } else {
                    warn!(pool = %key, error = %failure, "Reconciliation failed");
                    failure
                        .requeue
                        .requeue_after()
                        .unwrap_or(MEDIUM_REQUEUE_INTERVAL)
                }
            }
        }
    }

    fn lock_schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
