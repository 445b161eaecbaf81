//! Worker pool
//!
//! A fixed set of media engine workers, created once at startup and handed out
//! in round-robin order. A worker dying is fatal for the whole process: it may
//! take down routers of many rooms with unknown partial state, so recovery is
//! left to whatever supervises the process.

use crate::config::WorkerConfig;
use crate::engine::{EngineError, MediaEngine, ResourceUsage, WorkerExit};
use crate::error::{Error, Result};
use crate::handle::{WorkerHandle, WorkerStatus};
use crate::metrics;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Action taken when a worker dies. Receives [`Error::WorkerDied`].
pub type FatalHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Default fatal action: log and terminate the process
#[must_use]
pub fn exit_process() -> FatalHandler {
    Arc::new(|err| {
        error!(error = %err, "Terminating process after media worker death");
        std::process::exit(1);
    })
}

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    workers: Vec<Arc<WorkerHandle>>,
    cursor: AtomicUsize,
    /// Last successful resource usage sample per worker index
    usage: RwLock<Vec<Option<ResourceUsage>>>,
}

impl WorkerPool {
    /// Spawn every configured worker. Any spawn failure aborts startup after
    /// closing the workers that did come up.
    pub async fn initialize(
        engine: Arc<dyn MediaEngine>,
        config: &WorkerConfig,
        on_fatal: FatalHandler,
    ) -> Result<Arc<Self>> {
        let count = config.effective_num_workers();
        let settings = config.worker_settings();
        let mut workers = Vec::with_capacity(count);
        let mut exits = Vec::with_capacity(count);

        for index in 0..count {
            match engine.create_worker(&settings).await {
                Ok(spawn) => {
                    debug!(worker = index, pid = spawn.pid, worker_id = %spawn.id, "Worker started");
                    workers.push(Arc::new(WorkerHandle::new(index, spawn.id, spawn.pid)));
                    exits.push(spawn.died);
                }
                Err(source) => {
                    error!(worker = index, error = %source, "Failed to start worker");
                    close_workers(engine.as_ref(), &workers).await;
                    return Err(Error::WorkerSpawnFailed { index, source });
                }
            }
        }

        for (worker, died) in workers.iter().zip(exits) {
            watch_for_death(Arc::clone(worker), died, Arc::clone(&on_fatal));
        }

        metrics::WORKERS.set(count as i64);
        info!(
            workers = count,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Worker pool initialized"
        );

        Ok(Arc::new(Self {
            engine,
            workers,
            cursor: AtomicUsize::new(0),
            usage: RwLock::new(vec![None; count]),
        }))
    }

    /// Next worker in fixed cyclic order, starting from the first
    pub fn next_worker(&self) -> Arc<WorkerHandle> {
        let len = self.workers.len();
        let index = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(prev) | Err(prev) => prev,
        };
        Arc::clone(&self.workers[index])
    }

    #[must_use]
    pub fn worker(&self, index: usize) -> Option<Arc<WorkerHandle>> {
        self.workers.get(index).cloned()
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Last sampled cumulative CPU time of a worker
    #[must_use]
    pub fn cpu_time(&self, index: usize) -> Option<Duration> {
        self.usage
            .read()
            .get(index)
            .copied()
            .flatten()
            .map(|usage| usage.cpu_time())
    }

    /// Health check view of every worker
    #[must_use]
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| WorkerStatus::from(w.as_ref())).collect()
    }

    /// One best-effort pass over every live worker's resource usage.
    ///
    /// A failed read is logged and skipped; the previous sample is kept.
    /// Returns the number of workers sampled successfully.
    pub async fn poll_resource_usage(&self) -> usize {
        let reads = self
            .workers
            .iter()
            .filter(|worker| !worker.is_closed())
            .map(|worker| async move {
                (worker, self.engine.resource_usage(worker.id()).await)
            });

        let mut sampled = 0;
        for (worker, result) in join_all(reads).await {
            match result {
                Ok(usage) => {
                    self.usage.write()[worker.index()] = Some(usage);
                    metrics::WORKER_CPU_SECONDS
                        .with_label_values(&[worker.index().to_string()])
                        .set(usage.cpu_time().as_secs() as i64);
                    sampled += 1;
                }
                Err(e) => {
                    warn!(
                        worker = worker.index(),
                        pid = worker.pid(),
                        error = %e,
                        "Failed to read worker resource usage"
                    );
                }
            }
        }

        debug!(sampled, workers = self.workers.len(), "Polled worker resource usage");
        sampled
    }

    /// Start the recurring resource usage monitor. It stops once every worker
    /// is closed or the pool is dropped.
    pub fn spawn_monitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            monitor_task(pool, period).await;
        })
    }

    /// Close every worker. The engine cascades the close to routers and
    /// everything below them.
    pub async fn shutdown_all(&self) {
        close_workers(self.engine.as_ref(), &self.workers).await;
        metrics::WORKERS.set(0);
        info!(workers = self.workers.len(), "Worker pool shut down");
    }
}

async fn close_workers(engine: &dyn MediaEngine, workers: &[Arc<WorkerHandle>]) {
    let closes = workers
        .iter()
        .filter(|worker| worker.mark_closed())
        .map(|worker| async move { (worker, engine.close_worker(worker.id()).await) });

    for (worker, result) in join_all(closes).await {
        match result {
            Ok(()) | Err(EngineError::AlreadyClosed(_)) => {}
            Err(e) => warn!(worker = worker.index(), error = %e, "Failed to close worker"),
        }
    }
}

async fn monitor_task(pool: Weak<WorkerPool>, period: Duration) {
    let mut ticker = interval(period);
    info!(interval_ms = period.as_millis() as u64, "Starting worker monitor");

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            debug!("Worker pool dropped, stopping worker monitor");
            break;
        };
        if pool.workers.iter().all(|w| w.is_closed()) {
            info!("All workers closed, stopping worker monitor");
            break;
        }
        pool.poll_resource_usage().await;
    }
}

fn watch_for_death(
    worker: Arc<WorkerHandle>,
    died: oneshot::Receiver<WorkerExit>,
    on_fatal: FatalHandler,
) {
    tokio::spawn(async move {
        match died.await {
            Ok(exit) if worker.mark_closed() => {
                let err = Error::WorkerDied {
                    index: worker.index(),
                    pid: worker.pid(),
                    reason: exit.reason,
                };
                error!(worker = worker.index(), pid = worker.pid(), error = %err, "Media worker died");
                on_fatal(&err);
            }
            Ok(exit) => {
                debug!(worker = worker.index(), reason = %exit.reason, "Closed worker exited");
            }
            Err(_) => {
                debug!(worker = worker.index(), "Worker exit channel dropped");
            }
        }
    });
}
