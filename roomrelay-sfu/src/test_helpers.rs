//! Test helpers and fixtures for roomrelay-sfu tests
//!
//! [`FakeEngine`] is an in-memory [`MediaEngine`] with failure injection and
//! call counters. `pipe_to_router` yields to the scheduler before answering so
//! that concurrent callers really interleave at the suspension point.

use crate::engine::{
    EngineError, MediaCodec, MediaEngine, ResourceUsage, WorkerExit, WorkerSettings, WorkerSpawn,
};
use crate::error::Error;
use crate::types::{ProducerId, RouterId, WorkerId};
use crate::worker_pool::FatalHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
pub struct FakeEngine {
    worker_exits: Mutex<HashMap<WorkerId, oneshot::Sender<WorkerExit>>>,
    closed_workers: Mutex<HashSet<WorkerId>>,
    closed_routers: Mutex<HashSet<RouterId>>,
    closed_producers: Mutex<HashSet<ProducerId>>,
    usage: Mutex<HashMap<WorkerId, ResourceUsage>>,
    fail_router_at: Mutex<Option<usize>>,
    fail_pipes_to: Mutex<HashSet<RouterId>>,
    fail_producer_close: Mutex<HashSet<ProducerId>>,
    pipe_delay: Mutex<Duration>,
    worker_seq: AtomicUsize,
    router_calls: AtomicUsize,
    pipe_calls: AtomicUsize,
    usage_calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the worker process crashing
    pub fn kill_worker(&self, worker: &WorkerId, reason: &str) {
        if let Some(tx) = self.worker_exits.lock().remove(worker) {
            let _ = tx.send(WorkerExit {
                reason: reason.to_string(),
            });
        }
    }

    /// Make the `call`-th `create_router` call (0-based) fail
    pub fn fail_router_creation_at(&self, call: usize) {
        *self.fail_router_at.lock() = Some(call);
    }

    /// Make every pipe into `router` fail
    pub fn fail_pipes_to(&self, router: &RouterId) {
        self.fail_pipes_to.lock().insert(router.clone());
    }

    pub fn fail_producer_close(&self, producer: &ProducerId) {
        self.fail_producer_close.lock().insert(producer.clone());
    }

    /// Keep pipes pending for `delay` before answering
    pub fn set_pipe_delay(&self, delay: Duration) {
        *self.pipe_delay.lock() = delay;
    }

    pub fn set_usage(&self, worker: &WorkerId, usage: ResourceUsage) {
        self.usage.lock().insert(worker.clone(), usage);
    }

    pub fn router_creations(&self) -> usize {
        self.router_calls.load(Ordering::SeqCst)
    }

    pub fn pipe_calls(&self) -> usize {
        self.pipe_calls.load(Ordering::SeqCst)
    }

    pub fn usage_calls(&self) -> usize {
        self.usage_calls.load(Ordering::SeqCst)
    }

    pub fn closed_worker_count(&self) -> usize {
        self.closed_workers.lock().len()
    }

    pub fn closed_router_count(&self) -> usize {
        self.closed_routers.lock().len()
    }

    pub fn closed_producer_count(&self) -> usize {
        self.closed_producers.lock().len()
    }

    pub fn is_producer_closed(&self, producer: &ProducerId) -> bool {
        self.closed_producers.lock().contains(producer)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_worker(&self, _settings: &WorkerSettings) -> Result<WorkerSpawn, EngineError> {
        let n = self.worker_seq.fetch_add(1, Ordering::SeqCst);
        let id = WorkerId::new(format!("worker-{n}"));
        let (tx, died) = oneshot::channel();
        self.worker_exits.lock().insert(id.clone(), tx);
        Ok(WorkerSpawn {
            id,
            pid: 10_000 + n as u32,
            died,
        })
    }

    async fn create_router(
        &self,
        worker: &WorkerId,
        _codecs: &[MediaCodec],
    ) -> Result<RouterId, EngineError> {
        let call = self.router_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_router_at.lock() == Some(call) {
            return Err(EngineError::Request(format!("router creation {call} refused")));
        }
        if self.closed_workers.lock().contains(worker) {
            return Err(EngineError::AlreadyClosed(worker.to_string()));
        }
        Ok(RouterId::new(format!("router-{}", uuid::Uuid::new_v4())))
    }

    async fn pipe_to_router(
        &self,
        producer: &ProducerId,
        _source: &RouterId,
        target: &RouterId,
    ) -> Result<ProducerId, EngineError> {
        self.pipe_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.pipe_delay.lock();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        if self.fail_pipes_to.lock().contains(target) {
            return Err(EngineError::Request(format!("pipe to {target} refused")));
        }
        if self.closed_routers.lock().contains(target) {
            return Err(EngineError::AlreadyClosed(target.to_string()));
        }
        Ok(ProducerId::new(format!("{producer}-pipe-{}", uuid::Uuid::new_v4())))
    }

    async fn resource_usage(&self, worker: &WorkerId) -> Result<ResourceUsage, EngineError> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed_workers.lock().contains(worker) {
            return Err(EngineError::AlreadyClosed(worker.to_string()));
        }
        Ok(self.usage.lock().get(worker).copied().unwrap_or_default())
    }

    async fn close_worker(&self, worker: &WorkerId) -> Result<(), EngineError> {
        // Closing on request drops the exit sender without firing it
        self.worker_exits.lock().remove(worker);
        if self.closed_workers.lock().insert(worker.clone()) {
            Ok(())
        } else {
            Err(EngineError::AlreadyClosed(worker.to_string()))
        }
    }

    async fn close_router(&self, router: &RouterId) -> Result<(), EngineError> {
        if self.closed_routers.lock().insert(router.clone()) {
            Ok(())
        } else {
            Err(EngineError::AlreadyClosed(router.to_string()))
        }
    }

    async fn close_producer(&self, producer: &ProducerId) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        if self.fail_producer_close.lock().contains(producer) {
            return Err(EngineError::Request(format!("close {producer} refused")));
        }
        if self.closed_producers.lock().insert(producer.clone()) {
            Ok(())
        } else {
            Err(EngineError::AlreadyClosed(producer.to_string()))
        }
    }
}

/// Fatal handler that reports worker deaths on a channel instead of exiting
pub fn fatal_recorder() -> (FatalHandler, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: FatalHandler = Arc::new(move |err: &Error| {
        let _ = tx.send(err.to_string());
    });
    (handler, rx)
}
