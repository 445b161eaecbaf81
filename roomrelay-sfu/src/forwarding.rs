//! Cross-router forwarding
//!
//! A forward link relays a producer that already flows into its home router
//! into another router of the same room, where it shows up as an independent
//! forwarded producer that local consumers can subscribe to. The stream is
//! never encoded twice.
//!
//! Two policies, picked by the caller from the stream's role:
//! - eager ([`ForwardingManager::forward_to_all`]): link into every other
//!   router up front, for streams most of the room will watch;
//! - on demand ([`ForwardingManager::forward_on_demand`]): link into one router
//!   the first time a consumer there needs it.
//!
//! At most one link exists per `(producer, target router)`. Creation of a link
//! suspends on the engine, so it runs under a mutex keyed by that pair and
//! re-checks for an existing link once the mutex is held.

use crate::engine::{EngineError, MediaEngine};
use crate::error::{Error, Result};
use crate::handle::{ProducerHandle, RouterHandle};
use crate::metrics;
use crate::topology::TopologyManager;
use crate::types::{ProducerId, RoomId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One established forward link of an origin producer
#[derive(Debug, Clone)]
pub struct ForwardRecord {
    pub target_router_index: usize,
    /// Forwarded producer living on the target router
    pub producer: Arc<ProducerHandle>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of closing a set of forward links
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub closed: usize,
    pub failed: usize,
}

impl CleanupReport {
    fn merge(&mut self, other: Self) {
        self.closed += other.closed;
        self.failed += other.failed;
    }
}

type CreationKey = (ProducerId, usize);

#[derive(Default)]
struct RoomForwards {
    records: DashMap<ProducerId, Vec<ForwardRecord>>,
    creation_locks: DashMap<CreationKey, Arc<Mutex<()>>>,
}

impl RoomForwards {
    fn find(&self, producer_id: &ProducerId, target: usize) -> Option<Arc<ProducerHandle>> {
        self.records.get(producer_id).and_then(|records| {
            records
                .iter()
                .find(|record| record.target_router_index == target)
                .map(|record| Arc::clone(&record.producer))
        })
    }

    fn creation_lock(&self, producer_id: &ProducerId, target: usize) -> Arc<Mutex<()>> {
        let lock = self
            .creation_locks
            .entry((producer_id.clone(), target))
            .or_default();
        Arc::clone(lock.value())
    }

    fn link_count(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }
}

/// Tracks and creates forward links for every room
pub struct ForwardingManager {
    topology: Arc<TopologyManager>,
    engine: Arc<dyn MediaEngine>,
    rooms: DashMap<RoomId, Arc<RoomForwards>>,
}

impl ForwardingManager {
    pub fn new(topology: Arc<TopologyManager>, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            topology,
            engine,
            rooms: DashMap::new(),
        }
    }

    fn room_forwards(&self, room_id: &RoomId) -> Arc<RoomForwards> {
        Arc::clone(self.rooms.entry(room_id.clone()).or_default().value())
    }

    /// Eagerly link `producer` into every router of the room except its own.
    ///
    /// Targets are attempted concurrently. A failed target is logged and
    /// skipped; it neither cancels the others nor fails the call. Returns the
    /// number of targets that now have a link.
    pub async fn forward_to_all(
        &self,
        room_id: &RoomId,
        producer: &Arc<ProducerHandle>,
        source_index: usize,
    ) -> Result<usize> {
        let topology = self.topology.topology(room_id)?;
        if topology.router_count() <= 1 {
            return Ok(0);
        }
        let source_router = topology.router(source_index)?;
        let forwards = self.room_forwards(room_id);

        let attempts = topology
            .routers()
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != source_index)
            .map(|(target, target_router)| {
                let forwards = &forwards;
                let source_router = &source_router;
                async move {
                    let result = self
                        .ensure_forward(
                            forwards,
                            producer,
                            source_router,
                            target,
                            target_router,
                            metrics::POLICY_EAGER,
                        )
                        .await;
                    (target, result)
                }
            });

        let mut established = 0;
        let mut failed = 0;
        for (target, result) in join_all(attempts).await {
            match result {
                Ok(_) => established += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        room_id = %room_id,
                        producer_id = %producer.id(),
                        target_router = target,
                        error = %e,
                        "Eager forward failed, viewers on that router miss this stream"
                    );
                }
            }
        }

        info!(
            room_id = %room_id,
            producer_id = %producer.id(),
            source_router = source_index,
            established,
            failed,
            "Eager forwarding finished"
        );

        Ok(established)
    }

    /// Link `producer` into one target router, creating the link only once.
    ///
    /// Returns the original producer when source and target are the same
    /// router, otherwise the forwarded producer on the target router.
    pub async fn forward_on_demand(
        &self,
        room_id: &RoomId,
        producer: &Arc<ProducerHandle>,
        source_index: usize,
        target_index: usize,
    ) -> Result<Arc<ProducerHandle>> {
        if source_index == target_index {
            return Ok(Arc::clone(producer));
        }

        let topology = self.topology.topology(room_id)?;
        let source_router = topology.router(source_index)?;
        let target_router = topology.router(target_index)?;
        let forwards = self.room_forwards(room_id);

        if let Some(existing) = forwards.find(producer.id(), target_index) {
            debug!(
                room_id = %room_id,
                producer_id = %producer.id(),
                target_router = target_index,
                "Forward link already exists"
            );
            return Ok(existing);
        }

        self.ensure_forward(
            &forwards,
            producer,
            &source_router,
            target_index,
            &target_router,
            metrics::POLICY_ON_DEMAND,
        )
        .await
    }

    async fn ensure_forward(
        &self,
        forwards: &RoomForwards,
        producer: &Arc<ProducerHandle>,
        source_router: &RouterHandle,
        target_index: usize,
        target_router: &RouterHandle,
        policy: &'static str,
    ) -> Result<Arc<ProducerHandle>> {
        let lock = forwards.creation_lock(producer.id(), target_index);
        let _guard = lock.lock().await;

        // A concurrent caller may have created the link while we waited
        if let Some(existing) = forwards.find(producer.id(), target_index) {
            return Ok(existing);
        }

        let closed = if producer.is_closed() {
            Some(format!("producer {}", producer.id()))
        } else if source_router.is_closed() {
            Some(format!("router {}", source_router.id()))
        } else if target_router.is_closed() {
            Some(format!("router {}", target_router.id()))
        } else {
            None
        };
        if let Some(what) = closed {
            metrics::FORWARDS_FAILED.with_label_values(&[policy]).inc();
            return Err(Error::HandleClosed(what));
        }

        let forwarded_id = self
            .engine
            .pipe_to_router(producer.id(), source_router.id(), target_router.id())
            .await
            .map_err(|source| {
                metrics::FORWARDS_FAILED.with_label_values(&[policy]).inc();
                Error::ForwardCreationFailed {
                    producer_id: producer.id().clone(),
                    target_index,
                    source,
                }
            })?;

        let forwarded = Arc::new(ProducerHandle::new(
            forwarded_id,
            target_router.id().clone(),
        ));
        forwards
            .records
            .entry(producer.id().clone())
            .or_default()
            .push(ForwardRecord {
                target_router_index: target_index,
                producer: Arc::clone(&forwarded),
                created_at: Utc::now(),
            });
        metrics::FORWARDS_CREATED.with_label_values(&[policy]).inc();

        debug!(
            producer_id = %producer.id(),
            forwarded_id = %forwarded.id(),
            target_router = target_index,
            policy,
            "Forward link created"
        );

        Ok(forwarded)
    }

    /// Close every forward link of an origin producer that went away.
    ///
    /// Links already closed count as closed. The producer's records are dropped
    /// whatever the individual outcomes; a link the engine failed to close is
    /// reclaimed when its router closes at room teardown. Calling this again
    /// for the same producer does nothing.
    pub async fn cleanup_for_producer(
        &self,
        room_id: &RoomId,
        producer_id: &ProducerId,
    ) -> Result<CleanupReport> {
        let Some(forwards) = self.rooms.get(room_id).map(|entry| Arc::clone(entry.value())) else {
            self.topology.topology(room_id)?;
            return Ok(CleanupReport::default());
        };

        // Let creations already in flight for this producer land first
        let in_flight: Vec<Arc<Mutex<()>>> = forwards
            .creation_locks
            .iter()
            .filter(|entry| &entry.key().0 == producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for lock in &in_flight {
            drop(lock.lock().await);
        }
        drop(in_flight);

        let records = forwards
            .records
            .remove(producer_id)
            .map(|(_, records)| records)
            .unwrap_or_default();
        let report = self.close_records(room_id, producer_id, records).await;

        // Locks nobody is waiting on can go with the producer
        forwards
            .creation_locks
            .retain(|(pid, _), lock| pid != producer_id || Arc::strong_count(lock) > 1);

        Ok(report)
    }

    /// Close and forget every forward link of a room
    pub async fn cleanup_room(&self, room_id: &RoomId) -> CleanupReport {
        let Some((_, forwards)) = self.rooms.remove(room_id) else {
            return CleanupReport::default();
        };

        // Creations in flight still hold this room's map; let them land in it
        let in_flight: Vec<Arc<Mutex<()>>> = forwards
            .creation_locks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for lock in &in_flight {
            drop(lock.lock().await);
        }
        drop(in_flight);

        let producers: Vec<ProducerId> = forwards
            .records
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let closes = producers.iter().map(|producer_id| {
            let records = forwards
                .records
                .remove(producer_id)
                .map(|(_, records)| records)
                .unwrap_or_default();
            self.close_records(room_id, producer_id, records)
        });

        let mut report = CleanupReport::default();
        for producer_report in join_all(closes).await {
            report.merge(producer_report);
        }

        if report.closed + report.failed > 0 {
            info!(
                room_id = %room_id,
                producers = producers.len(),
                closed = report.closed,
                failed = report.failed,
                "Room forward links cleaned up"
            );
        }
        report
    }

    async fn close_records(
        &self,
        room_id: &RoomId,
        producer_id: &ProducerId,
        records: Vec<ForwardRecord>,
    ) -> CleanupReport {
        if records.is_empty() {
            return CleanupReport::default();
        }

        let closes = records.iter().map(|record| async move {
            if !record.producer.mark_closed() {
                return Ok(());
            }
            match self.engine.close_producer(record.producer.id()).await {
                Ok(()) | Err(EngineError::AlreadyClosed(_)) => Ok(()),
                Err(e) => Err((record, e)),
            }
        });

        let mut report = CleanupReport::default();
        for result in join_all(closes).await {
            match result {
                Ok(()) => report.closed += 1,
                Err((record, e)) => {
                    report.failed += 1;
                    warn!(
                        room_id = %room_id,
                        producer_id = %producer_id,
                        forwarded_id = %record.producer.id(),
                        target_router = record.target_router_index,
                        error = %e,
                        "Failed to close forward link"
                    );
                }
            }
        }

        info!(
            room_id = %room_id,
            producer_id = %producer_id,
            closed = report.closed,
            failed = report.failed,
            "Forward links closed"
        );
        report
    }

    /// Forward links currently tracked for one producer
    #[must_use]
    pub fn records(&self, room_id: &RoomId, producer_id: &ProducerId) -> Vec<ForwardRecord> {
        self.rooms
            .get(room_id)
            .and_then(|forwards| forwards.records.get(producer_id).map(|r| r.value().clone()))
            .unwrap_or_default()
    }

    /// Forward links tracked in a room
    #[must_use]
    pub fn link_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |forwards| forwards.link_count())
    }

    /// Origin producers with at least one tracked link in a room
    #[must_use]
    pub fn forwarded_producer_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |forwards| forwards.records.len())
    }

    #[must_use]
    pub fn total_link_count(&self) -> usize {
        self.rooms.iter().map(|entry| entry.value().link_count()).sum()
    }

    #[cfg(test)]
    fn creation_lock_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |forwards| forwards.creation_locks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TopologyConfig, WorkerConfig};
    use crate::engine::MediaCodec;
    use crate::placement::LeastParticipants;
    use crate::test_helpers::FakeEngine;
    use crate::topology::RoomKind;
    use crate::worker_pool::WorkerPool;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<FakeEngine>,
        forwarding: Arc<ForwardingManager>,
        room: RoomId,
        routers: Vec<Arc<RouterHandle>>,
    }

    async fn fixture(workers: usize, kind: RoomKind) -> Fixture {
        let engine = Arc::new(FakeEngine::new());
        let worker_config = WorkerConfig {
            num_workers: workers,
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::initialize(engine.clone(), &worker_config, Arc::new(|_| {}))
            .await
            .unwrap();
        let topology = Arc::new(TopologyManager::new(
            TopologyConfig::default(),
            vec![MediaCodec::opus(), MediaCodec::vp8()],
            pool,
            Arc::new(LeastParticipants),
        ));
        let room = RoomId::from("lecture");
        let routers = topology.create_topology(room.clone(), kind).await.unwrap();
        let forwarding = Arc::new(ForwardingManager::new(topology, engine.clone()));

        Fixture {
            engine,
            forwarding,
            room,
            routers,
        }
    }

    fn origin(fx: &Fixture, id: &str, router: usize) -> Arc<ProducerHandle> {
        Arc::new(ProducerHandle::new(
            ProducerId::from(id),
            fx.routers[router].id().clone(),
        ))
    }

    #[tokio::test]
    async fn test_same_router_returns_original() {
        let fx = fixture(3, RoomKind::Lecture).await;
        let camera = origin(&fx, "cam-1", 1);

        let result = fx.forwarding.forward_on_demand(&fx.room, &camera, 1, 1).await.unwrap();

        assert!(Arc::ptr_eq(&result, &camera));
        assert_eq!(fx.engine.pipe_calls(), 0);
    }

    #[tokio::test]
    async fn test_on_demand_creates_once_then_fast_path() {
        let fx = fixture(3, RoomKind::Lecture).await;
        let camera = origin(&fx, "cam-1", 0);

        let first = fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2).await.unwrap();
        let second = fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.router_id(), fx.routers[2].id());
        assert_eq!(fx.engine.pipe_calls(), 1);

        let records = fx.forwarding.records(&fx.room, camera.id());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_router_index, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_on_demand_creates_single_link() {
        let fx = fixture(3, RoomKind::Lecture).await;
        fx.engine.set_pipe_delay(Duration::from_millis(20));
        let camera = origin(&fx, "cam-1", 0);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let forwarding = Arc::clone(&fx.forwarding);
                let room = fx.room.clone();
                let camera = Arc::clone(&camera);
                tokio::spawn(async move {
                    forwarding.forward_on_demand(&room, &camera, 0, 1).await
                })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(fx.engine.pipe_calls(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(fx.forwarding.records(&fx.room, camera.id()).len(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_pairs_do_not_share_a_lock() {
        let fx = fixture(3, RoomKind::Lecture).await;
        let camera = origin(&fx, "cam-1", 0);
        let screen = origin(&fx, "screen-1", 0);

        let (a, b, c) = tokio::join!(
            fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 1),
            fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2),
            fx.forwarding.forward_on_demand(&fx.room, &screen, 0, 1),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(fx.engine.pipe_calls(), 3);
        assert_eq!(fx.forwarding.link_count(&fx.room), 3);
        assert_eq!(fx.forwarding.forwarded_producer_count(&fx.room), 2);
    }

    #[tokio::test]
    async fn test_on_demand_failure_surfaces_and_can_retry() {
        let fx = fixture(3, RoomKind::Lecture).await;
        fx.engine.fail_pipes_to(fx.routers[2].id());
        let camera = origin(&fx, "cam-1", 0);

        let result = fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2).await;
        assert!(matches!(
            result,
            Err(Error::ForwardCreationFailed { target_index: 2, .. })
        ));
        assert!(fx.forwarding.records(&fx.room, camera.id()).is_empty());

        // Nothing cached from the failure: the next request tries again
        let _ = fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2).await;
        assert_eq!(fx.engine.pipe_calls(), 2);
    }

    #[tokio::test]
    async fn test_forward_to_all_tolerates_partial_failure() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        fx.engine.fail_pipes_to(fx.routers[2].id());
        let mic = origin(&fx, "mic-1", 0);

        let established = fx.forwarding.forward_to_all(&fx.room, &mic, 0).await.unwrap();

        assert_eq!(established, 1);
        assert_eq!(fx.engine.pipe_calls(), 2);
        let records = fx.forwarding.records(&fx.room, mic.id());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_router_index, 1);

        let report = fx
            .forwarding
            .cleanup_for_producer(&fx.room, mic.id())
            .await
            .unwrap();
        assert_eq!(report, CleanupReport { closed: 1, failed: 0 });
        assert_eq!(fx.engine.closed_producer_count(), 1);
        assert!(fx.engine.is_producer_closed(records[0].producer.id()));
    }

    #[tokio::test]
    async fn test_forward_to_all_single_router_is_noop() {
        let fx = fixture(3, RoomKind::Meeting).await;
        let mic = origin(&fx, "mic-1", 0);

        let established = fx.forwarding.forward_to_all(&fx.room, &mic, 0).await.unwrap();

        assert_eq!(established, 0);
        assert_eq!(fx.engine.pipe_calls(), 0);
    }

    #[tokio::test]
    async fn test_on_demand_reuses_eager_link() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        let presenter = origin(&fx, "presenter-cam", 1);

        assert_eq!(fx.forwarding.forward_to_all(&fx.room, &presenter, 1).await.unwrap(), 2);
        let eager = fx.forwarding.records(&fx.room, presenter.id());

        let on_demand = fx
            .forwarding
            .forward_on_demand(&fx.room, &presenter, 1, 0)
            .await
            .unwrap();

        assert_eq!(fx.engine.pipe_calls(), 2);
        assert!(eager
            .iter()
            .any(|r| r.target_router_index == 0 && Arc::ptr_eq(&r.producer, &on_demand)));

        // A second fan-out keeps one link per target
        assert_eq!(fx.forwarding.forward_to_all(&fx.room, &presenter, 1).await.unwrap(), 2);
        assert_eq!(fx.forwarding.link_count(&fx.room), 2);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let fx = fixture(3, RoomKind::Lecture).await;
        let camera = origin(&fx, "cam-1", 0);
        fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 1).await.unwrap();
        fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 2).await.unwrap();

        let first = fx.forwarding.cleanup_for_producer(&fx.room, camera.id()).await.unwrap();
        let second = fx.forwarding.cleanup_for_producer(&fx.room, camera.id()).await.unwrap();

        assert_eq!(first.closed, 2);
        assert_eq!(second, CleanupReport::default());
        assert_eq!(fx.engine.closed_producer_count(), 2);
        // Idle creation locks are dropped with the producer
        assert_eq!(fx.forwarding.creation_lock_count(&fx.room), 0);
    }

    #[tokio::test]
    async fn test_cleanup_counts_closed_links_and_drops_failures() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        let mic = origin(&fx, "mic-1", 0);
        fx.forwarding.forward_to_all(&fx.room, &mic, 0).await.unwrap();

        let records = fx.forwarding.records(&fx.room, mic.id());
        let to_router_1 = records.iter().find(|r| r.target_router_index == 1).unwrap();
        let to_router_2 = records.iter().find(|r| r.target_router_index == 2).unwrap();
        // One link already gone on the engine side, the other refuses to close
        to_router_1.producer.mark_closed();
        fx.engine.fail_producer_close(to_router_2.producer.id());

        let report = fx.forwarding.cleanup_for_producer(&fx.room, mic.id()).await.unwrap();

        assert_eq!(report, CleanupReport { closed: 1, failed: 1 });
        assert!(fx.forwarding.records(&fx.room, mic.id()).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_unknown_producer_and_room() {
        let fx = fixture(2, RoomKind::Lecture).await;

        let report = fx
            .forwarding
            .cleanup_for_producer(&fx.room, &ProducerId::from("never-forwarded"))
            .await
            .unwrap();
        assert_eq!(report, CleanupReport::default());

        let result = fx
            .forwarding
            .cleanup_for_producer(&RoomId::from("ghost"), &ProducerId::from("p"))
            .await;
        assert!(matches!(result, Err(Error::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let fx = fixture(2, RoomKind::Lecture).await;
        let camera = origin(&fx, "cam-1", 0);

        assert!(matches!(
            fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 5).await,
            Err(Error::RouterIndexOutOfRange { index: 5, router_count: 2, .. })
        ));
        assert!(matches!(
            fx.forwarding
                .forward_on_demand(&RoomId::from("ghost"), &camera, 0, 1)
                .await,
            Err(Error::RoomNotFound(_))
        ));
        assert!(matches!(
            fx.forwarding.forward_to_all(&fx.room, &camera, 9).await,
            Err(Error::RouterIndexOutOfRange { .. })
        ));

        camera.mark_closed();
        assert!(matches!(
            fx.forwarding.forward_on_demand(&fx.room, &camera, 0, 1).await,
            Err(Error::HandleClosed(_))
        ));
        assert_eq!(fx.engine.pipe_calls(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_room_closes_everything() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        let mic = origin(&fx, "mic-1", 0);
        let camera = origin(&fx, "cam-1", 1);
        fx.forwarding.forward_to_all(&fx.room, &mic, 0).await.unwrap();
        fx.forwarding.forward_on_demand(&fx.room, &camera, 1, 2).await.unwrap();
        assert_eq!(fx.forwarding.total_link_count(), 3);

        let report = fx.forwarding.cleanup_room(&fx.room).await;

        assert_eq!(report, CleanupReport { closed: 3, failed: 0 });
        assert_eq!(fx.forwarding.total_link_count(), 0);
        assert_eq!(fx.forwarding.cleanup_room(&fx.room).await, CleanupReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_waits_for_creation_in_flight() {
        let fx = fixture(3, RoomKind::Lecture).await;
        fx.engine.set_pipe_delay(Duration::from_millis(50));
        let camera = origin(&fx, "cam-1", 0);

        let creating = {
            let forwarding = Arc::clone(&fx.forwarding);
            let room = fx.room.clone();
            let camera = Arc::clone(&camera);
            tokio::spawn(async move { forwarding.forward_on_demand(&room, &camera, 0, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The origin goes away while its link is still being piped
        camera.mark_closed();
        let report = fx
            .forwarding
            .cleanup_for_producer(&fx.room, camera.id())
            .await
            .unwrap();

        let forwarded = creating.await.unwrap().unwrap();
        assert_eq!(report, CleanupReport { closed: 1, failed: 0 });
        assert!(fx.forwarding.records(&fx.room, camera.id()).is_empty());
        assert!(forwarded.is_closed());
        assert!(fx.engine.is_producer_closed(forwarded.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_room_waits_for_creation_in_flight() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        fx.engine.set_pipe_delay(Duration::from_millis(50));
        let mic = origin(&fx, "mic-1", 1);

        let creating = {
            let forwarding = Arc::clone(&fx.forwarding);
            let room = fx.room.clone();
            let mic = Arc::clone(&mic);
            tokio::spawn(async move { forwarding.forward_on_demand(&room, &mic, 1, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = fx.forwarding.cleanup_room(&fx.room).await;

        let forwarded = creating.await.unwrap().unwrap();
        assert_eq!(report, CleanupReport { closed: 1, failed: 0 });
        assert!(fx.engine.is_producer_closed(forwarded.id()));
        assert_eq!(fx.forwarding.total_link_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_targets_count_as_failed_forwards() {
        let fx = fixture(3, RoomKind::Broadcast).await;
        let mic = origin(&fx, "mic-1", 0);
        mic.mark_closed();
        let failed = || {
            metrics::FORWARDS_FAILED
                .with_label_values(&[metrics::POLICY_EAGER])
                .get()
        };
        let before = failed();

        let established = fx.forwarding.forward_to_all(&fx.room, &mic, 0).await.unwrap();

        assert_eq!(established, 0);
        assert_eq!(fx.engine.pipe_calls(), 0);
        assert!(failed() >= before + 2);
    }
}
