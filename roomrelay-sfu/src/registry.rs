//! Room registry - top-level orchestration of the routing control plane
//!
//! This module provides:
//! - Startup of the worker pool and its background monitor
//! - Room topology lifecycle (create, join, leave, teardown)
//! - Eager and on-demand forwarding between a room's routers
//! - Global statistics collection

use crate::config::RelayConfig;
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::forwarding::{CleanupReport, ForwardingManager};
use crate::handle::{ProducerHandle, RouterHandle, WorkerStatus};
use crate::metrics;
use crate::placement::PlacementPolicy;
use crate::topology::{RoomKind, Strategy, TopologyManager, TopologySnapshot};
use crate::types::{ParticipantId, ProducerId, RoomId};
use crate::worker_pool::{FatalHandler, WorkerPool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Per-room statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStats {
    pub topology: TopologySnapshot,
    /// Forward links currently tracked
    pub forward_links: usize,
    /// Origin producers with at least one forward link
    pub forwarded_producers: usize,
}

/// Global registry statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Number of rooms with a topology
    pub active_rooms: usize,
    /// Rooms running on a single router
    pub single_router_rooms: usize,
    /// Rooms spread over one router per worker
    pub multi_router_rooms: usize,
    /// Routers across all rooms
    pub total_routers: usize,
    /// Routers open for placement across all rooms
    pub active_routers: usize,
    /// Participants tracked by multi-router rooms
    pub total_participants: usize,
    /// Forward links across all rooms
    pub forward_links: usize,
    /// Workers in the pool
    pub workers: usize,
    /// Workers already closed
    pub closed_workers: usize,
}

/// Room registry - owns the worker pool, topologies and forward links
pub struct RoomRegistry {
    config: Arc<RelayConfig>,
    pool: Arc<WorkerPool>,
    topology: Arc<TopologyManager>,
    forwarding: ForwardingManager,
    /// Background tasks, aborted on shutdown
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomRegistry {
    /// Validate the configuration, start the worker pool and the background
    /// tasks. The placement policy comes from `config.topology.placement`.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        config: RelayConfig,
        on_fatal: FatalHandler,
    ) -> Result<Arc<Self>> {
        let placement: Arc<dyn PlacementPolicy> = config.topology.placement.into();
        Self::start_with_placement(engine, config, on_fatal, placement).await
    }

    /// Same as [`RoomRegistry::start`] with an explicit placement policy
    pub async fn start_with_placement(
        engine: Arc<dyn MediaEngine>,
        config: RelayConfig,
        on_fatal: FatalHandler,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|problems| Error::InvalidConfig(problems.join("; ")))?;

        let pool = WorkerPool::initialize(Arc::clone(&engine), &config.workers, on_fatal).await?;
        let placement_name = placement.name();
        let topology = Arc::new(TopologyManager::new(
            config.topology.clone(),
            config.router.media_codecs.clone(),
            Arc::clone(&pool),
            placement,
        ));
        let forwarding = ForwardingManager::new(Arc::clone(&topology), engine);

        let registry = Arc::new(Self {
            config: Arc::new(config),
            pool,
            topology,
            forwarding,
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            workers = registry.pool.len(),
            participants_per_router = registry.config.topology.participants_per_router,
            burst_threshold = registry.config.topology.burst_threshold,
            placement = placement_name,
            "Room registry started"
        );

        // Start background tasks
        let monitor = registry
            .pool
            .spawn_monitor(registry.config.monitor.worker_interval());

        let weak = Arc::downgrade(&registry);
        let period = registry.config.monitor.stats_interval();
        let stats = tokio::spawn(async move {
            stats_collection_task(weak, period).await;
        });

        registry.tasks.lock().extend([monitor, stats]);

        Ok(registry)
    }

    /// Create the router topology of a new room
    pub async fn create_topology(
        &self,
        room_id: RoomId,
        kind: RoomKind,
    ) -> Result<Vec<Arc<RouterHandle>>> {
        self.topology.create_topology(room_id, kind).await
    }

    /// Assign a joining participant to one of the room's routers
    pub fn assign_participant(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<Arc<RouterHandle>> {
        self.topology.assign_participant(room_id, participant_id)
    }

    pub fn assigned_router(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<Arc<RouterHandle>> {
        self.topology.assigned_router(room_id, participant_id)
    }

    pub fn assigned_router_index(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<usize> {
        self.topology.assigned_router_index(room_id, participant_id)
    }

    pub fn remove_participant(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()> {
        self.topology.remove_participant(room_id, participant_id)
    }

    /// Forward a producer into every other router of the room
    pub async fn forward_to_all(
        &self,
        room_id: &RoomId,
        producer: &Arc<ProducerHandle>,
        source_index: usize,
    ) -> Result<usize> {
        self.forwarding
            .forward_to_all(room_id, producer, source_index)
            .await
    }

    /// Forward a producer into one router, creating the link at most once
    pub async fn forward_on_demand(
        &self,
        room_id: &RoomId,
        producer: &Arc<ProducerHandle>,
        source_index: usize,
        target_index: usize,
    ) -> Result<Arc<ProducerHandle>> {
        self.forwarding
            .forward_on_demand(room_id, producer, source_index, target_index)
            .await
    }

    /// Close every forward link of a producer that went away
    pub async fn cleanup_for_producer(
        &self,
        room_id: &RoomId,
        producer_id: &ProducerId,
    ) -> Result<CleanupReport> {
        self.forwarding.cleanup_for_producer(room_id, producer_id).await
    }

    /// Tear a room down: forward links first, then routers, then bookkeeping
    pub async fn teardown_topology(&self, room_id: &RoomId) -> Result<()> {
        self.topology.topology(room_id)?;

        let report = self.forwarding.cleanup_room(room_id).await;
        self.topology.teardown_topology(room_id).await?;

        // Links created while the routers were closing
        let late = self.forwarding.cleanup_room(room_id).await;

        info!(
            room_id = %room_id,
            forward_links_closed = report.closed + late.closed,
            forward_links_failed = report.failed + late.failed,
            remaining_rooms = self.topology.room_count(),
            "Room torn down"
        );
        Ok(())
    }

    /// Health check view of every worker
    #[must_use]
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.pool.worker_statuses()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.topology.room_ids()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.topology.room_count()
    }

    pub fn room_stats(&self, room_id: &RoomId) -> Result<RoomStats> {
        let topology = self.topology.topology(room_id)?;
        Ok(RoomStats {
            topology: topology.snapshot(),
            forward_links: self.forwarding.link_count(room_id),
            forwarded_producers: self.forwarding.forwarded_producer_count(room_id),
        })
    }

    /// Aggregate statistics over every room and worker
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            workers: self.pool.len(),
            closed_workers: self
                .pool
                .workers()
                .iter()
                .filter(|worker| worker.is_closed())
                .count(),
            forward_links: self.forwarding.total_link_count(),
            ..Default::default()
        };

        for snapshot in self.topology.snapshots() {
            stats.active_rooms += 1;
            match snapshot.strategy {
                Strategy::Single => stats.single_router_rooms += 1,
                Strategy::Multi => stats.multi_router_rooms += 1,
            }
            stats.total_routers += snapshot.router_count;
            stats.active_routers += snapshot.active_router_count;
            stats.total_participants += snapshot.participant_count;
        }

        stats
    }

    /// Refresh the exported gauges from a fresh aggregate
    fn update_global_stats(&self) -> ManagerStats {
        let stats = self.stats();

        metrics::ROOMS
            .with_label_values(&[Strategy::Single.as_str()])
            .set(stats.single_router_rooms as i64);
        metrics::ROOMS
            .with_label_values(&[Strategy::Multi.as_str()])
            .set(stats.multi_router_rooms as i64);
        metrics::ROUTERS.set(stats.total_routers as i64);
        metrics::ACTIVE_ROUTERS.set(stats.active_routers as i64);
        metrics::PARTICIPANTS.set(stats.total_participants as i64);
        metrics::FORWARD_LINKS.set(stats.forward_links as i64);

        debug!(
            active_rooms = stats.active_rooms,
            total_routers = stats.total_routers,
            total_participants = stats.total_participants,
            forward_links = stats.forward_links,
            "Updated global statistics"
        );

        stats
    }

    /// Tear down every room, then close every worker
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let rooms = self.room_ids();
        for room_id in &rooms {
            if let Err(e) = self.teardown_topology(room_id).await {
                warn!(room_id = %room_id, error = %e, "Failed to tear down room during shutdown");
            }
        }

        self.pool.shutdown_all().await;
        self.update_global_stats();

        info!(rooms = rooms.len(), "Room registry shut down");
    }
}

/// Background task for statistics collection. Stops once the registry is gone.
async fn stats_collection_task(registry: Weak<RoomRegistry>, period: Duration) {
    let mut ticker = interval(period);
    info!(
        interval_ms = period.as_millis() as u64,
        "Starting statistics collection task"
    );

    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            debug!("Room registry dropped, stopping statistics collection");
            break;
        };
        registry.update_global_stats();
    }
}
