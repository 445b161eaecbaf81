//! Router topology per room
//!
//! Each room owns a fixed, ordered set of routers created up front (index 0 is
//! the primary). Only a prefix of them, `active_router_count` long, is open for
//! placement; the prefix grows as participants join and never shrinks.
//!
//! Lifecycle: `Created (1 active) -> Scaling (active grows) -> TornDown`.
//!
//! All per-room counters and the assignment map sit behind one
//! `parking_lot::Mutex` that is never held across an `.await`, so a join's
//! read-modify-write of counters, activation and placement is atomic.

use crate::config::TopologyConfig;
use crate::engine::{EngineError, MediaCodec};
use crate::error::{Error, Result};
use crate::handle::{RouterHandle, WorkerHandle};
use crate::placement::{PlacementCandidate, PlacementPolicy};
use crate::types::{ParticipantId, RoomId, RouterId};
use crate::worker_pool::WorkerPool;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kind of room as requested by the signaling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Small, capacity-bounded meeting
    Meeting,
    /// Large interactive session (lecture, all-hands)
    Lecture,
    /// One-to-many broadcast with a large audience
    Broadcast,
}

/// Router scaling strategy derived from the room kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Exactly one router; every participant implicitly on router 0
    Single,
    /// One router per worker, activated progressively
    Multi,
}

impl Strategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

impl From<RoomKind> for Strategy {
    fn from(kind: RoomKind) -> Self {
        match kind {
            RoomKind::Meeting => Self::Single,
            RoomKind::Lecture | RoomKind::Broadcast => Self::Multi,
        }
    }
}

#[derive(Debug)]
struct TopologyState {
    active_router_count: usize,
    participant_count: usize,
    /// Set on the first join and kept until teardown
    first_join_at: Option<Instant>,
    first_join_time: Option<DateTime<Utc>>,
    assignments: HashMap<ParticipantId, usize>,
}

/// Routers and placement state of one room
pub struct RoomTopology {
    room_id: RoomId,
    strategy: Strategy,
    routers: Vec<Arc<RouterHandle>>,
    /// Side table: which worker hosts each router
    router_workers: HashMap<RouterId, Arc<WorkerHandle>>,
    state: Mutex<TopologyState>,
}

impl RoomTopology {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[must_use]
    pub fn routers(&self) -> &[Arc<RouterHandle>] {
        &self.routers
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    pub fn router(&self, index: usize) -> Result<Arc<RouterHandle>> {
        self.routers
            .get(index)
            .cloned()
            .ok_or_else(|| Error::RouterIndexOutOfRange {
                room_id: self.room_id.clone(),
                index,
                router_count: self.routers.len(),
            })
    }

    /// Worker hosting the router at `index`
    #[must_use]
    pub fn worker_for(&self, index: usize) -> Option<Arc<WorkerHandle>> {
        let router = self.routers.get(index)?;
        self.router_workers.get(router.id()).cloned()
    }

    #[must_use]
    pub fn active_router_count(&self) -> usize {
        self.state.lock().active_router_count
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.state.lock().participant_count
    }

    /// Read-only view for status reporting
    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock();
        let mut participants_per_router = vec![0; self.routers.len()];
        for &index in state.assignments.values() {
            if let Some(slot) = participants_per_router.get_mut(index) {
                *slot += 1;
            }
        }

        TopologySnapshot {
            room_id: self.room_id.clone(),
            strategy: self.strategy,
            router_count: self.routers.len(),
            active_router_count: state.active_router_count,
            participant_count: state.participant_count,
            participants_per_router,
            first_join_at: state.first_join_time,
        }
    }

    fn assign(
        &self,
        participant_id: &ParticipantId,
        config: &TopologyConfig,
        policy: &dyn PlacementPolicy,
        pool: &WorkerPool,
    ) -> usize {
        if self.strategy == Strategy::Single {
            return 0;
        }

        let mut state = self.state.lock();

        // A repeated join keeps its router and does not count twice
        if let Some(&index) = state.assignments.get(participant_id) {
            debug!(room_id = %self.room_id, participant_id = %participant_id, router = index, "Participant already assigned");
            return index;
        }

        let now = Instant::now();
        state.participant_count += 1;
        let first_join_at = *state.first_join_at.get_or_insert(now);
        if state.first_join_time.is_none() {
            state.first_join_time = Some(Utc::now());
        }

        let router_count = self.routers.len();
        let in_burst_window = now.duration_since(first_join_at) < config.burst_window();

        if in_burst_window
            && state.participant_count >= config.burst_threshold
            && state.active_router_count < router_count
        {
            info!(
                room_id = %self.room_id,
                participants = state.participant_count,
                previous_active = state.active_router_count,
                active_routers = router_count,
                "Join burst detected, activating every router"
            );
            state.active_router_count = router_count;
        } else {
            let needed = state
                .participant_count
                .div_ceil(config.participants_per_router.max(1))
                .min(router_count);
            if needed > state.active_router_count {
                info!(
                    room_id = %self.room_id,
                    participants = state.participant_count,
                    previous_active = state.active_router_count,
                    active_routers = needed,
                    "Scaling up active routers"
                );
                state.active_router_count = needed;
            }
        }

        // Recount from the assignment map rather than trusting cached counters
        let active = state.active_router_count;
        let mut assigned = vec![0usize; active];
        for &index in state.assignments.values() {
            if let Some(slot) = assigned.get_mut(index) {
                *slot += 1;
            }
        }

        let candidates: Vec<PlacementCandidate> = assigned
            .iter()
            .enumerate()
            .map(|(index, &count)| PlacementCandidate {
                index,
                assigned: count,
                worker_cpu: self
                    .worker_for(index)
                    .and_then(|worker| pool.cpu_time(worker.index())),
            })
            .collect();

        let index = policy.select(&candidates).min(active - 1);
        state.assignments.insert(participant_id.clone(), index);

        debug!(
            room_id = %self.room_id,
            participant_id = %participant_id,
            router = index,
            active_routers = active,
            policy = policy.name(),
            "Participant placed"
        );

        index
    }

    fn assigned_index(&self, participant_id: &ParticipantId) -> Option<usize> {
        if self.strategy == Strategy::Single {
            return Some(0);
        }
        self.state.lock().assignments.get(participant_id).copied()
    }

    fn remove(&self, participant_id: &ParticipantId) -> bool {
        if self.strategy == Strategy::Single {
            return false;
        }
        let mut state = self.state.lock();
        if state.assignments.remove(participant_id).is_some() {
            state.participant_count = state.participant_count.saturating_sub(1);
            true
        } else {
            false
        }
    }
}

/// Point-in-time view of a room's topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub room_id: RoomId,
    pub strategy: Strategy,
    pub router_count: usize,
    pub active_router_count: usize,
    pub participant_count: usize,
    pub participants_per_router: Vec<usize>,
    pub first_join_at: Option<DateTime<Utc>>,
}

/// Owns the router topology of every room
pub struct TopologyManager {
    config: TopologyConfig,
    codecs: Vec<MediaCodec>,
    pool: Arc<WorkerPool>,
    placement: Arc<dyn PlacementPolicy>,
    rooms: DashMap<RoomId, Arc<RoomTopology>>,
}

impl TopologyManager {
    pub fn new(
        config: TopologyConfig,
        codecs: Vec<MediaCodec>,
        pool: Arc<WorkerPool>,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            config,
            codecs,
            pool,
            placement,
            rooms: DashMap::new(),
        }
    }

    /// Create every router the room will ever use.
    ///
    /// Any router creation failure closes the routers already created and
    /// leaves no trace of the room.
    pub async fn create_topology(
        &self,
        room_id: RoomId,
        kind: RoomKind,
    ) -> Result<Vec<Arc<RouterHandle>>> {
        if self.rooms.contains_key(&room_id) {
            return Err(Error::RoomAlreadyExists(room_id));
        }

        let strategy = Strategy::from(kind);
        let workers: Vec<Arc<WorkerHandle>> = match strategy {
            Strategy::Single => vec![self.pool.next_worker()],
            Strategy::Multi => self.pool.workers().to_vec(),
        };

        let engine = self.pool.engine();
        let mut routers = Vec::with_capacity(workers.len());
        let mut router_workers = HashMap::with_capacity(workers.len());

        for (index, worker) in workers.iter().enumerate() {
            let created = if worker.is_closed() {
                Err(EngineError::AlreadyClosed(format!("worker {}", worker.id())))
            } else {
                engine.create_router(worker.id(), &self.codecs).await
            };

            match created {
                Ok(router_id) => {
                    router_workers.insert(router_id.clone(), Arc::clone(worker));
                    routers.push(Arc::new(RouterHandle::new(router_id)));
                }
                Err(source) => {
                    warn!(
                        room_id = %room_id,
                        router = index,
                        worker = worker.index(),
                        error = %source,
                        "Router creation failed, abandoning room"
                    );
                    self.close_routers(&room_id, &routers).await;
                    return Err(Error::RouterCreationFailed {
                        room_id,
                        index,
                        source,
                    });
                }
            }
        }

        let topology = Arc::new(RoomTopology {
            room_id: room_id.clone(),
            strategy,
            routers: routers.clone(),
            router_workers,
            state: Mutex::new(TopologyState {
                active_router_count: 1,
                participant_count: 0,
                first_join_at: None,
                first_join_time: None,
                assignments: HashMap::new(),
            }),
        });

        // Another caller may have created the same room while we were creating routers
        let inserted = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(topology);
                true
            }
        };
        if !inserted {
            self.close_routers(&room_id, &routers).await;
            return Err(Error::RoomAlreadyExists(room_id));
        }

        info!(
            room_id = %room_id,
            kind = ?kind,
            strategy = strategy.as_str(),
            routers = routers.len(),
            "Room topology created"
        );

        Ok(routers)
    }

    pub fn topology(&self, room_id: &RoomId) -> Result<Arc<RoomTopology>> {
        self.rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))
    }

    /// Attach a participant to a router, scaling the room up first if needed
    pub fn assign_participant(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<Arc<RouterHandle>> {
        let topology = self.topology(room_id)?;
        let index = topology.assign(
            participant_id,
            &self.config,
            self.placement.as_ref(),
            &self.pool,
        );
        topology.router(index)
    }

    pub fn assigned_router_index(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<usize> {
        self.topology(room_id)?
            .assigned_index(participant_id)
            .ok_or_else(|| Error::ParticipantNotAssigned {
                room_id: room_id.clone(),
                participant_id: participant_id.clone(),
            })
    }

    pub fn assigned_router(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<Arc<RouterHandle>> {
        let topology = self.topology(room_id)?;
        let index = topology
            .assigned_index(participant_id)
            .ok_or_else(|| Error::ParticipantNotAssigned {
                room_id: room_id.clone(),
                participant_id: participant_id.clone(),
            })?;
        topology.router(index)
    }

    /// Drop a participant's assignment. Active routers stay active.
    pub fn remove_participant(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()> {
        let topology = self.topology(room_id)?;
        if topology.remove(participant_id) {
            debug!(room_id = %room_id, participant_id = %participant_id, "Participant removed from topology");
        }
        Ok(())
    }

    /// Close every router of the room and forget all of its bookkeeping.
    ///
    /// Forward links must already have been cleaned up by the caller.
    pub async fn teardown_topology(&self, room_id: &RoomId) -> Result<()> {
        let (_, topology) = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))?;

        self.close_routers(room_id, &topology.routers).await;

        info!(
            room_id = %room_id,
            routers = topology.routers.len(),
            "Room topology torn down"
        );
        Ok(())
    }

    async fn close_routers(&self, room_id: &RoomId, routers: &[Arc<RouterHandle>]) {
        let engine = self.pool.engine();
        let closes = routers
            .iter()
            .filter(|router| router.mark_closed())
            .map(|router| async move { (router, engine.close_router(router.id()).await) });

        for (router, result) in join_all(closes).await {
            match result {
                Ok(()) | Err(EngineError::AlreadyClosed(_)) => {}
                Err(e) => {
                    warn!(room_id = %room_id, router_id = %router.id(), error = %e, "Failed to close router");
                }
            }
        }
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<TopologySnapshot> {
        self.rooms.iter().map(|entry| entry.value().snapshot()).collect()
    }

    #[must_use]
    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }
}
