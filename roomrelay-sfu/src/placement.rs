//! Participant placement policies
//!
//! Placement runs under the room's topology lock and must not suspend, so
//! policies are plain synchronous functions over a snapshot of the candidate
//! routers. Scaling decides how many routers are candidates; the policy only
//! picks one of them.

use crate::config::PlacementKind;
use std::sync::Arc;
use std::time::Duration;

/// One active router considered for a new participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementCandidate {
    /// Router index within the room
    pub index: usize,
    /// Participants currently assigned to this router
    pub assigned: usize,
    /// Last sampled cumulative CPU time of the router's worker
    pub worker_cpu: Option<Duration>,
}

pub trait PlacementPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick the router index for the next participant. `candidates` is never
    /// empty and is ordered by router index.
    fn select(&self, candidates: &[PlacementCandidate]) -> usize;
}

/// Fewest assigned participants wins; ties go to the lowest index
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastParticipants;

impl PlacementPolicy for LeastParticipants {
    fn name(&self) -> &'static str {
        "least_participants"
    }

    fn select(&self, candidates: &[PlacementCandidate]) -> usize {
        candidates
            .iter()
            .min_by_key(|c| (c.assigned, c.index))
            .map_or(0, |c| c.index)
    }
}

/// Least loaded worker (by cumulative CPU time) wins.
///
/// Routers whose worker has not been sampled yet rank after sampled ones.
/// Ties fall back to fewest assigned, then lowest index.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastWorkerCpu;

impl PlacementPolicy for LeastWorkerCpu {
    fn name(&self) -> &'static str {
        "least_worker_cpu"
    }

    fn select(&self, candidates: &[PlacementCandidate]) -> usize {
        candidates
            .iter()
            .min_by_key(|c| (c.worker_cpu.is_none(), c.worker_cpu, c.assigned, c.index))
            .map_or(0, |c| c.index)
    }
}

impl From<PlacementKind> for Arc<dyn PlacementPolicy> {
    fn from(kind: PlacementKind) -> Self {
        match kind {
            PlacementKind::LeastParticipants => Arc::new(LeastParticipants),
            PlacementKind::LeastWorkerCpu => Arc::new(LeastWorkerCpu),
        }
    }
}
