//! Crate-side handles to engine objects
//!
//! A handle pairs the engine's stable ID with a `closed` flag. The flag is
//! checked before every engine call made through the handle and is set once the
//! object is closed, whether by us or by a cascading close on the engine side.

use crate::types::{ProducerId, RouterId, WorkerId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// A worker process owned by the pool
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    id: WorkerId,
    pid: u32,
    closed: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(index: usize, id: WorkerId, pid: u32) -> Self {
        Self {
            index,
            id,
            pid,
            closed: AtomicBool::new(false),
        }
    }

    /// Position of the worker in the pool
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns `true` only for the call that flipped the flag.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// A router belonging to exactly one room
#[derive(Debug)]
pub struct RouterHandle {
    id: RouterId,
    closed: AtomicBool,
}

impl RouterHandle {
    pub(crate) fn new(id: RouterId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RouterId {
        &self.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// A producer: either an origin stream or a forwarded copy on another router
#[derive(Debug)]
pub struct ProducerHandle {
    id: ProducerId,
    router_id: RouterId,
    closed: AtomicBool,
}

impl ProducerHandle {
    pub fn new(id: ProducerId, router_id: RouterId) -> Self {
        Self {
            id,
            router_id,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ProducerId {
        &self.id
    }

    /// Router the producer lives on
    #[must_use]
    pub const fn router_id(&self) -> &RouterId {
        &self.router_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record that the producer was closed outside the control plane
    /// (e.g. the signaling layer closed the origin stream).
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Health-check view of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub index: usize,
    pub pid: u32,
    pub closed: bool,
}

impl From<&WorkerHandle> for WorkerStatus {
    fn from(worker: &WorkerHandle) -> Self {
        Self {
            index: worker.index(),
            pid: worker.pid(),
            closed: worker.is_closed(),
        }
    }
}
