//! Media engine seam
//!
//! The native media engine (workers, routers, producers and the pipes between
//! routers) is an external collaborator. The control plane only talks to it
//! through [`MediaEngine`], addressing every engine object by a stable ID.
//! Every method is a suspension point: other flows may run while it is pending.

use crate::types::{ProducerId, RouterId, WorkerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Failure reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine object already closed: {0}")]
    AlreadyClosed(String),

    #[error("Engine object not found: {0}")]
    NotFound(String),

    #[error("Engine request failed: {0}")]
    Request(String),
}

/// Media kind of a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codec a router is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

impl MediaCodec {
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
        }
    }

    #[must_use]
    pub fn vp8() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
        }
    }
}

/// Settings every worker process is spawned with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

/// Why a worker went away without being asked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub reason: String,
}

/// A freshly spawned worker.
///
/// `died` resolves only if the worker exits unexpectedly; the engine drops the
/// sender when the worker is closed on request.
#[derive(Debug)]
pub struct WorkerSpawn {
    pub id: WorkerId,
    pub pid: u32,
    pub died: oneshot::Receiver<WorkerExit>,
}

/// Cumulative CPU time consumed by a worker process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub utime: Duration,
    pub stime: Duration,
}

impl ResourceUsage {
    #[must_use]
    pub fn cpu_time(&self) -> Duration {
        self.utime + self.stime
    }
}

/// Function-call surface consumed from the native media engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a worker process
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerSpawn, EngineError>;

    /// Create a router on the given worker
    async fn create_router(
        &self,
        worker: &WorkerId,
        codecs: &[MediaCodec],
    ) -> Result<RouterId, EngineError>;

    /// Relay `producer` (living on `source`) into `target`, returning the ID of
    /// the forwarded producer created on `target`
    async fn pipe_to_router(
        &self,
        producer: &ProducerId,
        source: &RouterId,
        target: &RouterId,
    ) -> Result<ProducerId, EngineError>;

    /// Read the worker's cumulative CPU usage
    async fn resource_usage(&self, worker: &WorkerId) -> Result<ResourceUsage, EngineError>;

    /// Close a worker, cascading to everything it hosts
    async fn close_worker(&self, worker: &WorkerId) -> Result<(), EngineError>;

    /// Close a router, cascading to its transports and producers
    async fn close_router(&self, router: &RouterId) -> Result<(), EngineError>;

    /// Close a producer
    async fn close_producer(&self, producer: &ProducerId) -> Result<(), EngineError>;
}
