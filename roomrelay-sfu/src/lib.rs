//! `roomrelay` SFU routing control plane
//!
//! Decides where each room's media is routed inside a pool of media engine
//! workers. The engine itself (RTP, ICE, DTLS, codecs) sits behind the
//! [`MediaEngine`] trait; this crate only drives it.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed set of engine workers, round-robin selection,
//!   resource monitoring, fatal death handling
//! - **`TopologyManager`**: one router (small meetings) or one router per
//!   worker (large rooms) per room, progressive and burst activation,
//!   least-loaded participant placement
//! - **`ForwardingManager`**: cross-router forward links, eager fan-out or
//!   created on demand at most once per `(producer, router)`, cleanup
//! - **`RoomRegistry`**: owns all of the above and runs the background tasks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomrelay_sfu::{exit_process, RelayConfig, RoomKind, RoomRegistry};
//!
//! let config = RelayConfig::load(Some("roomrelay.yaml"))?;
//! roomrelay_sfu::init_logging(&config.logging)?;
//!
//! let registry = RoomRegistry::start(engine, config, exit_process()).await?;
//! registry.create_topology("keynote".into(), RoomKind::Broadcast).await?;
//! let router = registry.assign_participant(&"keynote".into(), &"alice".into())?;
//! ```

mod config;
mod engine;
mod error;
mod forwarding;
mod handle;
mod logging;
pub mod metrics;
mod placement;
mod registry;
mod topology;
mod types;
mod worker_pool;

#[cfg(test)]
mod test_helpers;

pub use config::{
    LoggingConfig, MonitorConfig, PlacementKind, RelayConfig, RouterConfig, TopologyConfig,
    WorkerConfig,
};
pub use engine::{
    EngineError, MediaCodec, MediaEngine, MediaKind, ResourceUsage, WorkerExit, WorkerSettings,
    WorkerSpawn,
};
pub use error::{Error, Result};
pub use forwarding::{CleanupReport, ForwardRecord, ForwardingManager};
pub use handle::{ProducerHandle, RouterHandle, WorkerHandle, WorkerStatus};
pub use logging::init_logging;
pub use placement::{LeastParticipants, LeastWorkerCpu, PlacementCandidate, PlacementPolicy};
pub use registry::{ManagerStats, RoomRegistry, RoomStats};
pub use topology::{RoomKind, RoomTopology, Strategy, TopologyManager, TopologySnapshot};
pub use types::{ParticipantId, ProducerId, RoomId, RouterId, WorkerId};
pub use worker_pool::{exit_process, FatalHandler, WorkerPool};
