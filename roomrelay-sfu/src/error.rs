use crate::engine::EngineError;
use crate::types::{ParticipantId, ProducerId, RoomId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room already exists: {0}")]
    RoomAlreadyExists(RoomId),

    #[error("Participant {participant_id} has no router assignment in room {room_id}")]
    ParticipantNotAssigned {
        room_id: RoomId,
        participant_id: ParticipantId,
    },

    #[error("Failed to create router {index} for room {room_id}: {source}")]
    RouterCreationFailed {
        room_id: RoomId,
        index: usize,
        #[source]
        source: EngineError,
    },

    #[error("Router index {index} out of range for room {room_id} ({router_count} routers)")]
    RouterIndexOutOfRange {
        room_id: RoomId,
        index: usize,
        router_count: usize,
    },

    #[error("Failed to forward producer {producer_id} to router {target_index}: {source}")]
    ForwardCreationFailed {
        producer_id: ProducerId,
        target_index: usize,
        #[source]
        source: EngineError,
    },

    #[error("Handle closed: {0}")]
    HandleClosed(String),

    #[error("Failed to start worker {index}: {source}")]
    WorkerSpawnFailed {
        index: usize,
        #[source]
        source: EngineError,
    },

    #[error("Worker {index} (pid {pid}) died: {reason}")]
    WorkerDied {
        index: usize,
        pid: u32,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
