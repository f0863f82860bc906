//! Error types for the synchronization engine

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::action::{SessionId, SignatureId};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no published signature for baseline {0}")]
    SignatureUnavailable(SignatureId),

    #[error("delta stream is corrupt: {0}")]
    DeltaCorrupt(String),

    #[error("destination does not exist: {0}")]
    DestinationMissing(PathBuf),

    #[error("unknown data part: {0}")]
    UnknownPart(String),

    #[error("unknown session: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} already ended")]
    SessionEnded(SessionId),

    #[error("abort already requested for session {0}")]
    AbortInProgress(SessionId),

    #[error("session lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
