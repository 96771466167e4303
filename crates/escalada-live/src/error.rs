use std::path::PathBuf;

use escalada_store::{BoxId, StoreError};
use thiserror::Error;

use crate::broadcast::ConnectionId;

/// Hard failures of a single command. Stale, rules-rejected and throttled
/// commands are outcomes, not errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    Validation(String),
    /// `box_id` is `None` for the global settings command.
    #[error("failed to persist command: {source}")]
    Persistence {
        box_id: Option<BoxId>,
        #[source]
        source: StoreError,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("connection {0} outbound queue is full")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("no backup found in {0:?}")]
    NoBackup(PathBuf),
    #[error("box {0} does not exist")]
    UnknownBox(BoxId),
}

pub(crate) fn backup_io(path: impl Into<PathBuf>, source: std::io::Error) -> BackupError {
    BackupError::Io {
        path: path.into(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("role {role} may not access box {box_id}")]
    Forbidden { role: String, box_id: BoxId },
    #[error("role {0} is not allowed here")]
    WrongRole(String),
}

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("config error: {0}")]
    Config(String),
}
