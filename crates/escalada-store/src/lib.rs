//! Durable storage for live box state and the command audit log, with
//! filesystem, SQLite and in-memory backends.
//!
//! All backends assume a single writing process. Nothing here enforces that;
//! running two servers against the same directory or database file is an
//! operational error.

mod fs_store;
mod mem_store;
mod sqlite_store;

pub use fs_store::{FsStore, write_atomic};
pub use mem_store::MemStore;
pub use sqlite_store::SqliteStore;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{io, path::PathBuf, sync::Arc};

pub type BoxId = u32;
pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn Store>;

/// Authoritative state of one box as persisted and as held by the live registry.
///
/// `state` is produced and consumed by the rules engine only; storage never
/// looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxState {
    pub box_id: BoxId,
    #[serde(default)]
    pub box_version: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(default = "empty_object")]
    pub state: serde_json::Value,
}

impl BoxState {
    /// Fresh box at version 0 with no session of record.
    pub fn new(box_id: BoxId) -> Self {
        Self {
            box_id,
            box_version: 0,
            session_id: String::new(),
            state: empty_object(),
        }
    }

    /// Hex SHA-256 over the JSON encoding. Object keys serialize in sorted
    /// order, so equal states always hash equally.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Accepted,
    Ignored,
    Rejected,
    Throttled,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Accepted => "accepted",
            ResultStatus::Ignored => "ignored",
            ResultStatus::Rejected => "rejected",
            ResultStatus::Throttled => "throttled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accepted" => Some(ResultStatus::Accepted),
            "ignored" => Some(ResultStatus::Ignored),
            "rejected" => Some(ResultStatus::Rejected),
            "throttled" => Some(ResultStatus::Throttled),
            _ => None,
        }
    }
}

/// Who sent a command and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_user_agent: Option<String>,
}

/// One append-only audit record. `(box_id, action_id)` is unique when
/// `action_id` is present; a second append with the same pair is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub created_at_ms: u64,
    pub box_id: Option<BoxId>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub result_status: ResultStatus,
    #[serde(default)]
    pub box_version: u64,
    #[serde(flatten)]
    pub provenance: Provenance,
}

impl AuditEvent {
    pub fn dedup_key(&self) -> Option<(Option<BoxId>, String)> {
        self.action_id
            .as_ref()
            .map(|action_id| (self.box_id, action_id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Duplicate,
}

pub const DEFAULT_AUDIT_LIMIT: usize = 200;
pub const MAX_AUDIT_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub box_id: Option<BoxId>,
    pub limit: usize,
    pub include_payload: bool,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            box_id: None,
            limit: DEFAULT_AUDIT_LIMIT,
            include_payload: false,
        }
    }
}

impl AuditQuery {
    pub fn for_box(box_id: BoxId) -> Self {
        Self {
            box_id: Some(box_id),
            ..Self::default()
        }
    }

    /// Limit clamped to `1..=MAX_AUDIT_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_AUDIT_LIMIT)
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.box_id.is_none() || event.box_id == self.box_id
    }

    fn shape(&self, mut event: AuditEvent) -> AuditEvent {
        if !self.include_payload {
            event.payload = None;
        }
        event
    }
}

/// Process-wide settings that live outside any box.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub time_criterion_enabled: bool,
}

/// Durable store contract shared by every backend.
pub trait Store: Send + Sync {
    /// Every persisted box, ordered by box id.
    fn load_all(&self) -> StoreResult<Vec<BoxState>>;
    fn load(&self, box_id: BoxId) -> StoreResult<Option<BoxState>>;
    /// Replace a box's persisted state. Readers never observe a partial write.
    fn save(&self, state: &BoxState) -> StoreResult<()>;
    /// Delete one box's persisted state; `false` when there was none.
    fn remove(&self, box_id: BoxId) -> StoreResult<bool>;
    fn append_audit(&self, event: &AuditEvent) -> StoreResult<AppendOutcome>;
    /// Status already recorded for `(box_id, action_id)`, if any.
    fn audit_outcome(
        &self,
        box_id: Option<BoxId>,
        action_id: &str,
    ) -> StoreResult<Option<ResultStatus>>;
    /// Most recent first.
    fn list_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>>;
    /// Delete every persisted box state; the audit log is kept.
    fn clear_boxes(&self) -> StoreResult<usize>;
    fn load_settings(&self) -> StoreResult<Settings>;
    fn save_settings(&self, settings: &Settings) -> StoreResult<()>;

    /// Persist an accepted command: the new state plus its audit record.
    ///
    /// Fails with `DuplicateAction` when the event's key is already recorded,
    /// so the state never moves without an audit row of its own. Backends
    /// without transactions write the state first and undo it if the append
    /// does not go through: `previous` is written back, or the file removed
    /// when the box had never been persisted.
    fn commit(&self, previous: &BoxState, next: &BoxState, event: &AuditEvent) -> StoreResult<()> {
        let persisted = self.load(next.box_id)?.is_some();
        self.save(next)?;
        let err = match self.append_audit(event) {
            Ok(AppendOutcome::Appended) => return Ok(()),
            Ok(AppendOutcome::Duplicate) => duplicate_action(event),
            Err(err) => err,
        };
        let undo = if persisted {
            self.save(previous)
        } else {
            self.remove(next.box_id).map(|_| ())
        };
        if let Err(undo) = undo {
            tracing::error!(
                box_id = next.box_id,
                "failed to undo state write after audit failure: {undo}"
            );
        }
        Err(err)
    }
}

pub(crate) fn duplicate_action(event: &AuditEvent) -> StoreError {
    StoreError::DuplicateAction {
        box_id: event.box_id,
        action_id: event.action_id.clone().unwrap_or_default(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record in {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("box {box_id}: stored version {stored} is newer than {attempted}")]
    VersionConflict {
        box_id: BoxId,
        stored: u64,
        attempted: u64,
    },
    #[error("action {action_id:?} on box {box_id:?} is already recorded")]
    DuplicateAction {
        box_id: Option<BoxId>,
        action_id: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
