//! Inbound commands and the outcomes returned to their callers.

use escalada_store::BoxId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// The one command type that is not scoped to a box.
pub const SET_TIME_CRITERION: &str = "SET_TIME_CRITERION";

const MAX_TYPE_LEN: usize = 64;
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default)]
    pub box_id: Option<BoxId>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Version the client believes is current.
    #[serde(default)]
    pub box_version: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Client-supplied idempotency key.
    #[serde(default)]
    pub action_id: Option<String>,
    /// Take over the session of record instead of being refused as stale.
    #[serde(default)]
    pub takeover: bool,
}

impl Command {
    pub fn new(box_id: BoxId, box_version: u64, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            box_id: Some(box_id),
            session_id: None,
            box_version: Some(box_version),
            kind: kind.into(),
            payload,
            action_id: None,
            takeover: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn is_global(&self) -> bool {
        self.kind == SET_TIME_CRITERION
    }

    /// Shape checks that run before any lock is taken.
    pub fn validate(&self) -> Result<(), CommandError> {
        let invalid = |msg: String| Err(CommandError::Validation(msg));

        if self.kind.is_empty() || self.kind.len() > MAX_TYPE_LEN {
            return invalid(format!("type must be 1..={MAX_TYPE_LEN} characters"));
        }
        if !self
            .kind
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return invalid(format!("type '{}' is not an UPPER_SNAKE identifier", self.kind));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return invalid("payload must be an object".into());
        }
        for (name, value) in [("sessionId", &self.session_id), ("actionId", &self.action_id)] {
            if let Some(value) = value {
                if value.is_empty() || value.len() > MAX_ID_LEN {
                    return invalid(format!("{name} must be 1..={MAX_ID_LEN} characters"));
                }
            }
        }

        if self.is_global() {
            if !self.payload.get("enabled").is_some_and(Value::is_boolean) {
                return invalid(format!("{SET_TIME_CRITERION} requires a boolean 'enabled'"));
            }
            return Ok(());
        }
        if self.box_id.is_none() {
            return invalid("boxId is required".into());
        }
        if self.box_version.is_none() {
            return invalid("boxVersion is required".into());
        }
        Ok(())
    }
}

/// Why a command was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    StaleVersion,
    SessionMismatch,
    /// The action id was already applied to this box.
    DuplicateAction,
}

impl StaleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StaleReason::StaleVersion => "stale_version",
            StaleReason::SessionMismatch => "session_mismatch",
            StaleReason::DuplicateAction => "duplicate_action",
        }
    }
}

/// Result of a command that did not fail outright.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CommandOutcome {
    Accepted {
        /// Absent for the global settings command.
        #[serde(skip_serializing_if = "Option::is_none")]
        new_version: Option<u64>,
    },
    Ignored {
        reason: StaleReason,
    },
    Rejected {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    Throttled {
        reason: String,
    },
}

impl CommandOutcome {
    pub fn accepted(new_version: u64) -> Self {
        CommandOutcome::Accepted {
            new_version: Some(new_version),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted { .. })
    }
}
