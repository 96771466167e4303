//! Seam to the external rules engine. The live layer never looks inside box
//! state; everything it needs to know about the contents goes through here.

use serde::Serialize;
use serde_json::Value;

use crate::command::Command;

/// Structured refusal from the rules engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RulesRejection {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl RulesRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: None,
        }
    }
}

/// Pure, deterministic transition function over opaque box state.
pub trait RulesEngine: Send + Sync {
    fn apply(&self, state: &Value, command: &Command) -> Result<Value, RulesRejection>;

    /// Whether the box may be shown on the public read-only channel.
    fn is_public(&self, state: &Value) -> bool {
        state
            .get("initiated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Projection of a public box for spectators.
    fn public_view(&self, state: &Value) -> Value {
        state.clone()
    }
}

/// Stand-in engine for running the daemon without a real rules
/// implementation: object payloads are shallow-merged into the state, and a
/// `null` member removes the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeRules;

impl RulesEngine for MergeRules {
    fn apply(&self, state: &Value, command: &Command) -> Result<Value, RulesRejection> {
        let mut next = match state {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            _ => return Err(RulesRejection::new("state is not an object")),
        };
        match &command.payload {
            Value::Null => {}
            Value::Object(patch) => {
                for (key, value) in patch {
                    if value.is_null() {
                        next.remove(key);
                    } else {
                        next.insert(key.clone(), value.clone());
                    }
                }
            }
            _ => return Err(RulesRejection::new("payload must be an object")),
        }
        Ok(Value::Object(next))
    }
}
