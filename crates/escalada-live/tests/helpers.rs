//! Shared test helpers for integration tests.
//!
//! Each integration test compiles this module separately, so some functions may appear
//! unused in certain test contexts but are used by others.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use escalada_live::config::LiveConfig;
use escalada_live::{Command, LiveService, RulesEngine, RulesRejection};
use escalada_store::{DynStore, MemStore, Provenance};
use serde_json::{Value, json};

/// Counts accepted commands in `count`; `FAIL` is always refused and
/// `START` makes the box public.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterRules;

impl RulesEngine for CounterRules {
    fn apply(&self, state: &Value, command: &Command) -> Result<Value, RulesRejection> {
        if command.kind == "FAIL" {
            return Err(RulesRejection {
                reason: "refused".into(),
                detail: Some(json!({ "kind": "FAIL" })),
            });
        }
        let mut next = state.as_object().cloned().unwrap_or_default();
        let count = next.get("count").and_then(Value::as_u64).unwrap_or(0);
        next.insert("count".into(), json!(count + 1));
        if command.kind == "START" {
            next.insert("initiated".into(), json!(true));
        }
        Ok(Value::Object(next))
    }
}

/// Config rooted in `dir` with rate limiting off and boxes kept on start.
pub fn test_config(dir: &Path) -> LiveConfig {
    let mut config = LiveConfig::default();
    config.storage.dir = dir.join("data");
    config.storage.sqlite_path = dir.join("data").join("escalada.db");
    config.backup.dir = dir.join("backups");
    config.backup.interval = None;
    config.reset_boxes_on_start = false;
    config.rate_limit.enabled = false;
    config
}

pub async fn service_with(config: LiveConfig, store: DynStore) -> Arc<LiveService> {
    Arc::new(
        LiveService::with_store(config, store, Arc::new(CounterRules))
            .await
            .expect("build service"),
    )
}

/// Service over an in-memory store; the returned handle shares its state.
pub async fn mem_service(dir: &Path) -> (Arc<LiveService>, MemStore) {
    let store = MemStore::new();
    let service = service_with(test_config(dir), Arc::new(store.clone())).await;
    (service, store)
}

pub fn judge() -> Provenance {
    Provenance {
        actor_username: Some("judge-1".into()),
        actor_role: Some("judge".into()),
        ..Provenance::default()
    }
}

pub fn step(box_id: u32, version: u64, action_id: &str) -> Command {
    Command::new(box_id, version, "STEP", json!({}))
        .with_session("s1")
        .with_action_id(action_id)
}

pub fn time_criterion(enabled: bool) -> Command {
    Command {
        box_id: None,
        session_id: None,
        box_version: None,
        kind: "SET_TIME_CRITERION".into(),
        payload: json!({ "enabled": enabled }),
        action_id: None,
        takeover: false,
    }
}

pub fn decode(raw: &str) -> Value {
    serde_json::from_str(raw).expect("server message is json")
}
