//! validate → rate check → stale check → rules → persist → broadcast.

use std::sync::Arc;

use escalada_store::{
    AuditEvent, BoxId, BoxState, DynStore, Provenance, ResultStatus, Settings, StoreError,
    now_millis,
};
use serde_json::Value;

use crate::command::{Command, CommandOutcome, SET_TIME_CRITERION, StaleReason};
use crate::error::CommandError;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::rules::RulesEngine;
use crate::run_blocking;
use crate::runtime::{Exclusive, Registry};
use crate::settings::SettingsCell;
use crate::broadcast::Broadcaster;

#[derive(Clone)]
pub struct CommandPipeline {
    registry: Arc<Registry>,
    store: DynStore,
    rules: Arc<dyn RulesEngine>,
    broadcaster: Broadcaster,
    settings: Arc<SettingsCell>,
    limiter: Arc<RateLimiter>,
}

impl CommandPipeline {
    pub fn new(
        registry: Arc<Registry>,
        store: DynStore,
        rules: Arc<dyn RulesEngine>,
        broadcaster: Broadcaster,
        settings: Arc<SettingsCell>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            store,
            rules,
            broadcaster,
            settings,
            limiter,
        }
    }

    /// Run one command to a terminal outcome.
    ///
    /// Once validation and the rate check pass, the rest runs on its own task:
    /// dropping the returned future does not abandon a command half-applied.
    pub async fn submit(
        &self,
        command: Command,
        provenance: Provenance,
    ) -> Result<CommandOutcome, CommandError> {
        command.validate()?;

        let key = self
            .limiter
            .key_for(command.box_id, command.session_id.as_deref());
        if let RateDecision::Limited(reason) = self.limiter.check(&key, &command.kind) {
            if self.limiter.config().audit_throttled {
                let mut event = audit_event(
                    &command,
                    command.box_id,
                    ResultStatus::Throttled,
                    command.box_version.unwrap_or_default(),
                    provenance,
                );
                // Throttled commands never reached the box; the client may
                // retry under the same action id.
                event.action_id = None;
                self.append_audit(event).await;
            }
            return Ok(CommandOutcome::Throttled { reason });
        }

        let this = self.clone();
        let task = tokio::spawn(async move {
            if command.is_global() {
                return this.set_time_criterion(command, provenance).await;
            }
            let Some(box_id) = command.box_id else {
                return Err(CommandError::Validation("boxId is required".into()));
            };
            this.apply_to_box(box_id, command, provenance).await
        });
        task.await
            .map_err(|e| CommandError::Internal(format!("command task failed: {e}")))?
    }

    async fn apply_to_box(
        self,
        box_id: BoxId,
        command: Command,
        provenance: Provenance,
    ) -> Result<CommandOutcome, CommandError> {
        let registry = Arc::clone(&self.registry);
        registry
            .with_exclusive_access(box_id, move |current| async move {
                self.decide(current, command, provenance).await
            })
            .await
    }

    /// Body of the exclusive section for one box.
    async fn decide(
        &self,
        current: BoxState,
        command: Command,
        provenance: Provenance,
    ) -> Exclusive<Result<CommandOutcome, CommandError>> {
        let box_id = current.box_id;

        if let Some(reason) = stale_reason(&current, &command) {
            tracing::debug!(
                box_id,
                kind = %command.kind,
                current = current.box_version,
                claimed = ?command.box_version,
                reason = reason.as_str(),
                "command ignored"
            );
            let event = audit_event(
                &command,
                Some(box_id),
                ResultStatus::Ignored,
                current.box_version,
                provenance,
            );
            self.append_audit(event).await;
            return Exclusive::Keep(Ok(CommandOutcome::Ignored { reason }));
        }

        if let Some(action_id) = command.action_id.clone() {
            match self.recorded_outcome(box_id, action_id.clone()).await {
                Ok(None) => {}
                Ok(Some(ResultStatus::Accepted)) => {
                    tracing::debug!(box_id, %action_id, "action already applied");
                    return Exclusive::Keep(Ok(CommandOutcome::Ignored {
                        reason: StaleReason::DuplicateAction,
                    }));
                }
                Ok(Some(status)) => {
                    return Exclusive::Keep(Err(CommandError::Validation(format!(
                        "actionId '{action_id}' was already recorded as {}",
                        status.as_str()
                    ))));
                }
                Err(source) => {
                    return Exclusive::Keep(Err(CommandError::Persistence {
                        box_id: Some(box_id),
                        source,
                    }));
                }
            }
        }

        let state = match self.rules.apply(&current.state, &command) {
            Ok(state) => state,
            Err(rejection) => {
                tracing::debug!(box_id, kind = %command.kind, reason = %rejection.reason, "command rejected");
                let event = audit_event(
                    &command,
                    Some(box_id),
                    ResultStatus::Rejected,
                    current.box_version,
                    provenance,
                );
                self.append_audit(event).await;
                return Exclusive::Keep(Ok(CommandOutcome::Rejected {
                    reason: rejection.reason,
                    detail: rejection.detail,
                }));
            }
        };

        let next = BoxState {
            box_id,
            box_version: current.box_version + 1,
            session_id: command
                .session_id
                .clone()
                .unwrap_or_else(|| current.session_id.clone()),
            state,
        };
        let event = audit_event(
            &command,
            Some(box_id),
            ResultStatus::Accepted,
            next.box_version,
            provenance,
        );

        let store = Arc::clone(&self.store);
        let (previous, persisted) = (current, next.clone());
        if let Err(source) = run_blocking(move || store.commit(&previous, &persisted, &event)).await
        {
            tracing::error!(box_id, kind = %command.kind, "persist failed, command aborted: {source}");
            return Exclusive::Keep(Err(CommandError::Persistence {
                box_id: Some(box_id),
                source,
            }));
        }

        // Still under the box guard, so viewers see versions in order.
        let delivered = self.broadcaster.publish_state(
            &next,
            self.rules.as_ref(),
            self.settings.time_criterion_enabled(),
        );
        tracing::debug!(box_id, version = next.box_version, delivered, "command accepted");

        let new_version = next.box_version;
        Exclusive::Replace(next, Ok(CommandOutcome::accepted(new_version)))
    }

    /// Flip the process-wide time criterion and push fresh snapshots to every
    /// watched box.
    ///
    /// No box guard is taken on the caller's path. The push runs on its own
    /// task and takes each box's guard only to keep versions in order.
    async fn set_time_criterion(
        self,
        command: Command,
        provenance: Provenance,
    ) -> Result<CommandOutcome, CommandError> {
        let enabled = command
            .payload
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                CommandError::Validation(format!("{SET_TIME_CRITERION} requires 'enabled'"))
            })?;

        let _update = self.settings.begin_update().await;
        let previous = self.settings.get();
        let next = Settings {
            time_criterion_enabled: enabled,
            ..previous.clone()
        };
        let event = audit_event(&command, None, ResultStatus::Accepted, 0, provenance);

        let store = Arc::clone(&self.store);
        let persisted = next.clone();
        run_blocking(move || {
            store.save_settings(&persisted)?;
            if let Err(err) = store.append_audit(&event) {
                if let Err(undo) = store.save_settings(&previous) {
                    tracing::error!("failed to undo settings write: {undo}");
                }
                return Err(err);
            }
            Ok(())
        })
        .await
        .map_err(|source| {
            tracing::error!("persist settings failed: {source}");
            CommandError::Persistence {
                box_id: None,
                source,
            }
        })?;

        self.settings.set(next);
        tracing::info!(enabled, "time criterion updated");

        tokio::spawn(self.clone().push_settings());
        Ok(CommandOutcome::Accepted { new_version: None })
    }

    async fn push_settings(self) {
        for box_id in self.broadcaster.watched_boxes() {
            let Some(runtime) = self.registry.get(box_id) else {
                continue;
            };
            let state = runtime.lock().await;
            // Read under the guard so a later change is never overwritten.
            let enabled = self.settings.time_criterion_enabled();
            self.broadcaster
                .publish_state(&state, self.rules.as_ref(), enabled);
        }
    }

    async fn recorded_outcome(
        &self,
        box_id: BoxId,
        action_id: String,
    ) -> Result<Option<ResultStatus>, StoreError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.audit_outcome(Some(box_id), &action_id)).await
    }

    /// Audit writes for non-accepted outcomes are best effort.
    async fn append_audit(&self, event: AuditEvent) {
        let store = Arc::clone(&self.store);
        let box_id = event.box_id;
        if let Err(err) = run_blocking(move || store.append_audit(&event)).await {
            tracing::warn!(?box_id, "audit append failed: {err}");
        }
    }
}

fn stale_reason(current: &BoxState, command: &Command) -> Option<StaleReason> {
    if command.box_version != Some(current.box_version) {
        return Some(StaleReason::StaleVersion);
    }
    let owned = !current.session_id.is_empty();
    if owned && !command.takeover && command.session_id.as_deref() != Some(&current.session_id) {
        return Some(StaleReason::SessionMismatch);
    }
    None
}

fn audit_event(
    command: &Command,
    box_id: Option<BoxId>,
    status: ResultStatus,
    box_version: u64,
    provenance: Provenance,
) -> AuditEvent {
    AuditEvent {
        id: uuid::Uuid::new_v4().to_string(),
        created_at_ms: now_millis(),
        box_id,
        action_id: command.action_id.clone(),
        session_id: command.session_id.clone().unwrap_or_default(),
        action: command.kind.clone(),
        payload: (!command.payload.is_null()).then(|| command.payload.clone()),
        result_status: status,
        box_version,
        provenance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned_box(version: u64, session: &str) -> BoxState {
        BoxState {
            box_id: 1,
            box_version: version,
            session_id: session.into(),
            state: json!({}),
        }
    }

    #[test]
    fn version_mismatch_is_stale() {
        let cmd = Command::new(1, 2, "X", json!({})).with_session("s");
        assert_eq!(
            stale_reason(&owned_box(3, "s"), &cmd),
            Some(StaleReason::StaleVersion)
        );
        assert_eq!(stale_reason(&owned_box(2, "s"), &cmd), None);
    }

    #[test]
    fn foreign_session_needs_takeover() {
        let mut cmd = Command::new(1, 2, "X", json!({})).with_session("new");
        assert_eq!(
            stale_reason(&owned_box(2, "old"), &cmd),
            Some(StaleReason::SessionMismatch)
        );
        cmd.takeover = true;
        assert_eq!(stale_reason(&owned_box(2, "old"), &cmd), None);
        // An unowned box accepts any session.
        cmd.takeover = false;
        assert_eq!(stale_reason(&owned_box(2, ""), &cmd), None);
    }
}
