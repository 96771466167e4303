//! Live state sync for competition boxes: per-box runtimes, the command
//! pipeline, realtime fan-out, and backup/restore on top of `escalada-store`.

pub mod auth;
pub mod backup;
pub mod broadcast;
pub mod command;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod rate_limit;
pub mod rules;
pub mod runtime;
pub mod service;
pub mod settings;

pub use auth::{Authorizer, Claims, Role, StaticTokens};
pub use backup::{BackupManager, DrillSource, SnapshotDocument};
pub use broadcast::{Broadcaster, Channel, ClientMessage, ServerMessage, StateSnapshot};
pub use command::{Command, CommandOutcome, StaleReason};
pub use config::LiveConfig;
pub use error::{AuthError, BackupError, BroadcastError, CommandError, LiveError};
pub use rules::{MergeRules, RulesEngine, RulesRejection};
pub use runtime::{BoxRuntime, Exclusive, Registry};
pub use service::LiveService;

use escalada_store::{StoreError, StoreResult};

/// Run a synchronous store call off the async workers.
pub(crate) async fn run_blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task: {e}")))?
}
