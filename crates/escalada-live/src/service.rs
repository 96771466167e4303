use std::sync::Arc;
use std::time::Duration;

use escalada_store::{
    AuditEvent, AuditQuery, BoxId, DynStore, FsStore, Provenance, SqliteStore, StoreError,
    now_millis,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backup::{BackupManager, BackupStatus};
use crate::broadcast::{Broadcaster, Channel, ServerMessage, StateSnapshot, Subscription};
use crate::command::{Command, CommandOutcome};
use crate::config::{LiveConfig, StorageBackend, StorageConfig};
use crate::error::{BackupError, CommandError, LiveError};
use crate::pipeline::CommandPipeline;
use crate::rate_limit::RateLimiter;
use crate::rules::RulesEngine;
use crate::run_blocking;
use crate::runtime::Registry;
use crate::settings::SettingsCell;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsStatus {
    pub server_time_ms: u64,
    pub storage: &'static str,
    pub boxes: usize,
    pub connections: usize,
    pub rate_limited_keys: usize,
    pub time_criterion_enabled: bool,
    pub backup: BackupStatus,
}

/// Owns every live component and their background tasks.
pub struct LiveService {
    config: LiveConfig,
    store: DynStore,
    registry: Arc<Registry>,
    rules: Arc<dyn RulesEngine>,
    broadcaster: Broadcaster,
    settings: Arc<SettingsCell>,
    limiter: Arc<RateLimiter>,
    pipeline: CommandPipeline,
    backups: Arc<BackupManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LiveService {
    /// Open the configured backend and build the service on top of it.
    pub async fn open(config: LiveConfig, rules: Arc<dyn RulesEngine>) -> Result<Self, LiveError> {
        let storage = config.storage.clone();
        let store = run_blocking(move || open_store(&storage)).await?;
        Self::with_store(config, store, rules).await
    }

    /// Populate the registry from `store`, honouring reset-on-start.
    pub async fn with_store(
        config: LiveConfig,
        store: DynStore,
        rules: Arc<dyn RulesEngine>,
    ) -> Result<Self, LiveError> {
        let reset = config.reset_boxes_on_start;
        let loader = Arc::clone(&store);
        let (states, settings) = run_blocking(move || {
            if reset {
                let removed = loader.clear_boxes()?;
                tracing::info!(removed, "reset persisted box states on start");
            }
            Ok((loader.load_all()?, loader.load_settings()?))
        })
        .await?;
        tracing::info!(boxes = states.len(), "box registry loaded");

        let registry = Arc::new(Registry::from_states(states));
        let broadcaster = Broadcaster::new(config.broadcast.clone());
        let settings = Arc::new(SettingsCell::new(settings));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let pipeline = CommandPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&rules),
            broadcaster.clone(),
            Arc::clone(&settings),
            Arc::clone(&limiter),
        );
        let backups = Arc::new(BackupManager::new(
            config.backup.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&rules),
            broadcaster.clone(),
            Arc::clone(&settings),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store,
            registry,
            rules,
            broadcaster,
            settings,
            limiter,
            pipeline,
            backups,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn settings(&self) -> &SettingsCell {
        &self.settings
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub async fn submit(
        &self,
        command: Command,
        provenance: Provenance,
    ) -> Result<CommandOutcome, CommandError> {
        self.pipeline.submit(command, provenance).await
    }

    /// Full snapshot of a box, creating it at version 0 if unknown.
    pub async fn snapshot(&self, box_id: BoxId) -> StateSnapshot {
        let state = self.registry.get_or_create(box_id).snapshot().await;
        StateSnapshot::of(&state, self.settings.time_criterion_enabled())
    }

    /// Public projections of every public box, ascending by id.
    pub async fn public_boxes(&self) -> Vec<StateSnapshot> {
        let tc = self.settings.time_criterion_enabled();
        self.registry
            .snapshot_all()
            .await
            .iter()
            .filter_map(|state| StateSnapshot::public(state, self.rules.as_ref(), tc))
            .collect()
    }

    /// Register a viewer and queue its first snapshot.
    ///
    /// Registration and the first snapshot happen under the box guard, so the
    /// viewer cannot miss or reorder an update. Returns `None` for a public
    /// channel on a box that is not public.
    pub async fn connect(&self, channel: Channel) -> Option<Subscription> {
        let box_id = channel.box_id();
        let tc = self.settings.time_criterion_enabled();
        let (state, snapshot) = match channel {
            Channel::Box(_) => {
                let state = self.registry.lock(box_id).await;
                let snapshot = StateSnapshot::of(&state, tc);
                (state, snapshot)
            }
            Channel::Public(_) => {
                let state = self.registry.get(box_id)?.lock().await;
                let snapshot = StateSnapshot::public(&state, self.rules.as_ref(), tc)?;
                (state, snapshot)
            }
        };
        let subscription = self.broadcaster.subscribe(channel);
        if let Err(err) = self.broadcaster.send_to(
            channel,
            subscription.id(),
            &ServerMessage::StateSnapshot(snapshot),
        ) {
            tracing::warn!(box_id, "initial snapshot not queued: {err}");
        }
        drop(state);
        Some(subscription)
    }

    /// Snapshot message for a single box, honouring the channel's projection.
    pub async fn snapshot_for(&self, channel: Channel) -> Option<ServerMessage> {
        let tc = self.settings.time_criterion_enabled();
        match channel {
            Channel::Box(box_id) => Some(ServerMessage::StateSnapshot(
                StateSnapshot::of(&self.registry.get_or_create(box_id).snapshot().await, tc),
            )),
            Channel::Public(box_id) => {
                let state = self.registry.snapshot(box_id).await?;
                StateSnapshot::public(&state, self.rules.as_ref(), tc)
                    .map(ServerMessage::StateSnapshot)
            }
        }
    }

    pub async fn list_audit(&self, query: AuditQuery) -> Result<Vec<AuditEvent>, StoreError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.list_audit(&query)).await
    }

    pub async fn ops_status(&self) -> Result<OpsStatus, BackupError> {
        Ok(OpsStatus {
            server_time_ms: now_millis(),
            storage: match self.config.storage.backend {
                StorageBackend::Files => "files",
                StorageBackend::Sqlite => "sqlite",
            },
            boxes: self.registry.len(),
            connections: self.broadcaster.total_connections(),
            rate_limited_keys: self.limiter.tracked_keys(),
            time_criterion_enabled: self.settings.time_criterion_enabled(),
            backup: self.backups.status().await?,
        })
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Periodic backups and rate-limiter cleanup; both stop on shutdown.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) = self.backups.spawn_periodic(self.shutdown_tx.subscribe()) {
            handles.push(handle);
        }

        let limiter = Arc::clone(&self.limiter);
        let period = self.config.rate_limit.cleanup_interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.cleanup(period.max(Duration::from_secs(60)));
                        if removed > 0 {
                            tracing::debug!(removed, "rate limiter cleanup");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
        handles
    }
}

/// Open the configured durable store.
pub fn open_store(config: &StorageConfig) -> Result<DynStore, StoreError> {
    let store: DynStore = match config.backend {
        StorageBackend::Files => {
            tracing::info!(dir = %config.dir.display(), "using file storage");
            Arc::new(FsStore::open(&config.dir)?.with_audit_rotation(config.max_audit_file_bytes))
        }
        StorageBackend::Sqlite => {
            tracing::info!(path = %config.sqlite_path.display(), "using sqlite storage");
            Arc::new(SqliteStore::open(&config.sqlite_path)?)
        }
    };
    Ok(store)
}
