//! Snapshots, backup files, restore and the non-destructive restore drill.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use escalada_store::{
    AuditEvent, BoxId, BoxState, DynStore, MemStore, Provenance, ResultStatus, Store, StoreError,
    StoreResult, now_millis, write_atomic,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::Broadcaster;
use crate::config::BackupConfig;
use crate::error::{BackupError, backup_io};
use crate::rules::RulesEngine;
use crate::run_blocking;
use crate::runtime::{Exclusive, Registry};
use crate::settings::SettingsCell;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_SUFFIX: &str = ".json";

fn current_format() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

/// Detached, self-describing capture of one or more boxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    #[serde(default = "current_format")]
    pub format_version: u32,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(alias = "snapshots")]
    pub boxes: Vec<BoxState>,
}

impl SnapshotDocument {
    pub fn new(boxes: Vec<BoxState>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at_ms: now_millis(),
            boxes,
        }
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        if self.format_version == 0 || self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(BackupError::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        let mut seen = BTreeSet::new();
        for state in &self.boxes {
            if !seen.insert(state.box_id) {
                return Err(BackupError::InvalidSnapshot(format!(
                    "box {} appears more than once",
                    state.box_id
                )));
            }
        }
        Ok(())
    }

    fn select(self, box_ids: Option<&[BoxId]>) -> Vec<BoxState> {
        match box_ids {
            Some(ids) => self
                .boxes
                .into_iter()
                .filter(|state| ids.contains(&state.box_id))
                .collect(),
            None => self.boxes,
        }
    }
}

/// A backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub path: PathBuf,
    pub file_name: String,
    pub created_at_ms: u64,
}

impl BackupFile {
    fn from_path(path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_string();
        let created_at_ms = file_name
            .strip_prefix(BACKUP_PREFIX)?
            .strip_suffix(BACKUP_SUFFIX)?
            .parse()
            .ok()?;
        Some(Self {
            path,
            file_name,
            created_at_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Restored,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub box_id: BoxId,
    pub status: RestoreStatus,
    pub snapshot_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DrillSource {
    Live,
    Snapshot(SnapshotDocument),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrillAction {
    Create,
    Overwrite,
    Unchanged,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillBox {
    pub box_id: BoxId,
    pub action: DrillAction,
    pub snapshot_version: u64,
    pub live_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillReport {
    pub source: &'static str,
    pub boxes: usize,
    pub would_create: usize,
    pub would_overwrite: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub results: Vec<DrillBox>,
    /// Snapshot survived serialize → restore into a scratch store → reload
    /// with identical content hashes.
    pub round_trip_ok: bool,
    pub round_trip_mismatches: Vec<BoxId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<BackupFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub dir: PathBuf,
    pub last_file: Option<String>,
    pub last_created_at_ms: Option<u64>,
    pub age_ms: Option<u64>,
    pub retention_files: usize,
    pub interval_sec: Option<u64>,
}

pub struct BackupManager {
    config: BackupConfig,
    registry: Arc<Registry>,
    store: DynStore,
    rules: Arc<dyn RulesEngine>,
    broadcaster: Broadcaster,
    settings: Arc<SettingsCell>,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        registry: Arc<Registry>,
        store: DynStore,
        rules: Arc<dyn RulesEngine>,
        broadcaster: Broadcaster,
        settings: Arc<SettingsCell>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            rules,
            broadcaster,
            settings,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub async fn export_box(&self, box_id: BoxId) -> Result<SnapshotDocument, BackupError> {
        let state = self
            .registry
            .snapshot(box_id)
            .await
            .ok_or(BackupError::UnknownBox(box_id))?;
        Ok(SnapshotDocument::new(vec![state]))
    }

    pub async fn export_all(&self) -> SnapshotDocument {
        SnapshotDocument::new(self.registry.snapshot_all().await)
    }

    /// Export every box to a new backup file and prune old ones.
    pub async fn backup_now(&self) -> Result<BackupFile, BackupError> {
        let doc = self.export_all().await;
        let boxes = doc.boxes.len();
        let file = self.write_backup_file(doc).await?;
        tracing::info!(file = %file.file_name, boxes, "backup written");

        let dir = self.config.dir.clone();
        let retention = self.config.retention_files;
        let removed = join_blocking(move || prune_backups(&dir, retention)).await?;
        if removed > 0 {
            tracing::debug!(removed, "pruned old backups");
        }
        Ok(file)
    }

    /// Write `doc` as a new backup file. Existing files are left alone.
    pub async fn write_backup_file(&self, doc: SnapshotDocument) -> Result<BackupFile, BackupError> {
        let dir = self.config.dir.clone();
        join_blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| backup_io(&dir, e))?;
            let bytes = serde_json::to_vec_pretty(&doc)?;
            // Stamps stay strictly increasing so pruning never drops the newest file.
            let newest = list_backup_files(&dir)?
                .first()
                .map_or(0, |f| f.created_at_ms + 1);
            let mut stamp = doc.created_at_ms.max(newest).max(1);
            let mut path = backup_path(&dir, stamp);
            while path.exists() {
                stamp += 1;
                path = backup_path(&dir, stamp);
            }
            write_atomic(&path, &bytes)?;
            BackupFile::from_path(path.clone())
                .ok_or_else(|| BackupError::InvalidSnapshot(format!("bad backup name {path:?}")))
        })
        .await
    }

    /// Backup files, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupFile>, BackupError> {
        let dir = self.config.dir.clone();
        join_blocking(move || list_backup_files(&dir)).await
    }

    pub async fn latest_backup(&self) -> Result<Option<BackupFile>, BackupError> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    pub async fn load_backup_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<SnapshotDocument, BackupError> {
        let path = path.as_ref().to_path_buf();
        join_blocking(move || {
            let bytes = fs::read(&path).map_err(|e| backup_io(&path, e))?;
            let doc: SnapshotDocument = serde_json::from_slice(&bytes)?;
            doc.validate()?;
            Ok(doc)
        })
        .await
    }

    /// Replace each box in the snapshot under its own guard.
    ///
    /// Versions are kept verbatim. A box whose live version is newer than the
    /// snapshot is reported as a conflict and left alone; other boxes still
    /// restore.
    pub async fn restore(&self, doc: SnapshotDocument) -> Result<Vec<RestoreResult>, BackupError> {
        doc.validate()?;
        let mut results = Vec::with_capacity(doc.boxes.len());
        for snapshot in doc.boxes {
            results.push(self.restore_box(snapshot).await);
        }
        let restored = results
            .iter()
            .filter(|r| r.status == RestoreStatus::Restored)
            .count();
        tracing::info!(restored, total = results.len(), "restore finished");
        Ok(results)
    }

    async fn restore_box(&self, snapshot: BoxState) -> RestoreResult {
        let box_id = snapshot.box_id;
        let snapshot_version = snapshot.box_version;
        let result = move |status, live_version, error| RestoreResult {
            box_id,
            status,
            snapshot_version,
            live_version,
            error,
        };

        self.registry
            .with_exclusive_access(box_id, |current| async move {
                if current.box_version > snapshot_version {
                    tracing::warn!(
                        box_id,
                        live = current.box_version,
                        snapshot = snapshot_version,
                        "restore conflict"
                    );
                    return Exclusive::Keep(result(
                        RestoreStatus::Conflict,
                        Some(current.box_version),
                        Some("live state is newer than snapshot".into()),
                    ));
                }

                let store = Arc::clone(&self.store);
                let persisted = snapshot.clone();
                match run_blocking(move || store.save(&persisted)).await {
                    Ok(()) => {}
                    Err(StoreError::VersionConflict { stored, .. }) => {
                        return Exclusive::Keep(result(
                            RestoreStatus::Conflict,
                            Some(stored),
                            Some("stored state is newer than snapshot".into()),
                        ));
                    }
                    Err(err) => {
                        tracing::error!(box_id, "restore persist failed: {err}");
                        return Exclusive::Keep(result(
                            RestoreStatus::Failed,
                            Some(current.box_version),
                            Some(err.to_string()),
                        ));
                    }
                }

                self.audit_restore(box_id, snapshot_version).await;
                self.broadcaster.publish_state(
                    &snapshot,
                    self.rules.as_ref(),
                    self.settings.time_criterion_enabled(),
                );
                Exclusive::Replace(
                    snapshot,
                    result(RestoreStatus::Restored, Some(current.box_version), None),
                )
            })
            .await
    }

    async fn audit_restore(&self, box_id: BoxId, box_version: u64) {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now_millis(),
            box_id: Some(box_id),
            action_id: None,
            session_id: String::new(),
            action: "RESTORE".into(),
            payload: None,
            result_status: ResultStatus::Accepted,
            box_version,
            provenance: Provenance::default(),
        };
        let store = Arc::clone(&self.store);
        if let Err(err) = run_blocking(move || store.append_audit(&event)).await {
            tracing::warn!(box_id, "restore audit append failed: {err}");
        }
    }

    /// Simulate a restore. Reads the live registry and the source only; the
    /// durable store and live runtimes are never written.
    pub async fn drill(
        &self,
        source: DrillSource,
        box_ids: Option<&[BoxId]>,
        write_backup_file: bool,
    ) -> Result<DrillReport, BackupError> {
        let (source_name, doc) = match source {
            DrillSource::Live => ("live", self.export_all().await),
            DrillSource::Snapshot(doc) => {
                doc.validate()?;
                ("snapshot", doc)
            }
        };
        let backup_file = if write_backup_file {
            Some(self.write_backup_file(doc.clone()).await?)
        } else {
            None
        };
        let selected = doc.select(box_ids);

        let mut results = Vec::with_capacity(selected.len());
        for snapshot in &selected {
            let live = self.registry.snapshot(snapshot.box_id).await;
            let action = match &live {
                None => DrillAction::Create,
                Some(live) if live.box_version > snapshot.box_version => DrillAction::Conflict,
                Some(live) if live.content_hash() == snapshot.content_hash() => {
                    DrillAction::Unchanged
                }
                Some(_) => DrillAction::Overwrite,
            };
            results.push(DrillBox {
                box_id: snapshot.box_id,
                action,
                snapshot_version: snapshot.box_version,
                live_version: live.map(|l| l.box_version),
            });
        }

        let round_trip_mismatches = run_blocking(move || round_trip(&selected)).await?;
        let count = |action| results.iter().filter(|r| r.action == action).count();
        let report = DrillReport {
            source: source_name,
            boxes: results.len(),
            would_create: count(DrillAction::Create),
            would_overwrite: count(DrillAction::Overwrite),
            unchanged: count(DrillAction::Unchanged),
            conflicts: count(DrillAction::Conflict),
            round_trip_ok: round_trip_mismatches.is_empty(),
            round_trip_mismatches,
            results,
            backup_file,
        };
        tracing::info!(
            source = source_name,
            boxes = report.boxes,
            conflicts = report.conflicts,
            round_trip_ok = report.round_trip_ok,
            "drill finished"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<BackupStatus, BackupError> {
        let last = self.latest_backup().await?;
        let now = now_millis();
        Ok(BackupStatus {
            dir: self.config.dir.clone(),
            last_file: last.as_ref().map(|f| f.file_name.clone()),
            last_created_at_ms: last.as_ref().map(|f| f.created_at_ms),
            age_ms: last.as_ref().map(|f| now.saturating_sub(f.created_at_ms)),
            retention_files: self.config.retention_files,
            interval_sec: self.config.interval.map(|d| d.as_secs()),
        })
    }

    /// Periodic backups until `shutdown` fires. `None` when disabled.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let period = self.config.interval?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = this.backup_now().await {
                            tracing::error!("periodic backup failed: {err}");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("backup task stopped");
        }))
    }
}

fn backup_path(dir: &Path, stamp: u64) -> PathBuf {
    dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"))
}

fn list_backup_files(dir: &Path) -> Result<Vec<BackupFile>, BackupError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(backup_io(dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| backup_io(dir, e))?;
        if let Some(file) = BackupFile::from_path(entry.path()) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    Ok(files)
}

fn prune_backups(dir: &Path, keep: usize) -> Result<usize, BackupError> {
    let files = list_backup_files(dir)?;
    let mut removed = 0;
    for file in files.into_iter().skip(keep.max(1)) {
        fs::remove_file(&file.path).map_err(|e| backup_io(&file.path, e))?;
        removed += 1;
    }
    Ok(removed)
}

/// Encode, decode, restore into a scratch store and reload; returns boxes
/// whose hash changed on the way.
fn round_trip(boxes: &[BoxState]) -> StoreResult<Vec<BoxId>> {
    let encoded = serde_json::to_vec(&SnapshotDocument::new(boxes.to_vec()))?;
    let decoded: SnapshotDocument = serde_json::from_slice(&encoded)?;
    let scratch = MemStore::new();
    for state in &decoded.boxes {
        scratch.save(state)?;
    }
    let mut mismatches = Vec::new();
    for original in boxes {
        let reloaded = scratch.load(original.box_id)?;
        if reloaded.map(|s| s.content_hash()) != Some(original.content_hash()) {
            mismatches.push(original.box_id);
        }
    }
    Ok(mismatches)
}

async fn join_blocking<T, F>(f: F) -> Result<T, BackupError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Store(StoreError::Unavailable(format!("blocking task: {e}"))))?
}
