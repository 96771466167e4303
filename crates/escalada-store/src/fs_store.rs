use crate::{
    AppendOutcome, AuditEvent, AuditQuery, BoxId, BoxState, ResultStatus, Settings, Store,
    StoreError, StoreResult, io_error, now_millis,
};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

const BOXES_DIR: &str = "boxes";
const AUDIT_FILE: &str = "events.ndjson";
const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_MAX_AUDIT_BYTES: u64 = 50 * 1024 * 1024;

type DedupKey = (Option<BoxId>, String);

/// Filesystem-backed store rooted at a storage directory:
///
/// - `boxes/<box_id>.json`: one file per box, replaced via write-to-temp + rename
/// - `events.ndjson`: append-only audit log, rotated to `events.<millis>.ndjson`
/// - `settings.json`: process-wide settings
pub struct FsStore {
    root: PathBuf,
    boxes_dir: PathBuf,
    max_audit_bytes: u64,
    /// Dedup index: recorded status per `(box_id, action_id)`.
    audit: Mutex<HashMap<DedupKey, ResultStatus>>,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("root", &self.root)
            .field("max_audit_bytes", &self.max_audit_bytes)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let boxes_dir = root.join(BOXES_DIR);
        fs::create_dir_all(&boxes_dir).map_err(|e| io_error(&boxes_dir, e))?;
        let store = Self {
            root,
            boxes_dir,
            max_audit_bytes: DEFAULT_MAX_AUDIT_BYTES,
            audit: Mutex::new(HashMap::new()),
        };
        let mut seen = HashMap::new();
        for path in store.audit_files()? {
            for event in read_audit_file(&path)? {
                if let Some(key) = event.dedup_key() {
                    seen.entry(key).or_insert(event.result_status);
                }
            }
        }
        *store.audit.lock().unwrap_or_else(PoisonError::into_inner) = seen;
        Ok(store)
    }

    /// Rotate the audit log once it reaches `bytes`.
    pub fn with_audit_rotation(mut self, bytes: u64) -> Self {
        self.max_audit_bytes = bytes.max(1);
        self
    }

    fn box_path(&self, box_id: BoxId) -> PathBuf {
        self.boxes_dir.join(format!("{box_id}.json"))
    }

    fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    /// Rotated files oldest first, then the live file.
    fn audit_files(&self) -> StoreResult<Vec<PathBuf>> {
        let mut rotated = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("events.") && name.ends_with(".ndjson") && name != AUDIT_FILE {
                rotated.push(entry.path());
            }
        }
        rotated.sort();
        let live = self.audit_path();
        if live.exists() {
            rotated.push(live);
        }
        Ok(rotated)
    }

    fn rotate_if_needed(&self) -> StoreResult<()> {
        let path = self.audit_path();
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(&path, err)),
        };
        if size < self.max_audit_bytes {
            return Ok(());
        }
        let mut stamp = now_millis();
        let mut archive = self.root.join(format!("events.{stamp:013}.ndjson"));
        while archive.exists() {
            stamp += 1;
            archive = self.root.join(format!("events.{stamp:013}.ndjson"));
        }
        fs::rename(&path, &archive).map_err(|e| io_error(&path, e))?;
        tracing::info!(archive = %archive.display(), size, "rotated audit log");
        Ok(())
    }

    fn read_box_file(path: &Path) -> StoreResult<BoxState> {
        let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

fn read_audit_file(path: &Path) -> StoreResult<Vec<AuditEvent>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(path, err)),
    };
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_error(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            // A torn final line after a crash is skipped, not fatal.
            Err(err) => tracing::warn!(path = %path.display(), "skipping audit line: {err}"),
        }
    }
    Ok(events)
}

impl Store for FsStore {
    fn load_all(&self) -> StoreResult<Vec<BoxState>> {
        let mut states = Vec::new();
        let entries = fs::read_dir(&self.boxes_dir).map_err(|e| io_error(&self.boxes_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.boxes_dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(box_id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<BoxId>().ok())
            else {
                tracing::warn!(path = %path.display(), "skipping box file with invalid name");
                continue;
            };
            match Self::read_box_file(&path) {
                Ok(mut state) => {
                    if state.box_id != box_id {
                        tracing::warn!(
                            path = %path.display(),
                            recorded = state.box_id,
                            "box id inside file disagrees with file name; using file name"
                        );
                        state.box_id = box_id;
                    }
                    states.push(state);
                }
                Err(err) => tracing::error!("skipping unreadable box file: {err}"),
            }
        }
        states.sort_by_key(|state| state.box_id);
        if !states.is_empty() {
            tracing::info!(count = states.len(), "loaded box states from disk");
        }
        Ok(states)
    }

    fn load(&self, box_id: BoxId) -> StoreResult<Option<BoxState>> {
        let path = self.box_path(box_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_box_file(&path).map(Some)
    }

    fn save(&self, state: &BoxState) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.box_path(state.box_id), &bytes)
    }

    fn remove(&self, box_id: BoxId) -> StoreResult<bool> {
        let path = self.box_path(box_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn append_audit(&self, event: &AuditEvent) -> StoreResult<AppendOutcome> {
        let mut seen = self.audit.lock().unwrap_or_else(PoisonError::into_inner);
        let key = event.dedup_key();
        if let Some(key) = &key {
            if seen.contains_key(key) {
                return Ok(AppendOutcome::Duplicate);
            }
        }
        self.rotate_if_needed()?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.audit_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        file.write_all(&line).map_err(|e| io_error(&path, e))?;
        file.sync_data().map_err(|e| io_error(&path, e))?;
        if let Some(key) = key {
            seen.insert(key, event.result_status);
        }
        Ok(AppendOutcome::Appended)
    }

    fn audit_outcome(
        &self,
        box_id: Option<BoxId>,
        action_id: &str,
    ) -> StoreResult<Option<ResultStatus>> {
        let seen = self.audit.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(seen.get(&(box_id, action_id.to_string())).copied())
    }

    fn list_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        // Hold the audit lock so a concurrent rotation cannot hide a file mid-scan.
        let _guard = self.audit.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = query.effective_limit();
        let mut tail = VecDeque::with_capacity(limit);
        for path in self.audit_files()? {
            for event in read_audit_file(&path)? {
                if !query.matches(&event) {
                    continue;
                }
                if tail.len() == limit {
                    tail.pop_front();
                }
                tail.push_back(event);
            }
        }
        Ok(tail.into_iter().rev().map(|e| query.shape(e)).collect())
    }

    fn clear_boxes(&self) -> StoreResult<usize> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.boxes_dir).map_err(|e| io_error(&self.boxes_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.boxes_dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(path = %path.display(), "failed to delete box file: {err}"),
            }
        }
        Ok(removed)
    }

    fn load_settings(&self) -> StoreResult<Settings> {
        let path = self.settings_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), "ignoring unreadable settings: {err}");
                Settings::default()
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(settings)?;
        write_atomic(&self.settings_path(), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Provenance, ResultStatus};
    use tempfile::TempDir;

    fn event(box_id: BoxId, action_id: Option<&str>, action: &str) -> AuditEvent {
        AuditEvent {
            id: format!("{box_id}-{action}-{}", action_id.unwrap_or("none")),
            created_at_ms: now_millis(),
            box_id: Some(box_id),
            action_id: action_id.map(str::to_string),
            session_id: "s1".into(),
            action: action.into(),
            payload: Some(serde_json::json!({ "k": action })),
            result_status: ResultStatus::Accepted,
            box_version: 1,
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn box_state_survives_reopen() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        let mut state = BoxState::new(4);
        state.box_version = 7;
        state.session_id = "sess".into();
        state.state = serde_json::json!({ "initiated": true, "holds": [1, 2] });
        store.save(&state).expect("save");

        let reopened = FsStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.load_all().expect("load"), vec![state.clone()]);
        assert_eq!(reopened.load(4).expect("load one"), Some(state));
        assert_eq!(reopened.load(5).expect("load missing"), None);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        store.save(&BoxState::new(1)).expect("save");
        let names: Vec<String> = fs::read_dir(dir.path().join(BOXES_DIR))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1.json".to_string()]);
    }

    #[test]
    fn corrupt_and_misnamed_box_files_are_skipped() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        store.save(&BoxState::new(2)).expect("save");
        let boxes = dir.path().join(BOXES_DIR);
        fs::write(boxes.join("3.json"), b"{ not json").expect("write corrupt");
        fs::write(boxes.join("notes.json"), b"{}").expect("write misnamed");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].box_id, 2);
    }

    #[test]
    fn duplicate_action_ids_append_once_across_reopen() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        assert_eq!(
            store.append_audit(&event(1, Some("a1"), "START_TIMER")).expect("append"),
            AppendOutcome::Appended
        );
        assert_eq!(
            store.append_audit(&event(1, Some("a1"), "START_TIMER")).expect("dup"),
            AppendOutcome::Duplicate
        );
        // Same action id on another box is a different key.
        assert_eq!(
            store.append_audit(&event(2, Some("a1"), "START_TIMER")).expect("other box"),
            AppendOutcome::Appended
        );
        // Events without an action id are never deduplicated.
        store.append_audit(&event(1, None, "STOP_TIMER")).expect("no id");
        store.append_audit(&event(1, None, "STOP_TIMER")).expect("no id again");

        let reopened = FsStore::open(dir.path()).expect("reopen");
        assert_eq!(
            reopened.append_audit(&event(1, Some("a1"), "START_TIMER")).expect("dup after reopen"),
            AppendOutcome::Duplicate
        );
        let all = reopened
            .list_audit(&AuditQuery {
                limit: 100,
                ..AuditQuery::default()
            })
            .expect("list");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn list_audit_is_newest_first_filtered_and_trimmed() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        for i in 0..5 {
            store
                .append_audit(&event(1, Some(&format!("b1-{i}")), &format!("A{i}")))
                .expect("append");
        }
        store.append_audit(&event(2, Some("b2"), "OTHER")).expect("append");

        let events = store
            .list_audit(&AuditQuery {
                box_id: Some(1),
                limit: 2,
                include_payload: false,
            })
            .expect("list");
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["A4", "A3"]);
        assert!(events.iter().all(|e| e.payload.is_none()));

        let with_payload = store
            .list_audit(&AuditQuery {
                box_id: Some(2),
                limit: 10,
                include_payload: true,
            })
            .expect("list");
        assert_eq!(with_payload.len(), 1);
        assert!(with_payload[0].payload.is_some());
    }

    #[test]
    fn rotated_audit_files_still_deduplicate_and_list() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open").with_audit_rotation(1);
        store.append_audit(&event(1, Some("r1"), "FIRST")).expect("first");
        store.append_audit(&event(1, Some("r2"), "SECOND")).expect("second rotates");
        assert!(store.audit_files().expect("files").len() >= 2);

        let reopened = FsStore::open(dir.path()).expect("reopen");
        assert_eq!(
            reopened.append_audit(&event(1, Some("r1"), "FIRST")).expect("dup"),
            AppendOutcome::Duplicate
        );
        let events = reopened.list_audit(&AuditQuery::for_box(1)).expect("list");
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["SECOND", "FIRST"]);
    }

    #[test]
    fn clear_boxes_keeps_audit_and_settings() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        store.save(&BoxState::new(1)).expect("save");
        store.save(&BoxState::new(2)).expect("save");
        store.append_audit(&event(1, Some("x"), "A")).expect("append");
        store
            .save_settings(&Settings {
                time_criterion_enabled: true,
            })
            .expect("settings");

        assert_eq!(store.clear_boxes().expect("clear"), 2);
        assert!(store.load_all().expect("load").is_empty());
        assert_eq!(store.list_audit(&AuditQuery::default()).expect("list").len(), 1);
        assert!(store.load_settings().expect("settings").time_criterion_enabled);
    }

    #[test]
    fn recorded_outcomes_are_indexed_across_reopen() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        let mut ignored = event(3, Some("x"), "STEP");
        ignored.result_status = ResultStatus::Ignored;
        store.append_audit(&ignored).expect("append");

        let reopened = FsStore::open(dir.path()).expect("reopen");
        assert_eq!(
            reopened.audit_outcome(Some(3), "x").expect("lookup"),
            Some(ResultStatus::Ignored)
        );
        assert_eq!(reopened.audit_outcome(Some(3), "y").expect("lookup"), None);
    }

    #[test]
    fn remove_deletes_only_the_named_box() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStore::open(dir.path()).expect("open");
        store.save(&BoxState::new(1)).expect("save");
        store.save(&BoxState::new(2)).expect("save");
        assert!(store.remove(1).expect("remove"));
        assert!(!store.remove(1).expect("remove again"));
        assert_eq!(store.load_all().expect("load"), vec![BoxState::new(2)]);
    }
}
