use crate::{
    AppendOutcome, AuditEvent, AuditQuery, BoxId, BoxState, Provenance, ResultStatus, Settings,
    Store, StoreError, StoreResult, duplicate_action, io_error, now_millis,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS boxes (
    box_id        INTEGER PRIMARY KEY,
    box_version   INTEGER NOT NULL,
    session_id    TEXT NOT NULL,
    state         TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_events (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL,
    created_at_ms    INTEGER NOT NULL,
    box_id           INTEGER,
    action_id        TEXT,
    session_id       TEXT NOT NULL,
    action           TEXT NOT NULL,
    payload          TEXT,
    result_status    TEXT NOT NULL,
    box_version      INTEGER NOT NULL,
    actor_username   TEXT,
    actor_role       TEXT,
    actor_ip         TEXT,
    actor_user_agent TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_audit_dedup
    ON audit_events (COALESCE(box_id, -1), action_id);
CREATE INDEX IF NOT EXISTS ix_audit_box ON audit_events (box_id, seq);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const SETTINGS_KEY: &str = "settings";

/// SQLite-backed store: one row per box with a version column that only moves
/// forward, and an audit table with a uniqueness constraint on
/// `(box_id, action_id)`.
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

struct AuditRow {
    id: String,
    created_at_ms: i64,
    box_id: Option<u32>,
    action_id: Option<String>,
    session_id: String,
    action: String,
    payload: Option<String>,
    result_status: String,
    box_version: i64,
    provenance: Provenance,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert guarded by the version column: a write carrying an older
    /// version than the stored row is refused.
    fn upsert_box(conn: &Connection, state: &BoxState) -> StoreResult<()> {
        let encoded = serde_json::to_string(&state.state)?;
        let changed = conn.execute(
            "INSERT INTO boxes (box_id, box_version, session_id, state, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (box_id) DO UPDATE SET
                 box_version = excluded.box_version,
                 session_id = excluded.session_id,
                 state = excluded.state,
                 updated_at_ms = excluded.updated_at_ms
             WHERE boxes.box_version <= excluded.box_version",
            params![
                state.box_id,
                state.box_version as i64,
                state.session_id,
                encoded,
                now_millis() as i64
            ],
        )?;
        if changed == 0 {
            let stored: i64 = conn.query_row(
                "SELECT box_version FROM boxes WHERE box_id = ?1",
                params![state.box_id],
                |row| row.get(0),
            )?;
            return Err(StoreError::VersionConflict {
                box_id: state.box_id,
                stored: stored as u64,
                attempted: state.box_version,
            });
        }
        Ok(())
    }

    fn insert_audit(conn: &Connection, event: &AuditEvent) -> StoreResult<AppendOutcome> {
        let payload = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO audit_events (
                 id, created_at_ms, box_id, action_id, session_id, action, payload,
                 result_status, box_version, actor_username, actor_role, actor_ip,
                 actor_user_agent
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.id,
                event.created_at_ms as i64,
                event.box_id,
                event.action_id,
                event.session_id,
                event.action,
                payload,
                event.result_status.as_str(),
                event.box_version as i64,
                event.provenance.actor_username,
                event.provenance.actor_role,
                event.provenance.actor_ip,
                event.provenance.actor_user_agent,
            ],
        )?;
        Ok(if changed == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Appended
        })
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(":memory:")),
            reason,
        }
    }

    fn decode_box(&self, box_id: u32, version: i64, session: String, raw: String) -> StoreResult<BoxState> {
        let state = serde_json::from_str(&raw)
            .map_err(|e| self.corrupt(format!("box {box_id}: {e}")))?;
        Ok(BoxState {
            box_id,
            box_version: version as u64,
            session_id: session,
            state,
        })
    }

    fn decode_audit(&self, row: AuditRow) -> StoreResult<AuditEvent> {
        let payload = row
            .payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| self.corrupt(format!("audit {}: {e}", row.id)))?;
        let result_status = ResultStatus::parse(&row.result_status).ok_or_else(|| {
            self.corrupt(format!("audit {}: unknown status {}", row.id, row.result_status))
        })?;
        Ok(AuditEvent {
            id: row.id,
            created_at_ms: row.created_at_ms as u64,
            box_id: row.box_id,
            action_id: row.action_id,
            session_id: row.session_id,
            action: row.action,
            payload,
            result_status,
            box_version: row.box_version as u64,
            provenance: row.provenance,
        })
    }
}

impl Store for SqliteStore {
    fn load_all(&self) -> StoreResult<Vec<BoxState>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT box_id, box_version, session_id, state FROM boxes ORDER BY box_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut states = Vec::with_capacity(rows.len());
        for (box_id, version, session, raw) in rows {
            match self.decode_box(box_id, version, session, raw) {
                Ok(state) => states.push(state),
                Err(err) => tracing::error!("skipping unreadable box row: {err}"),
            }
        }
        Ok(states)
    }

    fn load(&self, box_id: BoxId) -> StoreResult<Option<BoxState>> {
        let row = self
            .conn()
            .query_row(
                "SELECT box_version, session_id, state FROM boxes WHERE box_id = ?1",
                params![box_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(version, session, raw)| self.decode_box(box_id, version, session, raw))
            .transpose()
    }

    fn save(&self, state: &BoxState) -> StoreResult<()> {
        Self::upsert_box(&self.conn(), state)
    }

    fn remove(&self, box_id: BoxId) -> StoreResult<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM boxes WHERE box_id = ?1", params![box_id])?;
        Ok(removed > 0)
    }

    fn append_audit(&self, event: &AuditEvent) -> StoreResult<AppendOutcome> {
        Self::insert_audit(&self.conn(), event)
    }

    fn audit_outcome(
        &self,
        box_id: Option<BoxId>,
        action_id: &str,
    ) -> StoreResult<Option<ResultStatus>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT result_status FROM audit_events
                 WHERE COALESCE(box_id, -1) = COALESCE(?1, -1) AND action_id = ?2",
                params![box_id, action_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            ResultStatus::parse(&raw)
                .ok_or_else(|| self.corrupt(format!("audit {action_id}: unknown status {raw}")))
        })
        .transpose()
    }

    fn list_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, created_at_ms, box_id, action_id, session_id, action, payload,
                        result_status, box_version, actor_username, actor_role, actor_ip,
                        actor_user_agent
                 FROM audit_events
                 WHERE (?1 IS NULL OR box_id = ?1)
                 ORDER BY seq DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![query.box_id, query.effective_limit() as i64],
                |row| {
                    Ok(AuditRow {
                        id: row.get(0)?,
                        created_at_ms: row.get(1)?,
                        box_id: row.get(2)?,
                        action_id: row.get(3)?,
                        session_id: row.get(4)?,
                        action: row.get(5)?,
                        payload: row.get(6)?,
                        result_status: row.get(7)?,
                        box_version: row.get(8)?,
                        provenance: Provenance {
                            actor_username: row.get(9)?,
                            actor_role: row.get(10)?,
                            actor_ip: row.get(11)?,
                            actor_user_agent: row.get(12)?,
                        },
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter()
            .map(|row| self.decode_audit(row).map(|event| query.shape(event)))
            .collect()
    }

    fn clear_boxes(&self) -> StoreResult<usize> {
        Ok(self.conn().execute("DELETE FROM boxes", [])?)
    }

    fn load_settings(&self) -> StoreResult<Settings> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Settings::default()),
        }
    }

    fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        let raw = serde_json::to_string(settings)?;
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![SETTINGS_KEY, raw],
        )?;
        Ok(())
    }

    /// State row and audit row land in one transaction.
    fn commit(
        &self,
        _previous: &BoxState,
        next: &BoxState,
        event: &AuditEvent,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::upsert_box(&tx, next)?;
        if Self::insert_audit(&tx, event)? == AppendOutcome::Duplicate {
            // Dropping the transaction rolls the state write back.
            return Err(duplicate_action(event));
        }
        tx.commit()?;
        Ok(())
    }
}
