use crate::{
    AppendOutcome, AuditEvent, AuditQuery, BoxId, BoxState, ResultStatus, Settings, Store,
    StoreError, StoreResult,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

#[derive(Default)]
struct Inner {
    boxes: BTreeMap<BoxId, BoxState>,
    audit: Vec<AuditEvent>,
    seen: HashMap<(Option<BoxId>, String), ResultStatus>,
    settings: Settings,
}

/// In-process store. Backs tests and the restore drill's scratch target.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
    fail_writes: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemStore")
            .field("boxes", &inner.boxes.len())
            .field("audit", &inner.audit.len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl Store for MemStore {
    fn load_all(&self) -> StoreResult<Vec<BoxState>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.boxes.values().cloned().collect())
    }

    fn load(&self, box_id: BoxId) -> StoreResult<Option<BoxState>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.boxes.get(&box_id).cloned())
    }

    fn save(&self, state: &BoxState) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.boxes.insert(state.box_id, state.clone());
        Ok(())
    }

    fn remove(&self, box_id: BoxId) -> StoreResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.boxes.remove(&box_id).is_some())
    }

    fn append_audit(&self, event: &AuditEvent) -> StoreResult<AppendOutcome> {
        self.check_writable()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = event.dedup_key() {
            if inner.seen.contains_key(&key) {
                return Ok(AppendOutcome::Duplicate);
            }
            inner.seen.insert(key, event.result_status);
        }
        inner.audit.push(event.clone());
        Ok(AppendOutcome::Appended)
    }

    fn audit_outcome(
        &self,
        box_id: Option<BoxId>,
        action_id: &str,
    ) -> StoreResult<Option<ResultStatus>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.seen.get(&(box_id, action_id.to_string())).copied())
    }

    fn list_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|event| query.matches(event))
            .take(query.effective_limit())
            .cloned()
            .map(|event| query.shape(event))
            .collect())
    }

    fn clear_boxes(&self) -> StoreResult<usize> {
        self.check_writable()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.boxes.len();
        inner.boxes.clear();
        Ok(removed)
    }

    fn load_settings(&self) -> StoreResult<Settings> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.settings.clone())
    }

    fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.settings = settings.clone();
        Ok(())
    }
}
