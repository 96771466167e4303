//! Per-box runtimes and the registry that owns them.
//!
//! Each box has its own async mutex; the registry lock is only taken to look
//! up or insert an entry and is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use escalada_store::{BoxId, BoxState};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One box's live state behind its exclusive guard.
#[derive(Debug)]
pub struct BoxRuntime {
    box_id: BoxId,
    state: Arc<Mutex<BoxState>>,
}

impl BoxRuntime {
    fn new(state: BoxState) -> Self {
        Self {
            box_id: state.box_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    /// Owned guard; released when dropped, on every exit path.
    pub async fn lock(&self) -> OwnedMutexGuard<BoxState> {
        Arc::clone(&self.state).lock_owned().await
    }

    pub async fn snapshot(&self) -> BoxState {
        self.state.lock().await.clone()
    }
}

/// What an exclusive section decided to do with the box.
#[derive(Debug)]
pub enum Exclusive<T> {
    /// Install the new state, then return the value.
    Replace(BoxState, T),
    /// Leave the state as it was.
    Keep(T),
}

#[derive(Debug, Default)]
pub struct Registry {
    boxes: RwLock<HashMap<BoxId, Arc<BoxRuntime>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated from persisted states.
    pub fn from_states(states: impl IntoIterator<Item = BoxState>) -> Self {
        let boxes = states
            .into_iter()
            .map(|state| (state.box_id, Arc::new(BoxRuntime::new(state))))
            .collect();
        Self {
            boxes: RwLock::new(boxes),
        }
    }

    pub fn get(&self, box_id: BoxId) -> Option<Arc<BoxRuntime>> {
        let boxes = self.boxes.read().unwrap_or_else(PoisonError::into_inner);
        boxes.get(&box_id).cloned()
    }

    /// Idempotent; concurrent callers for the same id get the same runtime.
    pub fn get_or_create(&self, box_id: BoxId) -> Arc<BoxRuntime> {
        if let Some(runtime) = self.get(box_id) {
            return runtime;
        }
        let mut boxes = self.boxes.write().unwrap_or_else(PoisonError::into_inner);
        let runtime = boxes.entry(box_id).or_insert_with(|| {
            tracing::debug!(box_id, "creating box runtime");
            Arc::new(BoxRuntime::new(BoxState::new(box_id)))
        });
        Arc::clone(runtime)
    }

    pub fn contains(&self, box_id: BoxId) -> bool {
        let boxes = self.boxes.read().unwrap_or_else(PoisonError::into_inner);
        boxes.contains_key(&box_id)
    }

    /// Known box ids, ascending.
    pub fn box_ids(&self) -> Vec<BoxId> {
        let boxes = self.boxes.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<BoxId> = boxes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.boxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire a box's guard, creating the box if needed.
    pub async fn lock(&self, box_id: BoxId) -> OwnedMutexGuard<BoxState> {
        self.get_or_create(box_id).lock().await
    }

    /// Current state of an existing box.
    pub async fn snapshot(&self, box_id: BoxId) -> Option<BoxState> {
        match self.get(box_id) {
            Some(runtime) => Some(runtime.snapshot().await),
            None => None,
        }
    }

    /// Every box, ascending by id. Guards are taken one at a time.
    pub async fn snapshot_all(&self) -> Vec<BoxState> {
        let mut states = Vec::new();
        for box_id in self.box_ids() {
            if let Some(state) = self.snapshot(box_id).await {
                states.push(state);
            }
        }
        states
    }

    /// Run `f` against a copy of the box's state while holding its guard.
    ///
    /// The live state only changes if `f` returns [`Exclusive::Replace`];
    /// anything else, including a panic in `f`, leaves it untouched.
    pub async fn with_exclusive_access<F, Fut, T>(&self, box_id: BoxId, f: F) -> T
    where
        F: FnOnce(BoxState) -> Fut,
        Fut: Future<Output = Exclusive<T>>,
    {
        let mut guard = self.lock(box_id).await;
        match f(guard.clone()).await {
            Exclusive::Replace(next, out) => {
                *guard = next;
                out
            }
            Exclusive::Keep(out) => out,
        }
    }
}
