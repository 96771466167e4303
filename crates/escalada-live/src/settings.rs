use std::sync::{PoisonError, RwLock};

use escalada_store::Settings;
use tokio::sync::{Mutex, MutexGuard};

/// Process-wide settings with their own guard, outside any box.
///
/// Reads are lock-free with respect to box guards; updates are serialized
/// through [`SettingsCell::begin_update`] so persist, audit and fan-out of one
/// change finish before the next starts.
#[derive(Debug, Default)]
pub struct SettingsCell {
    value: RwLock<Settings>,
    update: Mutex<()>,
}

impl SettingsCell {
    pub fn new(settings: Settings) -> Self {
        Self {
            value: RwLock::new(settings),
            update: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Settings {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn time_criterion_enabled(&self) -> bool {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .time_criterion_enabled
    }

    pub async fn begin_update(&self) -> MutexGuard<'_, ()> {
        self.update.lock().await
    }

    pub(crate) fn set(&self, settings: Settings) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}
