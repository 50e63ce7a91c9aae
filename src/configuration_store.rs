use std::sync::{Arc, PoisonError, RwLock};

use crate::configuration::Configuration;

/// `ConfigurationStore` provides a Sync storage for the configuration snapshot that allows
/// concurrent access for readers and writers.
///
/// Readers get an `Arc` to an immutable snapshot and never observe a partially applied update.
#[derive(Debug, Default)]
pub(crate) struct ConfigurationStore {
    configuration: RwLock<Option<Arc<Configuration>>>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_configuration(&self) -> Option<Arc<Configuration>> {
        // Lock poisoning is not possible: the only writer does a plain assignment under the lock.
        let configuration = self
            .configuration
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        configuration.clone()
    }

    /// Apply a new configuration unless it is older than the current one. Returns `true` if the
    /// configuration was applied.
    ///
    /// Updates may arrive out of order from concurrent fetch paths, so the timestamps are compared
    /// while holding the write lock.
    pub fn apply(&self, configuration: Configuration) -> bool {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(configuration);

        let mut slot = self
            .configuration
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref() {
            if new_value.timestamp() < current.timestamp() {
                log::debug!(target: "flagline", current = current.timestamp(), received = new_value.timestamp(); "discarding outdated configuration");
                return false;
            }
        }
        *slot = Some(new_value);
        true
    }
}
