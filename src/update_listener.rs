use serde::Serialize;

use crate::configuration::Configuration;

/// Notification about an applied configuration update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationUpdate {
    /// Server timestamp of the applied configuration.
    pub timestamp: i64,
    /// Keys of all feature flags in the applied configuration.
    pub feature_keys: Vec<String>,
}

impl ConfigurationUpdate {
    pub(crate) fn new(configuration: &Configuration) -> ConfigurationUpdate {
        ConfigurationUpdate {
            timestamp: configuration.timestamp(),
            feature_keys: configuration.feature_keys(),
        }
    }
}

/// Receives a notification after every configuration update the client applies.
///
/// Called from the synchronizer thread; implementations should return quickly.
pub trait UpdateListener {
    /// Handle an applied update.
    fn on_update(&self, update: ConfigurationUpdate);
}

pub(crate) struct NoopUpdateListener;
impl UpdateListener for NoopUpdateListener {
    fn on_update(&self, _update: ConfigurationUpdate) {}
}

impl<T: Fn(ConfigurationUpdate)> UpdateListener for T {
    fn on_update(&self, update: ConfigurationUpdate) {
        self(update);
    }
}
