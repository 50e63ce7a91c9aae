use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{
    configuration_store::ConfigurationStore,
    transport::Transport,
    visitor::{
        state::{CollectPolicy, Receipt},
        store::{Visitor, VisitorStore},
    },
    Result,
};

use super::encoding::encode_line;

/// Configuration for [`TrackingManager`].
#[derive(Debug, Clone)]
pub(crate) struct TrackingConfig {
    /// Maximum size of one request body in bytes.
    pub budget: usize,
    /// Delivery attempts per cycle before the batch is rolled back.
    pub attempts: u32,
    pub backoff: Duration,
}

impl TrackingConfig {
    pub const DEFAULT_BUDGET: usize = 2_560_000;
    pub const DEFAULT_ATTEMPTS: u32 = 2;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
}

impl Default for TrackingConfig {
    fn default() -> TrackingConfig {
        TrackingConfig {
            budget: TrackingConfig::DEFAULT_BUDGET,
            attempts: TrackingConfig::DEFAULT_ATTEMPTS,
            backoff: TrackingConfig::DEFAULT_BACKOFF,
        }
    }
}

/// Visitor included in the current batch.
struct BatchEntry {
    visitor: Arc<Visitor>,
    receipts: Vec<Receipt>,
}

/// Collects unsent visitor data and delivers it in size-bounded batches.
///
/// Producers only mark visitor codes as pending; the data itself stays on the visitor until a
/// flush cycle picks it up.
pub(crate) struct TrackingManager {
    visitors: Arc<VisitorStore>,
    configuration_store: Arc<ConfigurationStore>,
    transport: Arc<dyn Transport>,
    config: TrackingConfig,
    pending: Mutex<HashSet<String>>,
}

impl TrackingManager {
    pub fn new(
        visitors: Arc<VisitorStore>,
        configuration_store: Arc<ConfigurationStore>,
        transport: Arc<dyn Transport>,
        config: TrackingConfig,
    ) -> TrackingManager {
        TrackingManager {
            visitors,
            configuration_store,
            transport,
            config,
            pending: Mutex::default(),
        }
    }

    /// Schedule the visitor's unsent data for the next cycle.
    pub fn add(&self, visitor_code: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.contains(visitor_code) {
            pending.insert(visitor_code.to_owned());
        }
    }

    pub fn add_all(&self, visitor_codes: impl IntoIterator<Item = String>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(visitor_codes);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one flush cycle: build a batch from pending visitors and deliver it.
    ///
    /// Visitors that don't fit in the size budget, and every visitor of a failed batch, stay
    /// pending for the next cycle.
    pub fn flush_cycle(&self) -> Result<()> {
        let Some(configuration) = self.configuration_store.get_configuration() else {
            // The consent policy is unknown until the configuration is loaded.
            return Ok(());
        };
        let codes = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if codes.is_empty() {
            return Ok(());
        }

        let policy = CollectPolicy::from_configuration(Some(&configuration));
        let mut body = String::new();
        let mut batch: Vec<(String, BatchEntry)> = Vec::new();
        let mut deferred = Vec::new();

        for code in codes {
            if body.len() >= self.config.budget {
                deferred.push(code);
                continue;
            }
            let Some(visitor) = self.visitors.peek(&code) else {
                continue;
            };
            let outgoing = visitor.with_state(|state| state.collect_unsent(&policy));
            if outgoing.is_empty() {
                // Nothing the visitor may be tracked with yet.
                continue;
            }
            let lines = outgoing
                .iter()
                .map(|item| encode_line(&code, item))
                .collect::<Vec<_>>()
                .join("\n");
            let receipts: Vec<Receipt> = outgoing.into_iter().filter_map(|o| o.receipt).collect();

            let size = lines.len() + usize::from(!body.is_empty());
            if !body.is_empty() && body.len() + size > self.config.budget {
                visitor.with_state(|state| state.complete_delivery(&receipts, false));
                deferred.push(code);
                continue;
            }
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&lines);
            batch.push((code, BatchEntry { visitor, receipts }));
        }

        if !deferred.is_empty() {
            log::warn!(target: "flagline", deferred = deferred.len(), budget = self.config.budget;
                "tracking size budget exhausted, deferring visitors to the next cycle");
            self.add_all(deferred);
        }
        if batch.is_empty() || body.is_empty() {
            return Ok(());
        }

        let result = self.deliver(&body);
        let delivered = result.is_ok();
        for (_, entry) in &batch {
            entry
                .visitor
                .with_state(|state| state.complete_delivery(&entry.receipts, delivered));
        }
        if let Err(err) = &result {
            log::warn!(target: "flagline", visitors = batch.len(); "tracking delivery failed, will retry next cycle: {err}");
            self.add_all(batch.into_iter().map(|(code, _)| code));
        } else {
            log::debug!(target: "flagline", visitors = batch.len(), bytes = body.len(); "tracking data delivered");
        }
        result
    }

    fn deliver(&self, body: &str) -> Result<()> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.send_tracking_data(body) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts && err.is_transient() => {
                    log::debug!(target: "flagline", attempt; "tracking delivery failed, retrying: {err}");
                    std::thread::sleep(self.config.backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
