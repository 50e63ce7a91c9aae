use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;

use crate::{
    background::BackgroundTask,
    configuration::{Configuration, FeatureFlag, VariableValue, OFF_VARIATION_KEY},
    configuration_store::ConfigurationStore,
    eval::{evaluate, Variation},
    synchronizer::{Synchronizer, SynchronizerConfig},
    tracking::{TrackingConfig, TrackingManager},
    transport::{HttpTransport, Transport},
    visitor::{state::ForcedVariation, store::VisitorStore, Conversion, Data},
    visitor_code::validate_visitor_code,
    ClientConfig, Error, Result,
};

/// A feature flag and experimentation client for one site.
///
/// Create it with [`ClientConfig::to_client`]. The client starts its background threads right
/// away: one keeps the configuration up to date, one delivers tracking data and one forgets
/// visitors idle for longer than the session duration.
///
/// Evaluation methods block until the initial configuration fetch completes (successfully or
/// not). They never wait on network I/O afterwards.
///
/// # Examples
/// ```no_run
/// # use flagline::ClientConfig;
/// let client = ClientConfig::from_site_code("site-code").to_client().unwrap();
/// client.wait_init().unwrap();
/// let variation = client
///     .get_variation("visitor-code", "new-checkout", true)
///     .map(|variation| variation.key)
///     .unwrap_or_else(|_| "off".to_owned());
/// ```
pub struct Client {
    site_code: String,
    configuration_store: Arc<ConfigurationStore>,
    visitors: Arc<VisitorStore>,
    tracking: Arc<TrackingManager>,
    transport: Arc<dyn Transport>,
    synchronizer: Synchronizer,
    tracking_task: BackgroundTask,
    purge_task: BackgroundTask,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl Client {
    pub(crate) fn new(config: ClientConfig) -> Result<Client> {
        let transport: Arc<dyn Transport> = match config.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                config.site_code.clone(),
                config.environment.clone(),
                config.base_urls.clone(),
                config.default_timeout,
            )?),
        };
        let configuration_store = Arc::new(ConfigurationStore::new());
        let visitors = Arc::new(VisitorStore::new());
        let tracking = Arc::new(TrackingManager::new(
            visitors.clone(),
            configuration_store.clone(),
            transport.clone(),
            TrackingConfig {
                budget: config.tracking_budget,
                ..TrackingConfig::default()
            },
        ));

        let synchronizer = Synchronizer::start(
            transport.clone(),
            configuration_store.clone(),
            config.update_listener,
            SynchronizerConfig::new(config.refresh_interval),
        )?;

        let tracking_task = {
            let tracking = tracking.clone();
            BackgroundTask::spawn("flagline-tracking", config.tracking_interval, move || {
                // Failures are logged and re-queued by the manager.
                let _ = tracking.flush_cycle();
            })?
        };

        let session_seconds = i64::try_from(config.session_duration.as_secs()).unwrap_or(i64::MAX);
        let purge_task = {
            let visitors = visitors.clone();
            BackgroundTask::spawn(
                "flagline-visitor-purge",
                purge_period(config.session_duration),
                move || {
                    let purged = visitors.purge_idle(Utc::now().timestamp(), session_seconds);
                    if purged > 0 {
                        log::debug!(target: "flagline", purged, remaining = visitors.len(); "purged idle visitors");
                    }
                },
            )?
        };

        log::debug!(target: "flagline", site_code = config.site_code; "client started");

        Ok(Client {
            site_code: config.site_code,
            configuration_store,
            visitors,
            tracking,
            transport,
            synchronizer,
            tracking_task,
            purge_task,
            default_timeout: config.default_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Site code the client serves.
    pub fn site_code(&self) -> &str {
        &self.site_code
    }

    /// Block until the initial configuration fetch completes.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial fetch if it failed. The client keeps trying in the
    /// background, so later calls may succeed.
    pub fn wait_init(&self) -> Result<()> {
        self.synchronizer.wait_for_configuration()?;
        Ok(())
    }

    /// Current configuration snapshot, if one has been applied.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.configuration_store.get_configuration()
    }

    /// Get the variation of a feature flag for a visitor.
    ///
    /// The assignment is recorded on the visitor and, unless `track` is `false`, scheduled for
    /// delivery together with the visitor's other unsent data.
    ///
    /// # Errors
    ///
    /// - [`Error::VisitorCodeEmpty`] or [`Error::VisitorCodeTooLong`] for an invalid visitor
    ///   code.
    /// - [`Error::ConfigurationNotLoaded`] if no configuration could be fetched.
    /// - [`Error::FeatureNotFound`], [`Error::FeatureEnvironmentDisabled`] or
    ///   [`Error::ConfigurationParseError`] for the requested flag.
    pub fn get_variation(
        &self,
        visitor_code: &str,
        feature_key: &str,
        track: bool,
    ) -> Result<Variation> {
        validate_visitor_code(visitor_code)?;
        let configuration = self.ready_configuration()?;
        let flag = lookup(configuration.feature_flag(feature_key))?;
        if !flag.environment_enabled {
            return lookup(Err(Error::FeatureEnvironmentDisabled(feature_key.to_owned())));
        }
        Ok(self.evaluate(&configuration, flag, visitor_code, track))
    }

    /// Get variations of all feature flags enabled in the environment for a visitor.
    ///
    /// With `only_active`, flags evaluating to the `off` variation are left out. Flags that
    /// failed to parse are skipped.
    pub fn get_variations(
        &self,
        visitor_code: &str,
        only_active: bool,
        track: bool,
    ) -> Result<HashMap<String, Variation>> {
        validate_visitor_code(visitor_code)?;
        let configuration = self.ready_configuration()?;
        let mut variations = HashMap::new();
        for key in configuration.active_feature_keys() {
            let Ok(flag) = configuration.feature_flag(&key) else {
                continue;
            };
            let variation = self.evaluate(&configuration, flag, visitor_code, track);
            if only_active && variation.key == OFF_VARIATION_KEY {
                continue;
            }
            variations.insert(key, variation);
        }
        Ok(variations)
    }

    /// Whether the flag is on for the visitor: its variation is anything but `off`.
    ///
    /// A flag disabled in the environment is not active.
    ///
    /// # Errors
    ///
    /// Same as [`Client::get_variation`], except for
    /// [`Error::FeatureEnvironmentDisabled`].
    pub fn is_feature_active(
        &self,
        visitor_code: &str,
        feature_key: &str,
        track: bool,
    ) -> Result<bool> {
        match self.get_variation(visitor_code, feature_key, track) {
            Ok(variation) => Ok(variation.key != OFF_VARIATION_KEY),
            Err(Error::FeatureEnvironmentDisabled(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Get a variable of the variation assigned to the visitor. The assignment is tracked.
    ///
    /// # Errors
    ///
    /// Same as [`Client::get_variation`], plus [`Error::FeatureVariableNotFound`].
    pub fn get_feature_variable(
        &self,
        visitor_code: &str,
        feature_key: &str,
        variable_key: &str,
    ) -> Result<VariableValue> {
        let mut variation = self.get_variation(visitor_code, feature_key, true)?;
        let value = variation.variables.remove(variable_key);
        lookup(value.ok_or_else(|| Error::FeatureVariableNotFound {
            feature_key: feature_key.to_owned(),
            variable_key: variable_key.to_owned(),
        }))
    }

    /// Get all variables of a variation of a flag, without evaluating it for anyone.
    ///
    /// # Errors
    ///
    /// [`Error::FeatureNotFound`] or [`Error::FeatureVariationNotFound`], or
    /// [`Error::ConfigurationNotLoaded`].
    pub fn get_feature_variation_variables(
        &self,
        feature_key: &str,
        variation_key: &str,
    ) -> Result<HashMap<String, VariableValue>> {
        let configuration = self.ready_configuration()?;
        let flag = lookup(configuration.feature_flag(feature_key))?;
        let variation = lookup(flag.variation(variation_key).ok_or_else(|| {
            Error::FeatureVariationNotFound {
                feature_key: feature_key.to_owned(),
                variation_key: variation_key.to_owned(),
            }
        }))?;
        Ok(variation.variables.clone())
    }

    /// Keys of all feature flags in the configuration.
    pub fn get_feature_list(&self) -> Result<Vec<String>> {
        Ok(self.ready_configuration()?.feature_keys())
    }

    /// Keys of the feature flags enabled in the client's environment.
    pub fn get_active_feature_list(&self) -> Result<Vec<String>> {
        Ok(self.ready_configuration()?.active_feature_keys())
    }

    /// Store data about a visitor. It is used for targeting right away and delivered with the
    /// visitor's next tracking cycle.
    ///
    /// # Examples
    /// ```no_run
    /// # use flagline::{Client, CustomData, DeviceType, Device, PageView};
    /// # fn test(client: &Client) -> flagline::Result<()> {
    /// client.add_data(
    ///     "visitor-code",
    ///     [
    ///         CustomData::new(1, ["premium"]).into(),
    ///         Device::from(DeviceType::Phone).into(),
    ///         PageView::new("https://example.com/pricing", "Pricing").into(),
    ///     ],
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_data(&self, visitor_code: &str, data: impl IntoIterator<Item = Data>) -> Result<()> {
        validate_visitor_code(visitor_code)?;
        let configuration = self.configuration_store.get_configuration();
        let now = Utc::now().timestamp();
        let visitor = self.visitors.get_or_create(visitor_code, now);
        visitor.with_state(|state| {
            for data in data {
                state.add(data, configuration.as_deref());
            }
        });
        Ok(())
    }

    /// Record a conversion of `goal_id` for the visitor and schedule it for delivery.
    pub fn track_conversion(
        &self,
        visitor_code: &str,
        goal_id: u32,
        revenue: Option<f64>,
    ) -> Result<()> {
        let mut conversion = Conversion::new(goal_id);
        if let Some(revenue) = revenue {
            conversion = conversion.with_revenue(revenue);
        }
        self.add_data(visitor_code, [conversion.into()])?;
        self.tracking.add(visitor_code);
        Ok(())
    }

    /// Schedule the visitor's unsent data for immediate delivery.
    ///
    /// # Errors
    ///
    /// [`Error::ClientClosed`] after [`Client::close`].
    pub fn flush(&self, visitor_code: &str) -> Result<()> {
        validate_visitor_code(visitor_code)?;
        self.ensure_open()?;
        self.tracking.add(visitor_code);
        self.tracking_task.wake();
        Ok(())
    }

    /// Schedule the unsent data of every known visitor for immediate delivery.
    pub fn flush_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.tracking.add_all(self.visitors.visitor_codes());
        self.tracking_task.wake();
        Ok(())
    }

    /// Record whether the visitor gave legal consent to be tracked. Only matters when the site
    /// requires consent.
    pub fn set_legal_consent(&self, visitor_code: &str, consent: bool) -> Result<()> {
        validate_visitor_code(visitor_code)?;
        self.visitors
            .get_or_create(visitor_code, Utc::now().timestamp())
            .with_state(|state| state.set_legal_consent(consent));
        Ok(())
    }

    /// Force a variation of an experiment onto the visitor, or remove a forced variation with
    /// `None`.
    ///
    /// With `force_targeting` the variation applies even if the visitor doesn't match the
    /// rule's segment; otherwise the rule's targeting is checked first.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentNotFound`] if no rule runs the experiment,
    /// [`Error::FeatureVariationNotFound`] if the flag has no such variation.
    pub fn set_forced_variation(
        &self,
        visitor_code: &str,
        experiment_id: u32,
        variation_key: Option<&str>,
        force_targeting: bool,
    ) -> Result<()> {
        validate_visitor_code(visitor_code)?;
        let forced = match variation_key {
            None => None,
            Some(variation_key) => {
                let configuration = self.ready_configuration()?;
                let (flag, _) = lookup(
                    configuration
                        .rule_by_experiment(experiment_id)
                        .ok_or(Error::ExperimentNotFound(experiment_id)),
                )?;
                if flag.variation(variation_key).is_none() {
                    return lookup(Err(Error::FeatureVariationNotFound {
                        feature_key: flag.key.clone(),
                        variation_key: variation_key.to_owned(),
                    }));
                }
                Some(ForcedVariation {
                    variation_key: variation_key.to_owned(),
                    force_targeting,
                })
            }
        };
        self.visitors
            .get_or_create(visitor_code, Utc::now().timestamp())
            .with_state(|state| state.set_forced_variation(experiment_id, forced));
        Ok(())
    }

    /// Look up remote data stored under `key`. Best effort: failures are returned, not retried.
    ///
    /// `timeout` defaults to the client's default timeout.
    pub fn get_remote_data(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let body = self
            .transport
            .get_remote_data(key, timeout.unwrap_or(self.default_timeout))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Stop background threads. Unsent tracking data is not delivered afterwards. Idempotent.
    ///
    /// Evaluation keeps working on the last applied configuration.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!(target: "flagline", site_code = self.site_code; "closing client");
        self.synchronizer.stop();
        self.tracking_task.stop();
        self.purge_task.stop();
        self.synchronizer.shutdown()?;
        self.tracking_task.shutdown()?;
        self.purge_task.shutdown()?;
        Ok(())
    }

    /// Whether [`Client::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    /// Wait for the initial fetch, then return the current snapshot.
    fn ready_configuration(&self) -> Result<Arc<Configuration>> {
        if let Err(err) = self.synchronizer.wait_for_configuration() {
            log::debug!(target: "flagline", "configuration is not ready: {err}");
        }
        self.configuration_store
            .get_configuration()
            .ok_or(Error::ConfigurationNotLoaded)
    }

    fn evaluate(
        &self,
        configuration: &Configuration,
        flag: &FeatureFlag,
        visitor_code: &str,
        track: bool,
    ) -> Variation {
        let now = Utc::now();
        let visitor = self.visitors.get_or_create(visitor_code, now.timestamp());
        let evaluation =
            visitor.with_state(|state| evaluate(configuration, flag, visitor_code, state, now, track));
        log::trace!(target: "flagline",
            visitor_code,
            feature_key:display = flag.key,
            variation_key:display = evaluation.variation.key;
            "evaluated feature flag");
        if track && evaluation.recorded {
            self.tracking.add(visitor_code);
        }
        evaluation.variation
    }
}

/// Log lookup misses at `debug` and pass the result through.
fn lookup<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        if err.is_lookup_miss() {
            log::debug!(target: "flagline", "{err}");
        } else {
            log::warn!(target: "flagline", "{err}");
        }
    }
    result
}

/// A quarter of the session duration, bounded to one second and one minute.
fn purge_period(session_duration: Duration) -> Duration {
    (session_duration / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}
