use std::{sync::Arc, time::Duration};

use crate::{
    transport::{ServiceUrls, Transport},
    update_listener::NoopUpdateListener,
    Client, Result, UpdateListener,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use flagline::ClientConfig;
/// let client = ClientConfig::from_site_code("site-code")
///     .environment("production")
///     .refresh_interval(Duration::from_secs(300))
///     .to_client()
///     .unwrap();
/// ```
pub struct ClientConfig {
    pub(crate) site_code: String,
    pub(crate) environment: Option<String>,
    pub(crate) refresh_interval: Duration,
    pub(crate) tracking_interval: Duration,
    pub(crate) session_duration: Duration,
    pub(crate) default_timeout: Duration,
    pub(crate) tracking_budget: usize,
    pub(crate) base_urls: ServiceUrls,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) update_listener: Arc<dyn UpdateListener + Send + Sync>,
}

impl ClientConfig {
    /// Default polling interval.
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
    /// Shortest allowed polling interval.
    pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default period of tracking flushes.
    pub const DEFAULT_TRACKING_INTERVAL: Duration = Duration::from_millis(1000);
    /// Shortest allowed tracking period.
    pub const MIN_TRACKING_INTERVAL: Duration = Duration::from_millis(100);
    /// Longest allowed tracking period.
    pub const MAX_TRACKING_INTERVAL: Duration = Duration::from_millis(1000);
    /// Default visitor inactivity window.
    pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(30 * 60);
    /// Shortest allowed visitor inactivity window.
    pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(1);
    /// Default timeout of network requests.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default size budget of one tracking request, in bytes.
    pub const DEFAULT_TRACKING_BUDGET: usize = 2_560_000;

    /// Create a default configuration for the specified site code.
    ///
    /// ```
    /// # use flagline::ClientConfig;
    /// ClientConfig::from_site_code("site-code");
    /// ```
    pub fn from_site_code(site_code: impl Into<String>) -> Self {
        ClientConfig {
            site_code: site_code.into(),
            environment: None,
            refresh_interval: ClientConfig::DEFAULT_REFRESH_INTERVAL,
            tracking_interval: ClientConfig::DEFAULT_TRACKING_INTERVAL,
            session_duration: ClientConfig::DEFAULT_SESSION_DURATION,
            default_timeout: ClientConfig::DEFAULT_TIMEOUT,
            tracking_budget: ClientConfig::DEFAULT_TRACKING_BUDGET,
            base_urls: ServiceUrls::default(),
            transport: None,
            update_listener: Arc::new(NoopUpdateListener),
        }
    }

    /// Site code the client serves.
    pub fn site_code(&self) -> &str {
        &self.site_code
    }

    /// Environment whose flag states are served. Flags disabled for this environment yield
    /// [`Error::FeatureEnvironmentDisabled`](crate::Error::FeatureEnvironmentDisabled).
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the polling interval. Values below [`ClientConfig::MIN_REFRESH_INTERVAL`] are raised
    /// to it.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval.max(ClientConfig::MIN_REFRESH_INTERVAL);
        self
    }

    /// Set the period of tracking flushes, clamped to
    /// [`ClientConfig::MIN_TRACKING_INTERVAL`]..=[`ClientConfig::MAX_TRACKING_INTERVAL`].
    pub fn tracking_interval(mut self, tracking_interval: Duration) -> Self {
        self.tracking_interval = tracking_interval.clamp(
            ClientConfig::MIN_TRACKING_INTERVAL,
            ClientConfig::MAX_TRACKING_INTERVAL,
        );
        self
    }

    /// Set how long a visitor is kept after its last activity. Values below
    /// [`ClientConfig::MIN_SESSION_DURATION`] are raised to it.
    pub fn session_duration(mut self, session_duration: Duration) -> Self {
        self.session_duration = session_duration.max(ClientConfig::MIN_SESSION_DURATION);
        self
    }

    /// Set the timeout of network requests. It is also the default timeout of
    /// [`Client::get_remote_data`].
    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    /// Set the maximum size of one tracking request in bytes. Visitors that don't fit are
    /// delivered in the next cycle.
    pub fn tracking_budget(mut self, tracking_budget: usize) -> Self {
        self.tracking_budget = tracking_budget.max(1);
        self
    }

    /// Override base URLs of the services. Clients should use the default setting in most cases.
    pub fn base_urls(mut self, base_urls: ServiceUrls) -> Self {
        self.base_urls = base_urls;
        self
    }

    /// Use a custom [`Transport`] instead of the built-in HTTP one. Base URLs, environment and
    /// timeout are then up to the transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set a listener notified after every applied configuration update.
    ///
    /// ```
    /// # use flagline::{ClientConfig, ConfigurationUpdate};
    /// let config = ClientConfig::from_site_code("site-code").update_listener(|update: ConfigurationUpdate| {
    ///     println!("configuration {} applied", update.timestamp);
    /// });
    /// ```
    pub fn update_listener(
        mut self,
        update_listener: impl UpdateListener + Send + Sync + 'static,
    ) -> Self {
        self.update_listener = Arc::new(update_listener);
        self
    }

    /// Create a new [`Client`] using the specified configuration and start its background
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP transport cannot be created or a background thread cannot
    /// be spawned.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
