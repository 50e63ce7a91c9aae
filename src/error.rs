use std::sync::Arc;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the client.
///
/// Errors fall into a few groups:
/// - input validation errors (bad visitor code) are returned before any evaluation happens;
/// - lookup misses (unknown flag, variation, variable) are normal running conditions and are only
///   logged at `debug` level (see [`Error::is_lookup_miss`]);
/// - network and readiness errors surface transport failures on paths that cannot degrade
///   silently.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Visitor code is an empty string.
    #[error("visitor code is empty")]
    VisitorCodeEmpty,

    /// Visitor code is longer than the allowed maximum.
    #[error("visitor code is too long ({0} characters, maximum is 255)")]
    VisitorCodeTooLong(usize),

    /// The requested feature flag does not exist in the current configuration.
    #[error("feature flag {0:?} not found")]
    FeatureNotFound(String),

    /// The feature flag exists but is disabled for the configured environment.
    #[error("feature flag {0:?} is disabled for the current environment")]
    FeatureEnvironmentDisabled(String),

    /// The variation does not exist for the given feature flag.
    #[error("variation {variation_key:?} not found for feature flag {feature_key:?}")]
    FeatureVariationNotFound {
        /// Key of the flag that was looked up.
        feature_key: String,
        /// Variation key missing from the flag.
        variation_key: String,
    },

    /// The variable does not exist in the evaluated variation.
    #[error("variable {variable_key:?} not found for feature flag {feature_key:?}")]
    FeatureVariableNotFound {
        /// Key of the evaluated flag.
        feature_key: String,
        /// Variable key missing from the variation.
        variable_key: String,
    },

    /// No rule of any feature flag references this experiment.
    #[error("experiment {0} not found")]
    ExperimentNotFound(u32),

    /// This flag could not be parsed from the configuration (the server sent a format the client
    /// does not understand). Other flags are still served.
    #[error("error parsing configuration of feature flag {0:?}")]
    ConfigurationParseError(String),

    /// Configuration has not been loaded (the initial fetch has not completed successfully).
    #[error("configuration has not been loaded")]
    ConfigurationNotLoaded,

    /// The configuration document could not be decoded.
    #[error("malformed configuration: {0}")]
    Parse(Arc<serde_json::Error>),

    /// The request was unauthorized, the site code is likely invalid.
    #[error("unauthorized, site code is likely invalid")]
    Unauthorized,

    /// A service URL could not be built.
    #[error("invalid service url")]
    InvalidUrl(#[source] url::ParseError),

    /// Server responded with an unexpected status code.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Real-time update stream was closed by the other side.
    #[error("real-time update stream closed")]
    StreamClosed,

    /// Configuration synchronizer thread panicked. This should normally never happen.
    #[error("configuration synchronizer thread panicked")]
    SynchronizerPanicked,

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,
}

impl Error {
    /// Returns `true` for lookup misses: the caller asked for something the configuration does
    /// not have. These are never fatal and should not be logged above `debug`.
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            Error::FeatureNotFound(_)
                | Error::FeatureEnvironmentDisabled(_)
                | Error::FeatureVariationNotFound { .. }
                | Error::FeatureVariableNotFound { .. }
                | Error::ExperimentNotFound(_)
        )
    }

    /// Returns `true` if retrying the same operation later may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::HttpStatus(code) => *code >= 500 || *code == 429 || *code == 408,
            Error::Network(_) | Error::Io(_) | Error::StreamClosed => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}
