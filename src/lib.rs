//! Feature flag and experimentation client.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates feature flags for `visitors`, where each
//! visitor has a unique visitor code and data associated with it (custom data, page views,
//! device, conversions...). Evaluation results in a [`Variation`] of the flag, together with its
//! variables.
//!
//! Evaluation is local: the client keeps a snapshot of the site's configuration up to date in the
//! background, by polling or by following real-time update notifications, and delivers
//! assignments and visitor data to the tracking endpoint in periodic batches.
//!
//! Bucketing is deterministic: the same visitor always lands in the same variation of an
//! experiment, across processes and across SDKs, until the experiment is reallocated.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! In production, it is recommended to fall back to a default variation on any error, as feature
//! flag evaluation should not be critical enough to cause system crashes. Lookup misses (see
//! [`Error::is_lookup_miss`]) are normal running conditions; other errors usually indicate that
//! developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages
//! under the `flagline` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into client operations.
//!
//! # Examples
//!
//! ```no_run
//! use flagline::{ClientConfig, CustomData};
//!
//! let client = ClientConfig::from_site_code("site-code")
//!     .environment("production")
//!     .to_client()
//!     .unwrap();
//! client.wait_init().unwrap();
//!
//! let visitor_code = flagline::generate_visitor_code();
//! client
//!     .add_data(&visitor_code, [CustomData::new(1, ["premium"]).into()])
//!     .unwrap();
//! let show_banner = client
//!     .is_feature_active(&visitor_code, "summer-banner", true)
//!     .unwrap_or(false);
//! # let _ = show_banner;
//! client.close().unwrap();
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod background;
pub mod bucketing;
mod client;
mod config;
mod configuration;
mod configuration_store;
mod error;
mod eval;
mod registry;
mod synchronizer;
mod targeting;
mod tracking;
mod transport;
mod update_listener;
mod visitor;
mod visitor_code;

pub use client::Client;
pub use config::ClientConfig;
pub use configuration::{ConsentBlocking, Configuration, RuleType, Settings, VariableValue};
pub use error::{Error, Result};
pub use eval::Variation;
pub use registry::ClientRegistry;
pub use transport::{HttpTransport, RealtimeStream, ServiceUrls, Transport};
pub use update_listener::{ConfigurationUpdate, UpdateListener};
pub use visitor::{
    AssignedVariation, Browser, BrowserType, Conversion, Cookie, CustomData, Data, Device,
    DeviceType, Geolocation, OperatingSystem, OperatingSystemType, PageView, VisitorVisits,
};
pub use visitor_code::{generate_visitor_code, validate_visitor_code, MAX_VISITOR_CODE_LENGTH};
