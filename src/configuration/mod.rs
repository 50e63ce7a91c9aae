//! Remote configuration: wire format and compiled snapshot.
mod compiled;
pub(crate) mod models;

pub use compiled::{Configuration, Settings, VariableValue};
pub(crate) use compiled::{FeatureFlag, Rule};
pub use models::{ConsentBlocking, RuleType};

/// Variation key served when no rule applies and the flag declares no other default.
pub const OFF_VARIATION_KEY: &str = "off";

/// Holdout variation key excluding a visitor from all flag evaluation.
pub const HOLDOUT_VARIATION_KEY: &str = "in-holdout";
