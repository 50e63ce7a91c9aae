//! Wire format of the configuration document, as served by the configuration endpoint.
use serde::{Deserialize, Serialize};

use crate::visitor::{BrowserType, DeviceType, OperatingSystemType};

/// Configuration document as received from the server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigurationWire {
    /// Server timestamp of the document. Updates older than the applied one are discarded.
    #[serde(default)]
    pub timestamp: i64,
    /// Flags are wrapped in `TryParse` so that one malformed flag does not make the whole
    /// configuration unusable.
    #[serde(default)]
    pub feature_flags: Vec<TryParse<FeatureFlagWire>>,
    #[serde(default)]
    pub holdout: Option<ExperimentWire>,
    #[serde(default)]
    pub settings: SettingsWire,
    /// Segments are isolated the same way: a rule referencing a segment that failed to parse
    /// never matches.
    #[serde(default)]
    pub segments: Vec<TryParse<SegmentWire>>,
    #[serde(default)]
    pub custom_data: Vec<CustomDataInfoWire>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Result<T, serde_json::Value> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Ok(v),
            TryParse::ParseFailed(v) => Err(v),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeatureFlagWire {
    pub id: u32,
    pub feature_key: String,
    #[serde(default)]
    pub variations: Vec<FlagVariationWire>,
    #[serde(default = "default_variation_key")]
    pub default_variation_key: String,
    #[serde(default = "default_true")]
    pub environment_enabled: bool,
    #[serde(default)]
    pub rules: Vec<RuleWire>,
    #[serde(default)]
    pub me_group_name: Option<String>,
    #[serde(default)]
    pub bucketing_custom_data_index: Option<u32>,
}

fn default_variation_key() -> String {
    crate::configuration::OFF_VARIATION_KEY.to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FlagVariationWire {
    pub key: String,
    #[serde(default)]
    pub variables: Vec<VariableWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VariableWire {
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    pub value: serde_json::Value,
}

/// Declared type of a feature variable.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum VariableType {
    Boolean,
    Number,
    String,
    Json,
    Js,
    Css,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuleWire {
    pub id: u32,
    pub order: i32,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub segment_id: Option<u32>,
    pub exposition: f64,
    pub experiment_id: u32,
    #[serde(default)]
    pub respool_time: Option<i64>,
    #[serde(default)]
    pub variation_by_exposition: Vec<VariationByExpositionWire>,
}

/// Kind of rule. Determines how a matched rule picks a variation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Bucket exposed visitors into one of several variations by weight.
    Experimentation,
    /// Roll out a single variation to exposed visitors.
    TargetedDelivery,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VariationByExpositionWire {
    #[serde(default)]
    pub variation_id: Option<u32>,
    pub variation_key: String,
    pub exposition: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExperimentWire {
    pub id: u32,
    #[serde(default)]
    pub variation_by_exposition: Vec<VariationByExpositionWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SettingsWire {
    #[serde(default)]
    pub real_time_update: bool,
    #[serde(default)]
    pub consent_type: ConsentType,
    #[serde(default)]
    pub consent_opt_out_behavior: ConsentBlocking,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ConsentType {
    Required,
    #[default]
    NotRequired,
}

/// What a visitor without legal consent is still allowed to get when consent is required.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentBlocking {
    /// Evaluation runs normally, only tracking is restricted.
    #[default]
    PartiallyBlocked,
    /// Experimentation rules are skipped; only targeted delivery applies.
    CompletelyBlocked,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentWire {
    pub id: u32,
    #[serde(default)]
    pub conditions_data: ConditionsDataWire,
}

/// Two-level condition expression: first-level groups joined by `first_level_or_operators`,
/// each group a list of conditions joined by its own `or_operators`. `or_operators[i]` joins
/// operand `i` and `i + 1`; `false` means AND.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConditionsDataWire {
    #[serde(default)]
    pub first_level_or_operators: Vec<bool>,
    #[serde(default)]
    pub first_level: Vec<ConditionGroupWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConditionGroupWire {
    #[serde(default)]
    pub or_operators: Vec<bool>,
    /// A malformed condition is kept as `ParseFailed` and never matches.
    #[serde(default)]
    pub conditions: Vec<TryParse<ConditionWire>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConditionWire {
    #[serde(default = "default_true")]
    pub is_include: bool,
    #[serde(flatten)]
    pub kind: ConditionKindWire,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MatchType {
    Exact,
    Contains,
    RegularExpression,
    Lower,
    Equal,
    Greater,
    True,
    False,
    Undefined,
    AmongValues,
    Any,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum VisitKind {
    First,
    Last,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "targetingType", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ConditionKindWire {
    #[serde(rename_all = "camelCase")]
    CustomDatum {
        index: u32,
        value_match_type: MatchType,
        #[serde(default)]
        value: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PageUrl { match_type: MatchType, url: String },
    #[serde(rename_all = "camelCase")]
    PageTitle { match_type: MatchType, title: String },
    #[serde(rename_all = "camelCase")]
    PreviousPage { match_type: MatchType, url: String },
    #[serde(rename_all = "camelCase")]
    PageViews { match_type: MatchType, page_count: u32 },
    #[serde(rename_all = "camelCase")]
    DeviceType { device: DeviceType },
    #[serde(rename_all = "camelCase")]
    Browser {
        browser: BrowserType,
        #[serde(default)]
        version: Option<f64>,
        #[serde(default)]
        version_match_type: Option<MatchType>,
    },
    #[serde(rename_all = "camelCase")]
    OperatingSystem { os: OperatingSystemType },
    #[serde(rename_all = "camelCase")]
    Cookie {
        name: String,
        name_match_type: MatchType,
        value: String,
        value_match_type: MatchType,
    },
    #[serde(rename_all = "camelCase")]
    Geolocation {
        country: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        city: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SdkLanguage {
        sdk_language: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        version_match_type: Option<MatchType>,
    },
    #[serde(rename_all = "camelCase")]
    Segment { segment_id: u32 },
    #[serde(rename_all = "camelCase")]
    Conversions {
        #[serde(default)]
        goal_id: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    TargetExperiment {
        experiment_id: u32,
        #[serde(default)]
        variation_id: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    TargetFeatureFlag {
        feature_flag_id: u32,
        #[serde(default)]
        variation_key: Option<String>,
        #[serde(default)]
        rule_id: Option<u32>,
    },
    ExclusiveExperiment,
    ExclusiveFeatureFlag,
    #[serde(rename_all = "camelCase")]
    VisitorCode { match_type: MatchType, value: String },
    #[serde(rename_all = "camelCase")]
    TimeElapsedSinceVisit {
        visit: VisitKind,
        match_type: MatchType,
        seconds: i64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CustomDataInfoWire {
    pub index: u32,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub is_mapping_identifier: bool,
}

/// Extract a flag key from a flag that failed to parse, so requests for it report a parse error
/// rather than a missing flag.
pub(crate) fn raw_feature_key(value: &serde_json::Value) -> Option<&str> {
    value.get("featureKey")?.as_str()
}
