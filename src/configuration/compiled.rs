use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{targeting::Segment, Error, Result};

use super::models::{
    ConfigurationWire, ConsentBlocking, ConsentType, ExperimentWire, FeatureFlagWire,
    FlagVariationWire, RuleType, RuleWire, VariableType, VariableWire, VariationByExpositionWire,
};

/// Remote configuration of the client: an immutable snapshot compiled from the configuration
/// document.
#[derive(Debug)]
pub struct Configuration {
    /// Server timestamp of the document.
    timestamp: i64,
    /// When the document was fetched by this client.
    fetched_at: DateTime<Utc>,
    feature_flags: Vec<FeatureFlag>,
    /// Flag key to position in `feature_flags`. Flags that failed to parse store the error.
    flag_index: HashMap<String, std::result::Result<usize, Error>>,
    flag_ids: HashMap<u32, usize>,
    /// Experiment id to (flag position, rule position).
    experiments: HashMap<u32, (usize, usize)>,
    holdout: Option<Holdout>,
    settings: Settings,
    segments: HashMap<u32, Segment>,
    custom_data: HashMap<u32, CustomDataInfo>,
    /// Mutual exclusion group name to flag positions, sorted by flag id.
    me_groups: HashMap<String, Vec<usize>>,
}

/// Account-level settings delivered with the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings {
    /// Whether the client should subscribe to real-time configuration updates.
    pub real_time_update: bool,
    /// Whether visitors must give legal consent before they are tracked.
    pub consent_required: bool,
    /// What visitors without consent still get when consent is required.
    pub consent_blocking: ConsentBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CustomDataInfo {
    pub index: u32,
    /// Stored on the visitor for targeting, never sent.
    pub local_only: bool,
    /// Values at this index identify the visitor across devices.
    pub is_mapping_identifier: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct FeatureFlag {
    pub id: u32,
    pub key: String,
    pub variations: Vec<FlagVariation>,
    pub default_variation_key: String,
    pub environment_enabled: bool,
    /// Sorted by ascending order.
    pub rules: Vec<Rule>,
    pub me_group_name: Option<String>,
    pub bucketing_custom_data_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct FlagVariation {
    pub key: String,
    pub variables: HashMap<String, VariableValue>,
}

#[derive(Debug, Clone)]
pub(crate) struct Rule {
    pub id: u32,
    pub order: i32,
    pub rule_type: RuleType,
    pub segment_id: Option<u32>,
    pub exposition: f64,
    pub experiment_id: u32,
    /// Unix seconds. Assignments made before it are discarded and the visitor is re-bucketed.
    pub respool_time: Option<i64>,
    pub variations: Vec<VariationByExposition>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VariationByExposition {
    pub variation_id: Option<u32>,
    pub variation_key: String,
    pub exposition: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct Holdout {
    pub id: u32,
    pub variations: Vec<VariationByExposition>,
}

/// Typed value of a feature variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// A boolean.
    Boolean(bool),
    /// A number.
    Number(f64),
    /// A string. JavaScript and CSS snippets are served as strings too.
    String(String),
    /// A decoded JSON document.
    Json(serde_json::Value),
}

impl Configuration {
    /// Parse and compile a configuration document.
    pub fn from_json(json: &[u8]) -> Result<Configuration> {
        let wire: ConfigurationWire = serde_json::from_slice(json).map_err(|err| {
            log::warn!(target: "flagline", "failed to parse configuration: {err:?}");
            Error::from(err)
        })?;
        Ok(compile_configuration(wire, Utc::now()))
    }

    /// Server timestamp of the configuration document.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// When the configuration was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Site-wide settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Keys of all feature flags, including disabled flags and flags that failed to parse.
    pub fn feature_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.flag_index.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys of flags enabled in the client's environment.
    pub fn active_feature_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .feature_flags
            .iter()
            .filter(|flag| flag.environment_enabled)
            .map(|flag| flag.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn feature_flag(&self, key: &str) -> Result<&FeatureFlag> {
        match self.flag_index.get(key) {
            Some(Ok(position)) => Ok(&self.feature_flags[*position]),
            Some(Err(err)) => Err(err.clone()),
            None => Err(Error::FeatureNotFound(key.to_owned())),
        }
    }

    pub(crate) fn flag_by_id(&self, id: u32) -> Option<&FeatureFlag> {
        self.flag_ids.get(&id).map(|p| &self.feature_flags[*p])
    }

    pub(crate) fn rule_by_experiment(&self, experiment_id: u32) -> Option<(&FeatureFlag, &Rule)> {
        let (flag, rule) = self.experiments.get(&experiment_id)?;
        let flag = &self.feature_flags[*flag];
        Some((flag, &flag.rules[*rule]))
    }

    pub(crate) fn holdout(&self) -> Option<&Holdout> {
        self.holdout.as_ref()
    }

    pub(crate) fn segments(&self) -> &HashMap<u32, Segment> {
        &self.segments
    }

    /// Flags of a mutual exclusion group, sorted by id.
    pub(crate) fn me_group(&self, name: &str) -> impl Iterator<Item = &FeatureFlag> {
        self.me_groups
            .get(name)
            .into_iter()
            .flatten()
            .map(|p| &self.feature_flags[*p])
    }

    pub(crate) fn custom_data_info(&self, index: u32) -> Option<&CustomDataInfo> {
        self.custom_data.get(&index)
    }

    pub(crate) fn local_only_custom_data(&self) -> HashSet<u32> {
        self.custom_data
            .values()
            .filter(|info| info.local_only)
            .map(|info| info.index)
            .collect()
    }

    pub(crate) fn mapping_identifier_index(&self) -> Option<u32> {
        self.custom_data
            .values()
            .find(|info| info.is_mapping_identifier)
            .map(|info| info.index)
    }
}

impl FeatureFlag {
    pub fn variation(&self, key: &str) -> Option<&FlagVariation> {
        self.variations.iter().find(|v| v.key == key)
    }
}

impl Rule {
    /// Suffix appended to bucketing hashes so that changing the respool time re-buckets visitors.
    pub fn respool_suffix(&self) -> Option<String> {
        self.respool_time.map(|t| t.to_string())
    }

    pub fn variation_by_id(&self, variation_id: u32) -> Option<&VariationByExposition> {
        self.variations
            .iter()
            .find(|v| v.variation_id == Some(variation_id))
    }
}

fn compile_configuration(wire: ConfigurationWire, fetched_at: DateTime<Utc>) -> Configuration {
    let mut feature_flags = Vec::new();
    let mut flag_index = HashMap::new();
    for flag in wire.feature_flags {
        match std::result::Result::<FeatureFlagWire, serde_json::Value>::from(flag) {
            Ok(flag) => {
                flag_index.insert(flag.feature_key.clone(), Ok(feature_flags.len()));
                feature_flags.push(compile_flag(flag));
            }
            Err(raw) => {
                let Some(key) = super::models::raw_feature_key(&raw) else {
                    log::warn!(target: "flagline", "skipping unparsable feature flag without a key");
                    continue;
                };
                log::warn!(target: "flagline", feature_key = key; "failed to parse feature flag");
                flag_index.insert(
                    key.to_owned(),
                    Err(Error::ConfigurationParseError(key.to_owned())),
                );
            }
        }
    }

    let flag_ids = feature_flags
        .iter()
        .enumerate()
        .map(|(position, flag)| (flag.id, position))
        .collect();

    let mut experiments = HashMap::new();
    let mut me_groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (position, flag) in feature_flags.iter().enumerate() {
        for (rule_position, rule) in flag.rules.iter().enumerate() {
            experiments.insert(rule.experiment_id, (position, rule_position));
        }
        if let Some(group) = &flag.me_group_name {
            me_groups.entry(group.clone()).or_default().push(position);
        }
    }
    for group in me_groups.values_mut() {
        group.sort_by_key(|position| feature_flags[*position].id);
    }

    let segments = wire
        .segments
        .into_iter()
        .filter_map(|segment| match std::result::Result::from(segment) {
            Ok(segment) => Some(Segment::from(segment)),
            Err(raw) => {
                log::warn!(target: "flagline", "failed to parse segment: {raw}");
                None
            }
        })
        .map(|segment| (segment.id, segment))
        .collect();

    let custom_data = wire
        .custom_data
        .into_iter()
        .map(|info| {
            (
                info.index,
                CustomDataInfo {
                    index: info.index,
                    local_only: info.local_only,
                    is_mapping_identifier: info.is_mapping_identifier,
                },
            )
        })
        .collect();

    Configuration {
        timestamp: wire.timestamp,
        fetched_at,
        feature_flags,
        flag_index,
        flag_ids,
        experiments,
        holdout: wire.holdout.map(compile_holdout),
        settings: Settings {
            real_time_update: wire.settings.real_time_update,
            consent_required: wire.settings.consent_type == ConsentType::Required,
            consent_blocking: wire.settings.consent_opt_out_behavior,
        },
        segments,
        custom_data,
        me_groups,
    }
}

fn compile_flag(flag: FeatureFlagWire) -> FeatureFlag {
    let variations = flag
        .variations
        .into_iter()
        .map(|variation| compile_variation(&flag.feature_key, variation))
        .collect();

    let mut rules: Vec<Rule> = flag.rules.into_iter().map(compile_rule).collect();
    rules.sort_by_key(|rule| rule.order);

    FeatureFlag {
        id: flag.id,
        key: flag.feature_key,
        variations,
        default_variation_key: flag.default_variation_key,
        environment_enabled: flag.environment_enabled,
        rules,
        me_group_name: flag.me_group_name,
        bucketing_custom_data_index: flag.bucketing_custom_data_index,
    }
}

fn compile_variation(feature_key: &str, variation: FlagVariationWire) -> FlagVariation {
    let variables = variation
        .variables
        .into_iter()
        .filter_map(|variable| {
            let key = variable.key.clone();
            match compile_variable(variable) {
                Some(value) => Some((key, value)),
                None => {
                    log::warn!(target: "flagline", feature_key, variable_key = key.as_str(); "variable value does not match its type");
                    None
                }
            }
        })
        .collect();
    FlagVariation {
        key: variation.key,
        variables,
    }
}

fn compile_variable(variable: VariableWire) -> Option<VariableValue> {
    use serde_json::Value;

    match (variable.variable_type, variable.value) {
        (VariableType::Boolean, Value::Bool(b)) => Some(VariableValue::Boolean(b)),
        (VariableType::Number, Value::Number(n)) => n.as_f64().map(VariableValue::Number),
        (VariableType::String | VariableType::Js | VariableType::Css, Value::String(s)) => {
            Some(VariableValue::String(s))
        }
        (VariableType::Json, Value::String(s)) => {
            serde_json::from_str(&s).ok().map(VariableValue::Json)
        }
        (VariableType::Json, value @ (Value::Object(_) | Value::Array(_))) => {
            Some(VariableValue::Json(value))
        }
        _ => None,
    }
}

fn compile_rule(rule: RuleWire) -> Rule {
    Rule {
        id: rule.id,
        order: rule.order,
        rule_type: rule.rule_type,
        segment_id: rule.segment_id,
        exposition: rule.exposition,
        experiment_id: rule.experiment_id,
        respool_time: rule.respool_time,
        variations: rule
            .variation_by_exposition
            .into_iter()
            .map(compile_variation_by_exposition)
            .collect(),
    }
}

fn compile_holdout(holdout: ExperimentWire) -> Holdout {
    Holdout {
        id: holdout.id,
        variations: holdout
            .variation_by_exposition
            .into_iter()
            .map(compile_variation_by_exposition)
            .collect(),
    }
}

fn compile_variation_by_exposition(wire: VariationByExpositionWire) -> VariationByExposition {
    VariationByExposition {
        variation_id: wire.variation_id,
        variation_key: wire.variation_key,
        exposition: wire.exposition,
    }
}
