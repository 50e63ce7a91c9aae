use std::collections::HashSet;

use regex::Regex;
use semver::Version;

use crate::{
    configuration::{
        models::{ConditionKindWire, ConditionWire, MatchType, VisitKind},
        RuleType,
    },
    visitor::{BrowserType, DeviceType, OperatingSystemType},
};

use super::{
    data::{AssignmentsView, TargetingData, TargetingDataSource, TargetingType},
    MAX_SEGMENT_DEPTH,
};

/// A compiled targeting condition.
#[derive(Debug, Clone)]
pub(crate) struct Condition {
    /// When `false`, the result of `kind` is negated.
    pub include: bool,
    pub kind: ConditionKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ConditionKind {
    CustomDatum {
        index: u32,
        matcher: CustomDatumMatcher,
    },
    PageUrl(StringMatcher),
    PageTitle(StringMatcher),
    /// Matches the URL of the page viewed before the current one.
    PreviousPage(StringMatcher),
    PageViews {
        comparison: Comparison,
        count: u32,
    },
    DeviceType(DeviceType),
    Browser {
        browser: BrowserType,
        version: Option<(Comparison, f64)>,
    },
    OperatingSystem(OperatingSystemType),
    Cookie {
        name: StringMatcher,
        value: StringMatcher,
    },
    Geolocation {
        country: String,
        region: Option<String>,
        city: Option<String>,
    },
    SdkLanguage {
        language: String,
        version: Option<(Comparison, Version)>,
    },
    Segment(u32),
    Conversions {
        goal_id: Option<u32>,
    },
    TargetExperiment {
        experiment_id: u32,
        variation_id: Option<u32>,
    },
    TargetFeatureFlag {
        flag_id: u32,
        variation_key: Option<String>,
        rule_id: Option<u32>,
    },
    ExclusiveExperiment,
    ExclusiveFeatureFlag,
    VisitorCode(StringMatcher),
    TimeElapsedSinceVisit {
        visit: VisitKind,
        comparison: Comparison,
        seconds: i64,
    },
    /// Condition kind this client does not know. Always satisfied.
    Unknown,
    /// Misconfigured condition. Never satisfied, even when negated.
    Invalid,
}

#[derive(Debug, Clone)]
pub(crate) enum StringMatcher {
    Exact(String),
    Contains(String),
    Regex(Regex),
    /// Misconfigured matcher (invalid pattern or match type). Matches nothing.
    Never,
}

impl StringMatcher {
    pub fn new(match_type: MatchType, pattern: String) -> StringMatcher {
        match match_type {
            MatchType::Exact => StringMatcher::Exact(pattern),
            MatchType::Contains => StringMatcher::Contains(pattern),
            MatchType::RegularExpression => match Regex::new(&pattern) {
                Ok(regex) => StringMatcher::Regex(regex),
                Err(err) => {
                    log::warn!(target: "flagline", pattern; "invalid regular expression in condition: {err}");
                    StringMatcher::Never
                }
            },
            other => {
                log::warn!(target: "flagline", "unsupported string match type: {other:?}");
                StringMatcher::Never
            }
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringMatcher::Exact(pattern) => value == pattern,
            StringMatcher::Contains(pattern) => value.contains(pattern.as_str()),
            StringMatcher::Regex(regex) => regex.is_match(value),
            StringMatcher::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Less,
    Equal,
    Greater,
}

impl Comparison {
    fn from_match_type(match_type: MatchType) -> Option<Comparison> {
        match match_type {
            MatchType::Lower => Some(Comparison::Less),
            MatchType::Equal => Some(Comparison::Equal),
            MatchType::Greater => Some(Comparison::Greater),
            _ => None,
        }
    }

    /// Whether `value` stands in this relation to `target`.
    pub fn holds<T: PartialOrd>(self, value: T, target: T) -> bool {
        match self {
            Comparison::Less => value < target,
            Comparison::Equal => value == target,
            Comparison::Greater => value > target,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CustomDatumMatcher {
    Text(StringMatcher),
    Number(Comparison, f64),
    Boolean(bool),
    /// Satisfied when the visitor has no value for the index.
    Undefined,
    AmongValues(HashSet<String>),
    Invalid,
}

impl CustomDatumMatcher {
    fn new(match_type: MatchType, value: Option<String>) -> CustomDatumMatcher {
        let value = value.unwrap_or_default();
        match match_type {
            MatchType::Exact | MatchType::Contains | MatchType::RegularExpression => {
                CustomDatumMatcher::Text(StringMatcher::new(match_type, value))
            }
            MatchType::Lower | MatchType::Equal | MatchType::Greater => {
                match (Comparison::from_match_type(match_type), value.trim().parse()) {
                    (Some(comparison), Ok(number)) => CustomDatumMatcher::Number(comparison, number),
                    _ => {
                        log::warn!(target: "flagline", value; "custom data condition expects a number");
                        CustomDatumMatcher::Invalid
                    }
                }
            }
            MatchType::True => CustomDatumMatcher::Boolean(true),
            MatchType::False => CustomDatumMatcher::Boolean(false),
            MatchType::Undefined => CustomDatumMatcher::Undefined,
            MatchType::AmongValues => match parse_among_values(&value) {
                Some(values) => CustomDatumMatcher::AmongValues(values),
                None => {
                    log::warn!(target: "flagline", value; "custom data condition expects a JSON array");
                    CustomDatumMatcher::Invalid
                }
            },
            MatchType::Any => CustomDatumMatcher::Invalid,
        }
    }

    fn matches(&self, values: &[String]) -> bool {
        match self {
            CustomDatumMatcher::Undefined => values.is_empty(),
            CustomDatumMatcher::Text(matcher) => values.iter().any(|v| matcher.matches(v)),
            CustomDatumMatcher::Number(comparison, target) => values
                .iter()
                .filter_map(|v| v.trim().parse::<f64>().ok())
                .any(|v| comparison.holds(v, *target)),
            CustomDatumMatcher::Boolean(expected) => values
                .iter()
                .any(|v| v.parse::<bool>().ok() == Some(*expected)),
            CustomDatumMatcher::AmongValues(set) => values.iter().any(|v| set.contains(v)),
            CustomDatumMatcher::Invalid => false,
        }
    }
}

/// Parse a JSON array into a set of strings. Numbers and booleans are normalized to their text.
fn parse_among_values(value: &str) -> Option<HashSet<String>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(value).ok()?;
    Some(
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect(),
    )
}

impl From<ConditionWire> for Condition {
    fn from(wire: ConditionWire) -> Condition {
        let kind = match wire.kind {
            ConditionKindWire::CustomDatum {
                index,
                value_match_type,
                value,
            } => ConditionKind::CustomDatum {
                index,
                matcher: CustomDatumMatcher::new(value_match_type, value),
            },
            ConditionKindWire::PageUrl { match_type, url } => {
                ConditionKind::PageUrl(StringMatcher::new(match_type, url))
            }
            ConditionKindWire::PageTitle { match_type, title } => {
                ConditionKind::PageTitle(StringMatcher::new(match_type, title))
            }
            ConditionKindWire::PreviousPage { match_type, url } => {
                ConditionKind::PreviousPage(StringMatcher::new(match_type, url))
            }
            ConditionKindWire::PageViews {
                match_type,
                page_count,
            } => match Comparison::from_match_type(match_type) {
                Some(comparison) => ConditionKind::PageViews {
                    comparison,
                    count: page_count,
                },
                None => invalid(match_type),
            },
            ConditionKindWire::DeviceType { device } => ConditionKind::DeviceType(device),
            ConditionKindWire::Browser {
                browser,
                version,
                version_match_type,
            } => ConditionKind::Browser {
                browser,
                version: version_match_type
                    .and_then(Comparison::from_match_type)
                    .zip(version),
            },
            ConditionKindWire::OperatingSystem { os } => ConditionKind::OperatingSystem(os),
            ConditionKindWire::Cookie {
                name,
                name_match_type,
                value,
                value_match_type,
            } => ConditionKind::Cookie {
                name: StringMatcher::new(name_match_type, name),
                value: StringMatcher::new(value_match_type, value),
            },
            ConditionKindWire::Geolocation {
                country,
                region,
                city,
            } => ConditionKind::Geolocation {
                country,
                region,
                city,
            },
            ConditionKindWire::SdkLanguage {
                sdk_language,
                version,
                version_match_type,
            } => ConditionKind::SdkLanguage {
                language: sdk_language,
                version: version_match_type
                    .and_then(Comparison::from_match_type)
                    .zip(version.and_then(|v| Version::parse(&v).ok())),
            },
            ConditionKindWire::Segment { segment_id } => ConditionKind::Segment(segment_id),
            ConditionKindWire::Conversions { goal_id } => ConditionKind::Conversions { goal_id },
            ConditionKindWire::TargetExperiment {
                experiment_id,
                variation_id,
            } => ConditionKind::TargetExperiment {
                experiment_id,
                variation_id,
            },
            ConditionKindWire::TargetFeatureFlag {
                feature_flag_id,
                variation_key,
                rule_id,
            } => ConditionKind::TargetFeatureFlag {
                flag_id: feature_flag_id,
                variation_key,
                rule_id,
            },
            ConditionKindWire::ExclusiveExperiment => ConditionKind::ExclusiveExperiment,
            ConditionKindWire::ExclusiveFeatureFlag => ConditionKind::ExclusiveFeatureFlag,
            ConditionKindWire::VisitorCode { match_type, value } => {
                ConditionKind::VisitorCode(StringMatcher::new(match_type, value))
            }
            ConditionKindWire::TimeElapsedSinceVisit {
                visit,
                match_type,
                seconds,
            } => match Comparison::from_match_type(match_type) {
                Some(comparison) => ConditionKind::TimeElapsedSinceVisit {
                    visit,
                    comparison,
                    seconds,
                },
                None => invalid(match_type),
            },
            ConditionKindWire::Unknown => {
                log::warn!(target: "flagline", "unknown targeting condition is treated as satisfied");
                ConditionKind::Unknown
            }
        };
        Condition {
            include: wire.is_include,
            kind,
        }
    }
}

fn invalid(match_type: MatchType) -> ConditionKind {
    log::warn!(target: "flagline", "unsupported comparison match type: {match_type:?}");
    ConditionKind::Invalid
}

impl Condition {
    /// A condition that could not be read from the configuration.
    pub fn invalid() -> Condition {
        Condition {
            include: true,
            kind: ConditionKind::Invalid,
        }
    }

    pub fn targeting_type(&self) -> TargetingType {
        self.kind.targeting_type()
    }

    /// Evaluate the condition against the visitor. `depth` is the current nesting depth of
    /// segment references.
    pub fn check(&self, source: &dyn TargetingDataSource, depth: usize) -> bool {
        match self.kind {
            ConditionKind::Unknown => return true,
            ConditionKind::Invalid => return false,
            _ => {}
        }
        let data = source.targeting_data(self.targeting_type());
        let result = self.kind.check(data, source, depth);
        result == self.include
    }
}

impl ConditionKind {
    fn targeting_type(&self) -> TargetingType {
        match self {
            ConditionKind::CustomDatum { .. } => TargetingType::CustomData,
            ConditionKind::PageUrl(_)
            | ConditionKind::PageTitle(_)
            | ConditionKind::PreviousPage(_)
            | ConditionKind::PageViews { .. } => TargetingType::PageViews,
            ConditionKind::DeviceType(_) => TargetingType::Device,
            ConditionKind::Browser { .. } => TargetingType::Browser,
            ConditionKind::OperatingSystem(_) => TargetingType::OperatingSystem,
            ConditionKind::Cookie { .. } => TargetingType::Cookie,
            ConditionKind::Geolocation { .. } => TargetingType::Geolocation,
            ConditionKind::SdkLanguage { .. } => TargetingType::Sdk,
            ConditionKind::Segment(_) => TargetingType::Segments,
            ConditionKind::Conversions { .. } => TargetingType::Conversions,
            ConditionKind::TargetExperiment { .. }
            | ConditionKind::TargetFeatureFlag { .. }
            | ConditionKind::ExclusiveExperiment
            | ConditionKind::ExclusiveFeatureFlag => TargetingType::Assignments,
            ConditionKind::VisitorCode(_) => TargetingType::VisitorCode,
            ConditionKind::TimeElapsedSinceVisit { .. } => TargetingType::Visits,
            ConditionKind::Unknown | ConditionKind::Invalid => TargetingType::None,
        }
    }

    /// Returns `false` when the data source produced data of an unexpected kind.
    fn check(
        &self,
        data: TargetingData<'_>,
        source: &dyn TargetingDataSource,
        depth: usize,
    ) -> bool {
        match (self, data) {
            (ConditionKind::CustomDatum { index, matcher }, TargetingData::CustomData(data)) => {
                let values = data.get(index).map_or(&[][..], |d| d.values.as_slice());
                matcher.matches(values)
            }
            (ConditionKind::PageUrl(matcher), TargetingData::PageViews(views)) => views
                .iter()
                .any(|visit| matcher.matches(&visit.page_view.url)),
            (ConditionKind::PageTitle(matcher), TargetingData::PageViews(views)) => views
                .iter()
                .any(|visit| matcher.matches(&visit.page_view.title)),
            (ConditionKind::PreviousPage(matcher), TargetingData::PageViews(views)) => views
                .len()
                .checked_sub(2)
                .and_then(|i| views.get(i))
                .is_some_and(|visit| matcher.matches(&visit.page_view.url)),
            (ConditionKind::PageViews { comparison, count }, TargetingData::PageViews(views)) => {
                let total: u32 = views.iter().map(|visit| visit.count).sum();
                comparison.holds(total, *count)
            }
            (ConditionKind::DeviceType(expected), TargetingData::Device(device)) => {
                device.is_some_and(|d| d.device_type == *expected)
            }
            (ConditionKind::Browser { browser, version }, TargetingData::Browser(actual)) => {
                let Some(actual) = actual else {
                    return false;
                };
                if actual.browser_type != *browser {
                    return false;
                }
                match version {
                    None => true,
                    Some((comparison, target)) => actual
                        .version
                        .is_some_and(|v| comparison.holds(v, *target)),
                }
            }
            (ConditionKind::OperatingSystem(expected), TargetingData::OperatingSystem(os)) => {
                os.is_some_and(|os| os.os_type == *expected)
            }
            (ConditionKind::Cookie { name, value }, TargetingData::Cookie(cookie)) => cookie
                .is_some_and(|cookie| {
                    cookie
                        .cookies
                        .iter()
                        .any(|(k, v)| name.matches(k) && value.matches(v))
                }),
            (
                ConditionKind::Geolocation {
                    country,
                    region,
                    city,
                },
                TargetingData::Geolocation(geolocation),
            ) => geolocation.is_some_and(|geo| {
                fn same(expected: &Option<String>, actual: &Option<String>) -> bool {
                    match (expected, actual) {
                        (None, _) => true,
                        (Some(e), Some(a)) => e.eq_ignore_ascii_case(a),
                        (Some(_), None) => false,
                    }
                }
                geo.country.eq_ignore_ascii_case(country)
                    && same(region, &geo.region)
                    && same(city, &geo.city)
            }),
            (
                ConditionKind::SdkLanguage { language, version },
                TargetingData::Sdk {
                    name,
                    version: actual,
                },
            ) => {
                if !language.eq_ignore_ascii_case(name) {
                    return false;
                }
                match version {
                    None => true,
                    Some((comparison, target)) => Version::parse(actual)
                        .is_ok_and(|actual| comparison.holds(&actual, target)),
                }
            }
            (ConditionKind::Segment(id), TargetingData::Segments(segments)) => {
                if depth >= MAX_SEGMENT_DEPTH {
                    log::warn!(target: "flagline", segment_id = id; "segment nesting is too deep");
                    return false;
                }
                segments
                    .get(id)
                    .is_some_and(|segment| segment.check(source, depth + 1))
            }
            (ConditionKind::Conversions { goal_id }, TargetingData::Conversions(goals)) => {
                goal_id.map_or(!goals.is_empty(), |id| goals.contains(&id))
            }
            (
                ConditionKind::TargetExperiment {
                    experiment_id,
                    variation_id,
                },
                TargetingData::Assignments(view),
            ) => view.assignments.get(experiment_id).is_some_and(|a| {
                variation_id.map_or(true, |expected| a.variation_id == expected)
            }),
            (
                ConditionKind::TargetFeatureFlag {
                    flag_id,
                    variation_key,
                    rule_id,
                },
                TargetingData::Assignments(view),
            ) => check_target_feature_flag(view, *flag_id, variation_key.as_deref(), *rule_id),
            (ConditionKind::ExclusiveExperiment, TargetingData::Assignments(view)) => {
                view.assignments.values().all(|a| {
                    is_holdout(view, a.experiment_id)
                        || a.rule_type == RuleType::TargetedDelivery
                        || is_current_flag(view, a.experiment_id)
                })
            }
            (ConditionKind::ExclusiveFeatureFlag, TargetingData::Assignments(view)) => view
                .assignments
                .values()
                .all(|a| is_holdout(view, a.experiment_id) || is_current_flag(view, a.experiment_id)),
            (ConditionKind::VisitorCode(matcher), TargetingData::VisitorCode(code)) => {
                matcher.matches(code)
            }
            (
                ConditionKind::TimeElapsedSinceVisit {
                    visit,
                    comparison,
                    seconds,
                },
                TargetingData::Visits { visits, now },
            ) => {
                let timestamp = visits.and_then(|visits| match visit {
                    VisitKind::First => visits.first(),
                    VisitKind::Last => visits.last(),
                });
                timestamp.is_some_and(|ts| comparison.holds(now - ts, *seconds))
            }
            (ConditionKind::Unknown, _) => true,
            _ => false,
        }
    }
}

fn is_holdout(view: AssignmentsView<'_>, experiment_id: u32) -> bool {
    view.configuration
        .holdout()
        .is_some_and(|holdout| holdout.id == experiment_id)
}

/// Whether experiment `experiment_id` runs in a rule of the flag being evaluated.
fn is_current_flag(view: AssignmentsView<'_>, experiment_id: u32) -> bool {
    let owner = view
        .configuration
        .rule_by_experiment(experiment_id)
        .map(|(flag, _)| flag.id);
    owner.is_some() && owner == view.current_flag
}

fn check_target_feature_flag(
    view: AssignmentsView<'_>,
    flag_id: u32,
    variation_key: Option<&str>,
    rule_id: Option<u32>,
) -> bool {
    let Some(flag) = view.configuration.flag_by_id(flag_id) else {
        return false;
    };
    flag.rules
        .iter()
        .filter(|rule| rule_id.map_or(true, |id| rule.id == id))
        .any(|rule| {
            let Some(assignment) = view.assignments.get(&rule.experiment_id) else {
                return false;
            };
            match variation_key {
                None => true,
                Some(key) => rule.variations.iter().any(|v| {
                    v.variation_id == Some(assignment.variation_id) && v.variation_key == key
                }),
            }
        })
}
