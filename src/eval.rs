use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    bucketing::{hash_double, hash_double_with_salt, index_for, select_weighted},
    configuration::{
        ConsentBlocking, Configuration, FeatureFlag, Rule, RuleType, VariableValue,
        HOLDOUT_VARIATION_KEY,
    },
    targeting::{AssignmentsView, TargetingData, TargetingDataSource, TargetingType},
    visitor::{state::VisitorState, AssignedVariation},
};

/// Name the client reports for SDK targeting.
pub(crate) const SDK_NAME: &str = "RUST";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Variation of a feature flag assigned to a visitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    /// Variation key. The flag's default variation key when no rule applied.
    pub key: String,
    /// Variation id, if the variation was selected by a rule.
    pub id: Option<u32>,
    /// Experiment of the rule that selected the variation.
    pub experiment_id: Option<u32>,
    /// Variables of the variation.
    pub variables: HashMap<String, VariableValue>,
}

impl Variation {
    fn new(
        flag: &FeatureFlag,
        key: &str,
        id: Option<u32>,
        experiment_id: Option<u32>,
    ) -> Variation {
        Variation {
            key: key.to_owned(),
            id,
            experiment_id,
            variables: flag
                .variation(key)
                .map(|v| v.variables.clone())
                .unwrap_or_default(),
        }
    }

    fn default_of(flag: &FeatureFlag) -> Variation {
        Variation::new(flag, &flag.default_variation_key, None, None)
    }
}

/// Result of a flag evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub variation: Variation,
    /// Whether an assignment of this evaluation awaits delivery.
    pub recorded: bool,
}

/// Visitor context exposed to targeting conditions.
pub(crate) struct TargetingContext<'a> {
    pub configuration: &'a Configuration,
    pub visitor_code: &'a str,
    pub state: &'a VisitorState,
    /// Id of the flag being evaluated.
    pub current_flag: Option<u32>,
    /// Unix seconds.
    pub now: i64,
}

impl TargetingDataSource for TargetingContext<'_> {
    fn targeting_data(&self, kind: TargetingType) -> TargetingData<'_> {
        match kind {
            TargetingType::CustomData => TargetingData::CustomData(self.state.custom_data()),
            TargetingType::PageViews => TargetingData::PageViews(self.state.page_views()),
            TargetingType::Device => TargetingData::Device(self.state.device()),
            TargetingType::Browser => TargetingData::Browser(self.state.browser()),
            TargetingType::OperatingSystem => {
                TargetingData::OperatingSystem(self.state.operating_system())
            }
            TargetingType::Cookie => TargetingData::Cookie(self.state.cookie()),
            TargetingType::Geolocation => TargetingData::Geolocation(self.state.geolocation()),
            TargetingType::Sdk => TargetingData::Sdk {
                name: SDK_NAME,
                version: SDK_VERSION,
            },
            TargetingType::Segments => TargetingData::Segments(self.configuration.segments()),
            TargetingType::Conversions => TargetingData::Conversions(self.state.converted_goals()),
            TargetingType::Assignments => TargetingData::Assignments(AssignmentsView {
                assignments: self.state.assignments(),
                configuration: self.configuration,
                current_flag: self.current_flag,
            }),
            TargetingType::VisitorCode => TargetingData::VisitorCode(self.visitor_code),
            TargetingType::Visits => TargetingData::Visits {
                visits: self.state.visits(),
                now: self.now,
            },
            TargetingType::None => TargetingData::None,
        }
    }
}

impl TargetingContext<'_> {
    /// Whether the visitor belongs to the rule's segment. A rule without a segment targets
    /// everyone; a rule referencing an unknown segment targets no one.
    fn matches(&self, rule: &Rule) -> bool {
        match rule.segment_id {
            None => true,
            Some(id) => self
                .configuration
                .segments()
                .get(&id)
                .is_some_and(|segment| segment.check(self, 0)),
        }
    }
}

/// Outcome of rule iteration.
struct Decision<'c> {
    rule: &'c Rule,
    variation_key: String,
    variation_id: Option<u32>,
}

/// Evaluate `flag` for a visitor, recording assignments on the visitor state. Without `track`
/// the assignments are recorded but not scheduled for delivery.
pub(crate) fn evaluate(
    configuration: &Configuration,
    flag: &FeatureFlag,
    visitor_code: &str,
    state: &mut VisitorState,
    now: DateTime<Utc>,
    track: bool,
) -> Evaluation {
    let now = now.timestamp();
    let identity = bucketing_identity(flag, visitor_code, state);
    let mut recorded = false;

    if let Some(holdout) = configuration.holdout() {
        let hash = hash_double(&identity, holdout.id, None);
        if let Some(selected) =
            select_weighted(holdout.variations.iter().map(|v| (v, v.exposition)), hash)
        {
            if let Some(variation_id) = selected.variation_id {
                recorded |= state.record(
                    AssignedVariation {
                        experiment_id: holdout.id,
                        variation_id,
                        rule_type: RuleType::Experimentation,
                        assigned_at: now,
                    },
                    None,
                    false,
                    track,
                );
            }
            if selected.variation_key == HOLDOUT_VARIATION_KEY {
                log::trace!(target: "flagline", visitor_code, feature_key:display = flag.key; "visitor is in holdout");
                return Evaluation {
                    variation: Variation::default_of(flag),
                    recorded,
                };
            }
        }
    }

    if let Some(group) = &flag.me_group_name {
        let flags: Vec<&FeatureFlag> = configuration.me_group(group).collect();
        let selected = index_for(hash_double_with_salt(&identity, group), flags.len())
            .and_then(|i| flags.get(i));
        if selected.is_some_and(|selected| selected.id != flag.id) {
            log::trace!(target: "flagline", visitor_code, feature_key:display = flag.key; "flag excluded by mutual exclusion group");
            return Evaluation {
                variation: Variation::default_of(flag),
                recorded,
            };
        }
    }

    let decision = {
        let context = TargetingContext {
            configuration,
            visitor_code,
            state,
            current_flag: Some(flag.id),
            now,
        };
        decide(&context, flag, &identity)
    };

    let Some(decision) = decision else {
        return Evaluation {
            variation: Variation::default_of(flag),
            recorded,
        };
    };

    if let Some(variation_id) = decision.variation_id {
        recorded |= state.record(
            AssignedVariation {
                experiment_id: decision.rule.experiment_id,
                variation_id,
                rule_type: decision.rule.rule_type,
                assigned_at: now,
            },
            decision.rule.respool_time,
            true,
            track,
        );
    }

    Evaluation {
        variation: Variation::new(
            flag,
            &decision.variation_key,
            decision.variation_id,
            Some(decision.rule.experiment_id),
        ),
        recorded,
    }
}

/// Walk the rules in order and pick a variation.
fn decide<'c>(
    context: &TargetingContext<'_>,
    flag: &'c FeatureFlag,
    identity: &str,
) -> Option<Decision<'c>> {
    let state = context.state;
    let settings = context.configuration.settings();
    let experimentation_blocked = settings.consent_required
        && settings.consent_blocking == ConsentBlocking::CompletelyBlocked
        && !state.legal_consent();

    for rule in &flag.rules {
        let forced = state.forced_variation(rule.experiment_id);
        if let Some(forced) = forced.filter(|f| f.force_targeting) {
            return Some(forced_decision(flag, rule, &forced.variation_key));
        }

        if !context.matches(rule) {
            continue;
        }

        if let Some(forced) = forced {
            return Some(forced_decision(flag, rule, &forced.variation_key));
        }

        if rule.rule_type == RuleType::Experimentation {
            if experimentation_blocked {
                continue;
            }
            let stored = state
                .assignment(rule.experiment_id)
                .filter(|a| a.is_valid(rule.respool_time))
                .and_then(|a| rule.variation_by_id(a.variation_id));
            if let Some(stored) = stored {
                return Some(Decision {
                    rule,
                    variation_key: stored.variation_key.clone(),
                    variation_id: stored.variation_id,
                });
            }
        }

        let suffix = rule.respool_suffix();
        let exposed = hash_double(identity, rule.id, suffix.as_deref()) < rule.exposition;

        match rule.rule_type {
            RuleType::TargetedDelivery => {
                // A matched targeted delivery rule ends the iteration even without a variation.
                return if exposed {
                    rule.variations.first().map(|v| Decision {
                        rule,
                        variation_key: v.variation_key.clone(),
                        variation_id: v.variation_id,
                    })
                } else {
                    None
                };
            }
            RuleType::Experimentation => {
                if !exposed {
                    continue;
                }
                let hash = hash_double(identity, rule.experiment_id, suffix.as_deref());
                let selected =
                    select_weighted(rule.variations.iter().map(|v| (v, v.exposition)), hash);
                if let Some(selected) = selected {
                    return Some(Decision {
                        rule,
                        variation_key: selected.variation_key.clone(),
                        variation_id: selected.variation_id,
                    });
                }
            }
        }
    }
    None
}

fn forced_decision<'c>(flag: &FeatureFlag, rule: &'c Rule, variation_key: &str) -> Decision<'c> {
    let variation_id = rule
        .variations
        .iter()
        .find(|v| v.variation_key == variation_key)
        .and_then(|v| v.variation_id);
    if variation_id.is_none() && flag.variation(variation_key).is_none() {
        log::debug!(target: "flagline", feature_key:display = flag.key, variation_key; "forced variation is not part of the flag");
    }
    Decision {
        rule,
        variation_key: variation_key.to_owned(),
        variation_id,
    }
}

/// Identity used for hashing: the flag's bucketing custom data, else the cross-device mapping
/// identifier, else the visitor code.
fn bucketing_identity(flag: &FeatureFlag, visitor_code: &str, state: &VisitorState) -> String {
    flag.bucketing_custom_data_index
        .and_then(|index| state.custom_data().get(&index))
        .and_then(|data| data.values.first())
        .map(String::as_str)
        .or_else(|| state.mapping_identifier())
        .unwrap_or(visitor_code)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::visitor::{
        state::{CollectPolicy, ForcedVariation, TrackedItem},
        CustomData,
    };

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn configuration(json: serde_json::Value) -> Configuration {
        Configuration::from_json(json.to_string().as_bytes()).unwrap()
    }

    fn experiment_flag(extra: serde_json::Value) -> serde_json::Value {
        let mut flag = serde_json::json!({
            "id": 1,
            "featureKey": "f1",
            "variations": [
                {"key": "A", "variables": [{"key": "color", "type": "STRING", "value": "red"}]},
                {"key": "B"}
            ],
            "rules": [{
                "id": 10,
                "order": 1,
                "type": "EXPERIMENTATION",
                "exposition": 1.0,
                "experimentId": 100,
                "variationByExposition": [
                    {"variationId": 1, "variationKey": "A", "exposition": 0.5},
                    {"variationId": 2, "variationKey": "B", "exposition": 0.5}
                ]
            }]
        });
        if let (Some(flag), Some(extra)) = (flag.as_object_mut(), extra.as_object()) {
            flag.extend(extra.clone());
        }
        flag
    }

    /// A visitor code whose experiment hash for experiment 100 satisfies `pred`.
    fn visitor_with(pred: impl Fn(f64) -> bool) -> String {
        (0..)
            .map(|i| format!("visitor-{i}"))
            .find(|code| pred(hash_double(code, 100, None)))
            .unwrap()
    }

    fn eval(config: &Configuration, code: &str, state: &mut VisitorState) -> Evaluation {
        let flag = config.feature_flag("f1").unwrap();
        evaluate(config, flag, code, state, now(), true)
    }

    #[test]
    fn experiment_assignment_is_stable() {
        let config = configuration(serde_json::json!({"featureFlags": [experiment_flag(serde_json::json!({}))]}));
        let code = visitor_with(|h| h < 0.5);
        let mut state = VisitorState::default();

        let first = eval(&config, &code, &mut state);
        assert_eq!(first.variation.key, "A");
        assert_eq!(first.variation.id, Some(1));
        assert_eq!(first.variation.experiment_id, Some(100));
        assert_eq!(
            first.variation.variables.get("color"),
            Some(&VariableValue::String("red".into()))
        );
        assert!(first.recorded);

        // Re-evaluation reuses the stored assignment.
        let second = eval(&config, &code, &mut state);
        assert_eq!(second.variation.key, "A");
        assert!(!second.recorded);
    }

    #[test]
    fn respool_time_invalidates_assignment() {
        let config = configuration(serde_json::json!({"featureFlags": [experiment_flag(serde_json::json!({}))]}));
        let code = visitor_with(|h| h >= 0.5);
        let mut state = VisitorState::default();
        let t = now().timestamp();
        // Stored "A" under a respool threshold of t + 1: treated as absent.
        state.assign(
            AssignedVariation {
                experiment_id: 100,
                variation_id: 1,
                rule_type: RuleType::Experimentation,
                assigned_at: t,
            },
            true,
        );
        let mut json = experiment_flag(serde_json::json!({}));
        json["rules"][0]["respoolTime"] = serde_json::json!(t + 1);
        let respooled = configuration(serde_json::json!({"featureFlags": [json]}));

        let evaluation = eval(&respooled, &code, &mut state);
        assert!(evaluation.recorded);
        assert_eq!(state.assignment(100).unwrap().assigned_at, t);
        assert_eq!(
            Some(state.assignment(100).unwrap().variation_id),
            evaluation.variation.id
        );

        // Without respool the stored assignment is reused.
        let mut state = VisitorState::default();
        state.assign(
            AssignedVariation {
                experiment_id: 100,
                variation_id: 1,
                rule_type: RuleType::Experimentation,
                assigned_at: t,
            },
            true,
        );
        assert_eq!(eval(&config, &code, &mut state).variation.key, "A");
    }

    #[test]
    fn targeted_delivery_stops_iteration() {
        let config = configuration(serde_json::json!({"featureFlags": [{
            "id": 1,
            "featureKey": "f1",
            "defaultVariationKey": "default",
            "rules": [
                {"id": 1, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0, "experimentId": 100},
                {"id": 2, "order": 2, "type": "TARGETED_DELIVERY", "exposition": 1.0, "experimentId": 200,
                 "variationByExposition": [{"variationId": 5, "variationKey": "on", "exposition": 1.0}]}
            ]
        }]}));
        let mut state = VisitorState::default();
        let evaluation = eval(&config, "visitor", &mut state);
        assert_eq!(evaluation.variation.key, "default");
        assert_eq!(evaluation.variation.id, None);
        assert!(!evaluation.recorded);
    }

    #[test]
    fn repeated_targeted_delivery_is_recorded_once() {
        let config = configuration(serde_json::json!({"featureFlags": [{
            "id": 1,
            "featureKey": "f1",
            "rules": [
                {"id": 1, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0, "experimentId": 100,
                 "variationByExposition": [{"variationId": 5, "variationKey": "on", "exposition": 1.0}]}
            ]
        }]}));
        let mut state = VisitorState::default();
        assert!(eval(&config, "visitor", &mut state).recorded);
        assert!(!eval(&config, "visitor", &mut state).recorded);

        let outgoing = state.collect_unsent(&CollectPolicy::default());
        let assignments = outgoing
            .iter()
            .filter(|o| matches!(o.item, TrackedItem::Assignment(_)))
            .count();
        assert_eq!(assignments, 1);
    }

    #[test]
    fn untracked_assignment_is_held_until_tracked() {
        let config = configuration(serde_json::json!({"featureFlags": [experiment_flag(serde_json::json!({}))]}));
        let flag = config.feature_flag("f1").unwrap();
        let mut state = VisitorState::default();
        let policy = CollectPolicy::default();

        let untracked = evaluate(&config, flag, "visitor", &mut state, now(), false);
        assert!(!untracked.recorded);
        assert!(state.assignment(100).is_some());
        assert_eq!(state.collect_unsent(&policy)[0].item, TrackedItem::Activity);

        let tracked = evaluate(&config, flag, "visitor", &mut state, now(), true);
        assert!(tracked.recorded);
        assert_eq!(tracked.variation.key, untracked.variation.key);
        assert!(matches!(
            state.collect_unsent(&policy)[0].item,
            TrackedItem::Assignment(a) if a.experiment_id == 100
        ));
    }

    #[test]
    fn unknown_segment_never_matches() {
        let config = configuration(serde_json::json!({"featureFlags": [{
            "id": 1,
            "featureKey": "f1",
            "rules": [
                {"id": 1, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0, "experimentId": 100,
                 "segmentId": 77,
                 "variationByExposition": [{"variationId": 5, "variationKey": "on", "exposition": 1.0}]}
            ]
        }]}));
        let mut state = VisitorState::default();
        assert_eq!(eval(&config, "visitor", &mut state).variation.key, "off");
    }

    #[test]
    fn segment_gates_rule() {
        let config = configuration(serde_json::json!({
            "segments": [{"id": 3, "conditionsData": {"firstLevel": [{"conditions": [
                {"targetingType": "CUSTOM_DATUM", "index": 0, "valueMatchType": "EXACT", "value": "vip"}
            ]}]}}],
            "featureFlags": [{
                "id": 1,
                "featureKey": "f1",
                "rules": [
                    {"id": 1, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0, "experimentId": 100,
                     "segmentId": 3,
                     "variationByExposition": [{"variationId": 5, "variationKey": "on", "exposition": 1.0}]}
                ]
            }]
        }));
        let mut state = VisitorState::default();
        assert_eq!(eval(&config, "visitor", &mut state).variation.key, "off");

        state.add(CustomData::new(0, ["vip"]).into(), Some(&config));
        let evaluation = eval(&config, "visitor", &mut state);
        assert_eq!(evaluation.variation.key, "on");
        assert_eq!(state.assignment(100).unwrap().rule_type, RuleType::TargetedDelivery);
    }

    #[test]
    fn holdout_excludes_visitor() {
        let config = configuration(serde_json::json!({
            "holdout": {"id": 999, "variationByExposition": [
                {"variationId": 1, "variationKey": "in-holdout", "exposition": 1.0}
            ]},
            "featureFlags": [experiment_flag(serde_json::json!({}))]
        }));
        let mut state = VisitorState::default();
        let evaluation = eval(&config, "visitor", &mut state);
        assert_eq!(evaluation.variation.key, "off");
        assert!(evaluation.recorded);
        assert_eq!(state.assignment(999).unwrap().variation_id, 1);
        assert!(state.assignment(100).is_none());
    }

    #[test]
    fn forced_variation_overrides_rules() {
        let mut json = experiment_flag(serde_json::json!({}));
        json["rules"][0]["segmentId"] = serde_json::json!(404);
        let config = configuration(serde_json::json!({"featureFlags": [json]}));
        let mut state = VisitorState::default();

        // Not forcing targeting: the unknown segment still blocks the rule.
        state.set_forced_variation(
            100,
            Some(ForcedVariation {
                variation_key: "B".into(),
                force_targeting: false,
            }),
        );
        assert_eq!(eval(&config, "visitor", &mut state).variation.key, "off");

        state.set_forced_variation(
            100,
            Some(ForcedVariation {
                variation_key: "B".into(),
                force_targeting: true,
            }),
        );
        let evaluation = eval(&config, "visitor", &mut state);
        assert_eq!(evaluation.variation.key, "B");
        assert_eq!(evaluation.variation.id, Some(2));
    }

    #[test]
    fn consent_blocking_skips_experiments() {
        let config = configuration(serde_json::json!({
            "settings": {"consentType": "REQUIRED", "consentOptOutBehavior": "COMPLETELY_BLOCKED"},
            "featureFlags": [experiment_flag(serde_json::json!({}))]
        }));
        let mut state = VisitorState::default();
        assert_eq!(eval(&config, "visitor", &mut state).variation.key, "off");

        state.set_legal_consent(true);
        assert_ne!(eval(&config, "visitor", &mut state).variation.key, "off");
    }

    #[test]
    fn mutual_exclusion_selects_one_flag() {
        let config = configuration(serde_json::json!({"featureFlags": [
            experiment_flag(serde_json::json!({"id": 1, "featureKey": "f1", "meGroupName": "g"})),
            {
                "id": 2,
                "featureKey": "f2",
                "meGroupName": "g",
                "rules": [{"id": 20, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0,
                           "experimentId": 200,
                           "variationByExposition": [{"variationId": 7, "variationKey": "on", "exposition": 1.0}]}]
            }
        ]}));
        for i in 0..20 {
            let code = format!("visitor-{i}");
            let mut state = VisitorState::default();
            let f1 = evaluate(&config, config.feature_flag("f1").unwrap(), &code, &mut state, now(), true);
            let f2 = evaluate(&config, config.feature_flag("f2").unwrap(), &code, &mut state, now(), true);
            let in_first = hash_double_with_salt(&code, "g") < 0.5;
            assert_eq!(f1.variation.key != "off", in_first, "{code}");
            assert_eq!(f2.variation.key == "on", !in_first, "{code}");
        }
    }

    #[test]
    fn bucketing_identity_priority() {
        let config = configuration(serde_json::json!({
            "customData": [{"index": 2, "isMappingIdentifier": true}],
            "featureFlags": [experiment_flag(serde_json::json!({"bucketingCustomDataIndex": 5}))]
        }));
        let flag = config.feature_flag("f1").unwrap();
        let mut state = VisitorState::default();
        assert_eq!(bucketing_identity(flag, "code", &state), "code");

        state.add(CustomData::new(2, ["user-1"]).into(), Some(&config));
        assert_eq!(bucketing_identity(flag, "code", &state), "user-1");

        state.add(CustomData::new(5, ["account-9"]).into(), Some(&config));
        assert_eq!(bucketing_identity(flag, "code", &state), "account-9");
    }

    #[test]
    fn sdk_condition_sees_this_client() {
        let config = configuration(serde_json::json!({
            "segments": [{"id": 3, "conditionsData": {"firstLevel": [{"conditions": [
                {"targetingType": "SDK_LANGUAGE", "sdkLanguage": "rust"}
            ]}]}}],
            "featureFlags": [{
                "id": 1,
                "featureKey": "f1",
                "rules": [{"id": 1, "order": 1, "type": "TARGETED_DELIVERY", "exposition": 1.0,
                           "experimentId": 100, "segmentId": 3,
                           "variationByExposition": [{"variationId": 5, "variationKey": "on", "exposition": 1.0}]}]
            }]
        }));
        let mut state = VisitorState::default();
        assert_eq!(eval(&config, "visitor", &mut state).variation.key, "on");
    }
}
