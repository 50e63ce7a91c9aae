use crate::configuration::models::{
    ConditionGroupWire, ConditionWire, ConditionsDataWire, SegmentWire, TryParse,
};

use super::{conditions::Condition, data::TargetingDataSource};

/// Boolean combination of conditions.
#[derive(Debug, Clone)]
pub(crate) enum SegmentTree {
    Leaf(Condition),
    Node {
        or_operator: bool,
        left: Option<Box<SegmentTree>>,
        right: Option<Box<SegmentTree>>,
    },
}

impl SegmentTree {
    /// Evaluate the tree. A missing child is skipped, a node without children is satisfied.
    pub fn check(&self, source: &dyn TargetingDataSource, depth: usize) -> bool {
        match self {
            SegmentTree::Leaf(condition) => condition.check(source, depth),
            SegmentTree::Node {
                or_operator,
                left,
                right,
            } => match (left, right) {
                (None, None) => true,
                (Some(only), None) | (None, Some(only)) => only.check(source, depth),
                (Some(left), Some(right)) => {
                    if *or_operator {
                        left.check(source, depth) || right.check(source, depth)
                    } else {
                        left.check(source, depth) && right.check(source, depth)
                    }
                }
            },
        }
    }

    /// Build the tree of a segment from its two-level wire form. Returns `None` for an empty
    /// expression.
    pub fn from_conditions(conditions: ConditionsDataWire) -> Option<SegmentTree> {
        combine(
            conditions.first_level,
            &conditions.first_level_or_operators,
            &mut |group: ConditionGroupWire| {
                combine(
                    group.conditions,
                    &group.or_operators,
                    &mut |condition: TryParse<ConditionWire>| {
                        let condition = match condition {
                            TryParse::Parsed(wire) => wire.into(),
                            TryParse::ParseFailed(raw) => {
                                log::warn!(target: "flagline", "malformed targeting condition never matches: {raw}");
                                Condition::invalid()
                            }
                        };
                        Some(SegmentTree::Leaf(condition))
                    },
                )
            },
        )
    }
}

/// Combine `operands` joined by `or_operators` (`or_operators[i]` joins operand `i` and
/// `i + 1`, missing operators mean AND). AND binds tighter than OR.
fn combine<T>(
    mut operands: Vec<T>,
    or_operators: &[bool],
    to_tree: &mut dyn FnMut(T) -> Option<SegmentTree>,
) -> Option<SegmentTree> {
    match operands.len() {
        0 => return None,
        1 => return operands.pop().and_then(|operand| to_tree(operand)),
        _ => {}
    }

    let first_or = or_operators
        .iter()
        .take(operands.len() - 1)
        .position(|is_or| *is_or);
    let (split, or_operator) = match first_or {
        Some(i) => (i + 1, true),
        None => (1, false),
    };
    let right_operands = operands.split_off(split);
    let left_operators = &or_operators[..(split - 1).min(or_operators.len())];
    let right_operators = or_operators.get(split..).unwrap_or(&[]);

    let left = combine(operands, left_operators, to_tree);
    let right = combine(right_operands, right_operators, to_tree);
    match (left, right) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only),
        (left, right) => Some(SegmentTree::Node {
            or_operator,
            left: left.map(Box::new),
            right: right.map(Box::new),
        }),
    }
}

/// A compiled segment.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub id: u32,
    tree: Option<SegmentTree>,
}

impl Segment {
    pub fn check(&self, source: &dyn TargetingDataSource, depth: usize) -> bool {
        self.tree
            .as_ref()
            .map_or(true, |tree| tree.check(source, depth))
    }
}

impl From<SegmentWire> for Segment {
    fn from(wire: SegmentWire) -> Segment {
        Segment {
            id: wire.id,
            tree: SegmentTree::from_conditions(wire.conditions_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        targeting::data::{TargetingData, TargetingType},
        visitor::{sendable::Sendable, CustomData},
    };

    /// Custom data with index `i` set to "1" for every `i` in the source.
    struct Flags(BTreeMap<u32, Sendable<CustomData>>);

    impl Flags {
        fn new(set: &[u32]) -> Flags {
            Flags(
                set.iter()
                    .map(|i| (*i, Sendable::new(CustomData::new(*i, ["1"]))))
                    .collect(),
            )
        }
    }

    impl TargetingDataSource for Flags {
        fn targeting_data(&self, kind: TargetingType) -> TargetingData<'_> {
            assert_eq!(kind, TargetingType::CustomData);
            TargetingData::CustomData(&self.0)
        }
    }

    fn condition(index: u32) -> serde_json::Value {
        serde_json::json!({
            "targetingType": "CUSTOM_DATUM",
            "index": index,
            "valueMatchType": "EXACT",
            "value": "1"
        })
    }

    fn segment(value: serde_json::Value) -> Segment {
        let wire: SegmentWire = serde_json::from_value(value).unwrap();
        wire.into()
    }

    /// Single group `c1 <ops[0]> c2 <ops[1]> c3`.
    fn group(ops: [bool; 2]) -> Segment {
        segment(serde_json::json!({
            "id": 1,
            "conditionsData": {
                "firstLevel": [{
                    "orOperators": ops,
                    "conditions": [condition(1), condition(2), condition(3)]
                }]
            }
        }))
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // 1 OR (2 AND 3)
        let s = group([true, false]);
        assert!(s.check(&Flags::new(&[1]), 0));
        assert!(s.check(&Flags::new(&[2, 3]), 0));
        assert!(!s.check(&Flags::new(&[2]), 0));
        assert!(!s.check(&Flags::new(&[3]), 0));

        // (1 AND 2) OR 3
        let s = group([false, true]);
        assert!(s.check(&Flags::new(&[3]), 0));
        assert!(s.check(&Flags::new(&[1, 2]), 0));
        assert!(!s.check(&Flags::new(&[1]), 0));

        // 1 AND 2 AND 3
        let s = group([false, false]);
        assert!(s.check(&Flags::new(&[1, 2, 3]), 0));
        assert!(!s.check(&Flags::new(&[1, 2]), 0));

        // 1 OR 2 OR 3
        let s = group([true, true]);
        assert!(s.check(&Flags::new(&[2]), 0));
        assert!(!s.check(&Flags::new(&[]), 0));
    }

    #[test]
    fn first_level_groups_combine() {
        // (1 AND 2) AND (3 OR 4)
        let s = segment(serde_json::json!({
            "id": 1,
            "conditionsData": {
                "firstLevelOrOperators": [false],
                "firstLevel": [
                    {"orOperators": [false], "conditions": [condition(1), condition(2)]},
                    {"orOperators": [true], "conditions": [condition(3), condition(4)]}
                ]
            }
        }));
        assert!(s.check(&Flags::new(&[1, 2, 4]), 0));
        assert!(!s.check(&Flags::new(&[1, 4]), 0));
        assert!(!s.check(&Flags::new(&[1, 2]), 0));
    }

    #[test]
    fn empty_groups_are_satisfied() {
        let s = segment(serde_json::json!({"id": 1}));
        assert!(s.check(&Flags::new(&[]), 0));

        let s = segment(serde_json::json!({
            "id": 1,
            "conditionsData": {
                "firstLevelOrOperators": [false],
                "firstLevel": [
                    {"conditions": []},
                    {"conditions": [condition(1)]}
                ]
            }
        }));
        assert!(s.check(&Flags::new(&[1]), 0));
        assert!(!s.check(&Flags::new(&[]), 0));
    }

    #[test]
    fn missing_operators_mean_and() {
        let s = segment(serde_json::json!({
            "id": 1,
            "conditionsData": {
                "firstLevel": [{"conditions": [condition(1), condition(2)]}]
            }
        }));
        assert!(!s.check(&Flags::new(&[1]), 0));
        assert!(s.check(&Flags::new(&[1, 2]), 0));
    }

    #[test]
    fn malformed_condition_fails_alone() {
        let malformed = serde_json::json!({
            "targetingType": "PAGE_URL",
            "matchType": "SOMETIMES"
        });
        // 1 OR malformed
        let s = segment(serde_json::json!({
            "id": 1,
            "conditionsData": {
                "firstLevel": [{
                    "orOperators": [true],
                    "conditions": [condition(1), malformed.clone()]
                }]
            }
        }));
        assert!(s.check(&Flags::new(&[1]), 0));
        assert!(!s.check(&Flags::new(&[]), 0));

        // Negation does not make it match.
        let mut negated = malformed;
        negated["isInclude"] = false.into();
        let s = segment(serde_json::json!({
            "id": 1,
            "conditionsData": {"firstLevel": [{"conditions": [negated]}]}
        }));
        assert!(!s.check(&Flags::new(&[]), 0));
    }

    #[test]
    fn childless_node_is_satisfied() {
        let node = SegmentTree::Node {
            or_operator: true,
            left: None,
            right: None,
        };
        assert!(node.check(&Flags::new(&[]), 0));
    }
}
