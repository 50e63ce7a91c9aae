//! Targeting conditions and segment trees.
//!
//! Conditions are compiled from the configuration once. During evaluation each condition asks a
//! [`TargetingDataSource`] for exactly the kind of visitor context it needs.
mod conditions;
mod data;
mod tree;

pub(crate) use data::{AssignmentsView, TargetingData, TargetingDataSource, TargetingType};
pub(crate) use tree::Segment;

/// Maximum nesting of segment references. Deeper (or cyclic) references don't match.
pub(crate) const MAX_SEGMENT_DEPTH: usize = 8;
