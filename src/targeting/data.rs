//! Lazily produced visitor context for condition evaluation.
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    configuration::Configuration,
    visitor::{
        sendable::Sendable, state::PageViewVisit, AssignedVariation, Browser, Cookie,
        CustomData, Device, Geolocation, OperatingSystem, VisitorVisits,
    },
};

use super::Segment;

/// Kind of visitor context a condition needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TargetingType {
    CustomData,
    PageViews,
    Device,
    Browser,
    OperatingSystem,
    Cookie,
    Geolocation,
    Sdk,
    Segments,
    Conversions,
    Assignments,
    VisitorCode,
    Visits,
    /// The condition needs no data.
    None,
}

/// Visitor context of one [`TargetingType`], borrowed from the visitor and the configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TargetingData<'a> {
    CustomData(&'a BTreeMap<u32, Sendable<CustomData>>),
    /// Ordered from least to most recently viewed.
    PageViews(&'a [PageViewVisit]),
    Device(Option<&'a Device>),
    Browser(Option<&'a Browser>),
    OperatingSystem(Option<&'a OperatingSystem>),
    Cookie(Option<&'a Cookie>),
    Geolocation(Option<&'a Geolocation>),
    Sdk {
        name: &'static str,
        version: &'static str,
    },
    Segments(&'a HashMap<u32, Segment>),
    /// Goals the visitor reached.
    Conversions(&'a HashSet<u32>),
    Assignments(AssignmentsView<'a>),
    VisitorCode(&'a str),
    Visits {
        visits: Option<&'a VisitorVisits>,
        /// Unix seconds.
        now: i64,
    },
    None,
}

/// Assignments of a visitor together with what is needed to relate them to flags.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AssignmentsView<'a> {
    pub assignments: &'a HashMap<u32, Sendable<AssignedVariation>>,
    pub configuration: &'a Configuration,
    /// Id of the flag being evaluated, if any.
    pub current_flag: Option<u32>,
}

/// Produces visitor context on demand. Only the requested kind is ever computed.
pub(crate) trait TargetingDataSource {
    fn targeting_data(&self, kind: TargetingType) -> TargetingData<'_>;
}
