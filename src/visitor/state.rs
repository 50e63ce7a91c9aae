use std::collections::{BTreeMap, HashMap, HashSet};

use crate::configuration::{Configuration, RuleType};

use super::{
    data::{
        AssignedVariation, Browser, Conversion, Cookie, CustomData, Data, Device, Geolocation,
        OperatingSystem, PageView, VisitorVisits,
    },
    sendable::{new_nonce, Sendable},
};

/// A variation forced onto a visitor for an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForcedVariation {
    pub variation_key: String,
    /// When `true` the variation is applied without checking the rule's targeting.
    pub force_targeting: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct PageViewVisit {
    pub page_view: Sendable<PageView>,
    pub count: u32,
}

/// Everything known about one visitor. Always accessed under the visitor's lock.
#[derive(Debug, Default)]
pub(crate) struct VisitorState {
    custom_data: BTreeMap<u32, Sendable<CustomData>>,
    assigned_variations: HashMap<u32, Sendable<AssignedVariation>>,
    /// Conversions not delivered yet, by insertion sequence.
    conversions: BTreeMap<u64, Sendable<Conversion>>,
    next_conversion: u64,
    /// Goals reached by a non-negative conversion. Outlives the delivered conversions.
    converted_goals: HashSet<u32>,
    /// Ordered from least to most recently viewed.
    page_views: Vec<PageViewVisit>,
    device: Option<Sendable<Device>>,
    browser: Option<Sendable<Browser>>,
    operating_system: Option<Sendable<OperatingSystem>>,
    geolocation: Option<Sendable<Geolocation>>,
    cookie: Option<Cookie>,
    visits: Option<VisitorVisits>,
    legal_consent: bool,
    mapping_identifier: Option<String>,
    forced_variations: HashMap<u32, ForcedVariation>,
}

impl VisitorState {
    /// Store a data item. Returns `true` if the item is waiting for delivery.
    pub fn add(&mut self, data: Data, configuration: Option<&Configuration>) -> bool {
        match data {
            Data::CustomData(custom_data) => {
                let is_mapping = configuration
                    .and_then(|c| c.custom_data_info(custom_data.index))
                    .is_some_and(|info| info.is_mapping_identifier);
                if is_mapping {
                    if let Some(value) = custom_data.values.first() {
                        self.mapping_identifier = Some(value.clone());
                    }
                }
                self.custom_data
                    .insert(custom_data.index, Sendable::new(custom_data));
                true
            }
            Data::Conversion(conversion) => {
                if !conversion.negative {
                    self.converted_goals.insert(conversion.goal_id);
                }
                self.conversions
                    .insert(self.next_conversion, Sendable::new(conversion));
                self.next_conversion += 1;
                true
            }
            Data::PageView(page_view) => {
                let existing = self
                    .page_views
                    .iter()
                    .position(|visit| visit.page_view.url == page_view.url);
                let count = match existing {
                    Some(position) => self.page_views.remove(position).count + 1,
                    None => 1,
                };
                self.page_views.push(PageViewVisit {
                    page_view: Sendable::new(page_view),
                    count,
                });
                true
            }
            Data::Device(device) => {
                self.device = Some(Sendable::new(device));
                true
            }
            Data::Browser(browser) => {
                self.browser = Some(Sendable::new(browser));
                true
            }
            Data::OperatingSystem(os) => {
                self.operating_system = Some(Sendable::new(os));
                true
            }
            Data::Geolocation(geolocation) => {
                self.geolocation = Some(Sendable::new(geolocation));
                true
            }
            Data::Cookie(cookie) => {
                self.cookie = Some(cookie);
                false
            }
            Data::VisitorVisits(visits) => {
                self.visits = Some(visits);
                false
            }
            Data::AssignedVariation(assignment) => self.assign(assignment, true),
        }
    }

    /// Record a variation assignment. Without `overwrite` an existing assignment for the same
    /// experiment is kept. Returns `true` if the assignment was stored.
    pub fn assign(&mut self, assignment: AssignedVariation, overwrite: bool) -> bool {
        if !overwrite && self.assigned_variations.contains_key(&assignment.experiment_id) {
            return false;
        }
        self.assigned_variations
            .insert(assignment.experiment_id, Sendable::new(assignment));
        true
    }

    /// Record an assignment made by flag evaluation. Returns `true` if the assignment was newly
    /// scheduled for delivery.
    ///
    /// An existing assignment for the experiment is kept when it names the same variation and is
    /// still valid under `respool_time`, or whenever `overwrite` is `false`. Untracked
    /// assignments are stored suppressed: they count for targeting and stability, and are only
    /// sent once a tracked evaluation releases them.
    pub fn record(
        &mut self,
        assignment: AssignedVariation,
        respool_time: Option<i64>,
        overwrite: bool,
        track: bool,
    ) -> bool {
        if let Some(existing) = self.assigned_variations.get_mut(&assignment.experiment_id) {
            let same = existing.variation_id == assignment.variation_id
                && existing.is_valid(respool_time);
            if same || !overwrite {
                return track && existing.release();
            }
        }
        let item = if track {
            Sendable::new(assignment)
        } else {
            Sendable::suppressed(assignment)
        };
        self.assigned_variations
            .insert(assignment.experiment_id, item);
        track
    }

    pub fn assignment(&self, experiment_id: u32) -> Option<&AssignedVariation> {
        self.assigned_variations.get(&experiment_id).map(|a| &**a)
    }

    pub fn assignments(&self) -> &HashMap<u32, Sendable<AssignedVariation>> {
        &self.assigned_variations
    }

    pub fn custom_data(&self) -> &BTreeMap<u32, Sendable<CustomData>> {
        &self.custom_data
    }

    pub fn converted_goals(&self) -> &HashSet<u32> {
        &self.converted_goals
    }

    #[cfg(test)]
    pub fn pending_conversions(&self) -> usize {
        self.conversions.len()
    }

    pub fn page_views(&self) -> &[PageViewVisit] {
        &self.page_views
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_deref()
    }

    pub fn browser(&self) -> Option<&Browser> {
        self.browser.as_deref()
    }

    pub fn operating_system(&self) -> Option<&OperatingSystem> {
        self.operating_system.as_deref()
    }

    pub fn geolocation(&self) -> Option<&Geolocation> {
        self.geolocation.as_deref()
    }

    pub fn cookie(&self) -> Option<&Cookie> {
        self.cookie.as_ref()
    }

    pub fn visits(&self) -> Option<&VisitorVisits> {
        self.visits.as_ref()
    }

    pub fn legal_consent(&self) -> bool {
        self.legal_consent
    }

    pub fn set_legal_consent(&mut self, consent: bool) {
        self.legal_consent = consent;
    }

    pub fn mapping_identifier(&self) -> Option<&str> {
        self.mapping_identifier.as_deref()
    }

    pub fn forced_variation(&self, experiment_id: u32) -> Option<&ForcedVariation> {
        self.forced_variations.get(&experiment_id)
    }

    pub fn set_forced_variation(&mut self, experiment_id: u32, forced: Option<ForcedVariation>) {
        match forced {
            Some(forced) => {
                self.forced_variations.insert(experiment_id, forced);
            }
            None => {
                self.forced_variations.remove(&experiment_id);
            }
        }
    }

    /// Move every item eligible under `policy` from `Unsent` to `Transmitting` and return what
    /// needs to be sent. When nothing is pending and the visitor may be tracked, an activity
    /// heartbeat is returned instead.
    pub fn collect_unsent(&mut self, policy: &CollectPolicy) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        let restricted = policy.consent_required && !self.legal_consent;

        for (experiment_id, assignment) in self.assigned_variations.iter_mut() {
            if restricted && assignment.rule_type != RuleType::TargetedDelivery {
                continue;
            }
            if let Some(nonce) = assignment.begin_transmission() {
                outgoing.push(Outgoing::new(
                    TrackedItem::Assignment(**assignment),
                    SendableRef::Assignment(*experiment_id),
                    nonce,
                ));
            }
        }
        for (sequence, conversion) in self.conversions.iter_mut() {
            if let Some(nonce) = conversion.begin_transmission() {
                outgoing.push(Outgoing::new(
                    TrackedItem::Conversion((**conversion).clone()),
                    SendableRef::Conversion(*sequence),
                    nonce,
                ));
            }
        }
        if restricted {
            return outgoing;
        }

        for (index, custom_data) in self.custom_data.iter_mut() {
            if policy.local_only.contains(index) {
                continue;
            }
            if let Some(nonce) = custom_data.begin_transmission() {
                outgoing.push(Outgoing::new(
                    TrackedItem::CustomData {
                        data: (**custom_data).clone(),
                        mapping_identifier: policy.mapping_index == Some(*index),
                    },
                    SendableRef::CustomData(*index),
                    nonce,
                ));
            }
        }
        for visit in self.page_views.iter_mut() {
            if let Some(nonce) = visit.page_view.begin_transmission() {
                outgoing.push(Outgoing::new(
                    TrackedItem::PageView((*visit.page_view).clone()),
                    SendableRef::PageView(visit.page_view.url.clone()),
                    nonce,
                ));
            }
        }
        if let Some(nonce) = self.device.as_mut().and_then(Sendable::begin_transmission) {
            if let Some(device) = self.device.as_deref() {
                outgoing.push(Outgoing::new(
                    TrackedItem::Device(*device),
                    SendableRef::Device,
                    nonce,
                ));
            }
        }
        if let Some(nonce) = self.browser.as_mut().and_then(Sendable::begin_transmission) {
            if let Some(browser) = self.browser.as_deref() {
                outgoing.push(Outgoing::new(
                    TrackedItem::Browser(*browser),
                    SendableRef::Browser,
                    nonce,
                ));
            }
        }
        if let Some(nonce) = self
            .operating_system
            .as_mut()
            .and_then(Sendable::begin_transmission)
        {
            if let Some(os) = self.operating_system.as_deref() {
                outgoing.push(Outgoing::new(
                    TrackedItem::OperatingSystem(*os),
                    SendableRef::OperatingSystem,
                    nonce,
                ));
            }
        }
        if let Some(nonce) = self
            .geolocation
            .as_mut()
            .and_then(Sendable::begin_transmission)
        {
            if let Some(geolocation) = self.geolocation.as_deref() {
                outgoing.push(Outgoing::new(
                    TrackedItem::Geolocation(geolocation.clone()),
                    SendableRef::Geolocation,
                    nonce,
                ));
            }
        }

        if outgoing.is_empty() {
            outgoing.push(Outgoing {
                item: TrackedItem::Activity,
                nonce: new_nonce(),
                receipt: None,
            });
        }
        outgoing
    }

    /// Apply a delivery outcome to previously collected items.
    pub fn complete_delivery<'a>(
        &mut self,
        receipts: impl IntoIterator<Item = &'a Receipt>,
        delivered: bool,
    ) {
        for receipt in receipts {
            let nonce = receipt.nonce.as_str();
            match &receipt.slot {
                SendableRef::Assignment(id) => {
                    complete(self.assigned_variations.get_mut(id), nonce, delivered)
                }
                SendableRef::Conversion(sequence) => {
                    complete(self.conversions.get_mut(sequence), nonce, delivered)
                }
                SendableRef::CustomData(index) => {
                    complete(self.custom_data.get_mut(index), nonce, delivered)
                }
                SendableRef::PageView(url) => complete(
                    self.page_views
                        .iter_mut()
                        .find(|visit| visit.page_view.url == *url)
                        .map(|visit| &mut visit.page_view),
                    nonce,
                    delivered,
                ),
                SendableRef::Device => complete(self.device.as_mut(), nonce, delivered),
                SendableRef::Browser => complete(self.browser.as_mut(), nonce, delivered),
                SendableRef::OperatingSystem => {
                    complete(self.operating_system.as_mut(), nonce, delivered)
                }
                SendableRef::Geolocation => complete(self.geolocation.as_mut(), nonce, delivered),
            }
        }
        // Conversions accumulate, unlike the other kinds which are replaced by key.
        self.conversions.retain(|_, conversion| !conversion.is_sent());
    }
}

fn complete<T>(item: Option<&mut Sendable<T>>, nonce: &str, delivered: bool) {
    if let Some(item) = item {
        item.complete_transmission(nonce, delivered);
    }
}

/// Which items of a visitor may be sent.
#[derive(Debug, Clone, Default)]
pub(crate) struct CollectPolicy {
    pub consent_required: bool,
    pub local_only: HashSet<u32>,
    pub mapping_index: Option<u32>,
}

impl CollectPolicy {
    pub fn from_configuration(configuration: Option<&Configuration>) -> CollectPolicy {
        let Some(configuration) = configuration else {
            return CollectPolicy::default();
        };
        CollectPolicy {
            consent_required: configuration.settings().consent_required,
            local_only: configuration.local_only_custom_data(),
            mapping_index: configuration.mapping_identifier_index(),
        }
    }
}

/// Location of a tracked item inside [`VisitorState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SendableRef {
    CustomData(u32),
    Conversion(u64),
    Assignment(u32),
    PageView(String),
    Device,
    Browser,
    OperatingSystem,
    Geolocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Receipt {
    pub slot: SendableRef,
    pub nonce: String,
}

/// A snapshot of one item to encode into the tracking batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrackedItem {
    CustomData {
        data: CustomData,
        mapping_identifier: bool,
    },
    Conversion(Conversion),
    Assignment(AssignedVariation),
    PageView(PageView),
    Device(Device),
    Browser(Browser),
    OperatingSystem(OperatingSystem),
    Geolocation(Geolocation),
    /// Synthetic heartbeat keeping the visitor session alive on the backend.
    Activity,
}

#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub item: TrackedItem,
    pub nonce: String,
    /// `None` for synthetic items that are not stored on the visitor.
    pub receipt: Option<Receipt>,
}

impl Outgoing {
    fn new(item: TrackedItem, slot: SendableRef, nonce: String) -> Outgoing {
        Outgoing {
            item,
            receipt: Some(Receipt {
                slot,
                nonce: nonce.clone(),
            }),
            nonce,
        }
    }
}
