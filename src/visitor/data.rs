//! Data items a host application can attach to a visitor.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::configuration::RuleType;

/// A piece of visitor data.
///
/// Items are stored on the visitor and, except for local-only kinds, delivered to the tracking
/// backend by the background flush.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Data {
    /// Values of a custom data field declared in the configuration.
    CustomData(CustomData),
    /// A reached conversion goal.
    Conversion(Conversion),
    /// A page view. Views of the same URL are counted.
    PageView(PageView),
    /// Device type of the visitor.
    Device(Device),
    /// Browser of the visitor.
    Browser(Browser),
    /// Operating system of the visitor.
    OperatingSystem(OperatingSystem),
    /// Geolocation of the visitor.
    Geolocation(Geolocation),
    /// Cookies of the visitor. Used for targeting only, never sent.
    Cookie(Cookie),
    /// Previous visit timestamps. Used for targeting only, never sent.
    VisitorVisits(VisitorVisits),
    /// An explicit variation assignment, overwriting any previous one for the experiment.
    AssignedVariation(AssignedVariation),
}

/// Values of a custom data field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    /// Index of the field in the configuration.
    pub index: u32,
    /// Values of the field. Several values make a list field.
    pub values: Vec<String>,
    /// When `false`, the backend appends values instead of replacing them.
    pub overwrite: bool,
}

impl CustomData {
    /// Values for field `index`, overwriting previous ones.
    pub fn new<S: Into<String>>(index: u32, values: impl IntoIterator<Item = S>) -> CustomData {
        CustomData {
            index,
            values: values.into_iter().map(Into::into).collect(),
            overwrite: true,
        }
    }

    /// Set whether the values replace the previous ones on the backend.
    pub fn with_overwrite(mut self, overwrite: bool) -> CustomData {
        self.overwrite = overwrite;
        self
    }
}

/// A reached goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversion {
    /// Id of the goal in the configuration.
    pub goal_id: u32,
    /// Revenue attributed to the conversion. Zero when unknown.
    pub revenue: f64,
    /// Negative conversions cancel a previous conversion on the backend.
    pub negative: bool,
}

impl Conversion {
    /// A positive conversion of `goal_id` without revenue.
    pub fn new(goal_id: u32) -> Conversion {
        Conversion {
            goal_id,
            revenue: 0.0,
            negative: false,
        }
    }

    /// Attribute `revenue` to the conversion.
    pub fn with_revenue(mut self, revenue: f64) -> Conversion {
        self.revenue = revenue;
        self
    }

    /// Mark the conversion as cancelling a previous one.
    pub fn with_negative(mut self, negative: bool) -> Conversion {
        self.negative = negative;
        self
    }
}

/// A page view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    /// Full URL of the page.
    pub url: String,
    /// Title of the page.
    pub title: String,
    /// Indices of referrers from the configuration.
    #[serde(default)]
    pub referrers: Vec<u32>,
}

impl PageView {
    /// A view of `url` without referrers.
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> PageView {
        PageView {
            url: url.into(),
            title: title.into(),
            referrers: Vec::new(),
        }
    }
}

/// Device categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    /// Desktop or laptop computer.
    Desktop,
    /// Mobile phone.
    Phone,
    /// Tablet.
    Tablet,
}

impl DeviceType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DeviceType::Desktop => "DESKTOP",
            DeviceType::Phone => "PHONE",
            DeviceType::Tablet => "TABLET",
        }
    }
}

/// Device of the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    /// Category of the device.
    pub device_type: DeviceType,
}

impl From<DeviceType> for Device {
    fn from(device_type: DeviceType) -> Device {
        Device { device_type }
    }
}

/// Browser families. The discriminant is the index used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserType {
    /// Google Chrome.
    Chrome = 0,
    /// Internet Explorer.
    InternetExplorer = 1,
    /// Mozilla Firefox.
    Firefox = 2,
    /// Apple Safari.
    Safari = 3,
    /// Opera.
    Opera = 4,
    /// Any other browser.
    Other = 5,
}

/// Browser of the visitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Browser {
    /// Browser family.
    pub browser_type: BrowserType,
    /// Major and minor version, e.g. `120.1`.
    pub version: Option<f64>,
}

impl Browser {
    /// A browser of unknown version.
    pub fn new(browser_type: BrowserType) -> Browser {
        Browser {
            browser_type,
            version: None,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: f64) -> Browser {
        self.version = Some(version);
        self
    }
}

/// Operating system families. The discriminant is the index used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingSystemType {
    /// Microsoft Windows.
    Windows = 0,
    /// macOS.
    Mac = 1,
    /// iOS and iPadOS.
    Ios = 2,
    /// Linux distributions other than Android.
    Linux = 3,
    /// Android.
    Android = 4,
    /// Windows Phone.
    WindowsPhone = 5,
}

impl OperatingSystemType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            OperatingSystemType::Windows => "WINDOWS",
            OperatingSystemType::Mac => "MAC",
            OperatingSystemType::Ios => "IOS",
            OperatingSystemType::Linux => "LINUX",
            OperatingSystemType::Android => "ANDROID",
            OperatingSystemType::WindowsPhone => "WINDOWS_PHONE",
        }
    }
}

/// Operating system of the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingSystem {
    /// Operating system family.
    pub os_type: OperatingSystemType,
}

impl From<OperatingSystemType> for OperatingSystem {
    fn from(os_type: OperatingSystemType) -> OperatingSystem {
        OperatingSystem { os_type }
    }
}

/// Location of the visitor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Geolocation {
    /// Country name. Compared case-insensitively.
    pub country: String,
    /// Region within the country.
    pub region: Option<String>,
    /// City name.
    pub city: Option<String>,
    /// Postal code. Sent but not used for targeting.
    pub postal_code: Option<String>,
    /// Latitude and longitude.
    pub coordinates: Option<(f64, f64)>,
}

impl Geolocation {
    /// A location known down to the country.
    pub fn new(country: impl Into<String>) -> Geolocation {
        Geolocation {
            country: country.into(),
            ..Geolocation::default()
        }
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Geolocation {
        self.region = Some(region.into());
        self
    }

    /// Set the city.
    pub fn with_city(mut self, city: impl Into<String>) -> Geolocation {
        self.city = Some(city.into());
        self
    }
}

/// Cookies of the visitor, by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cookie {
    /// Cookie values by cookie name.
    pub cookies: HashMap<String, String>,
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Cookie {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Cookie {
        Cookie {
            cookies: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Timestamps (unix seconds) of the visitor's previous visits.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VisitorVisits {
    /// Unordered visit timestamps.
    pub previous_visits: Vec<i64>,
}

impl VisitorVisits {
    pub(crate) fn first(&self) -> Option<i64> {
        self.previous_visits.iter().copied().min()
    }

    pub(crate) fn last(&self) -> Option<i64> {
        self.previous_visits.iter().copied().max()
    }
}

/// Variation a visitor was bucketed into for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedVariation {
    /// Experiment of the rule that made the assignment.
    pub experiment_id: u32,
    /// Assigned variation within the experiment.
    pub variation_id: u32,
    /// Kind of rule that made the assignment.
    pub rule_type: RuleType,
    /// Unix seconds.
    pub assigned_at: i64,
}

impl AssignedVariation {
    /// An assignment is only valid if it was made at or after the respool time of its rule.
    pub fn is_valid(&self, respool_time: Option<i64>) -> bool {
        respool_time.map_or(true, |threshold| self.assigned_at >= threshold)
    }
}
