//! Visitor data and per-visitor state.
mod data;
pub(crate) mod sendable;
pub(crate) mod state;
pub(crate) mod store;

pub use data::{
    AssignedVariation, Browser, BrowserType, Conversion, Cookie, CustomData, Data, Device,
    DeviceType, Geolocation, OperatingSystem, OperatingSystemType, PageView, VisitorVisits,
};
