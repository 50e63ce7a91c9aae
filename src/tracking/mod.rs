//! Delivery of visitor data to the tracking endpoint.
mod encoding;
mod manager;

pub(crate) use manager::{TrackingConfig, TrackingManager};
