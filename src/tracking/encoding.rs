//! Encoding of outgoing visitor items into tracking lines.
//!
//! Each line is a form-urlencoded list of key-value pairs carrying at least `eventType`,
//! `nonce` and `visitorCode`. A batch is the newline-joined list of lines.
use url::form_urlencoded;

use crate::{
    eval::{SDK_NAME, SDK_VERSION},
    visitor::state::{Outgoing, TrackedItem},
};

/// Encode one outgoing item of `visitor_code` into a single line.
pub(crate) fn encode_line(visitor_code: &str, outgoing: &Outgoing) -> String {
    let mut line = form_urlencoded::Serializer::new(String::new());
    line.append_pair("eventType", event_type(&outgoing.item));
    line.append_pair("nonce", &outgoing.nonce);
    line.append_pair("visitorCode", visitor_code);
    line.append_pair("sdkName", SDK_NAME);
    line.append_pair("sdkVersion", SDK_VERSION);

    match &outgoing.item {
        TrackedItem::CustomData {
            data,
            mapping_identifier,
        } => {
            line.append_pair("index", &data.index.to_string());
            line.append_pair("valueToCount", &value_to_count(&data.values));
            line.append_pair("overwrite", bool_str(data.overwrite));
            if *mapping_identifier {
                line.append_pair("mappingIdentifier", "true");
            }
        }
        TrackedItem::Conversion(conversion) => {
            line.append_pair("goalId", &conversion.goal_id.to_string());
            line.append_pair("revenue", &conversion.revenue.to_string());
            line.append_pair("negative", bool_str(conversion.negative));
        }
        TrackedItem::Assignment(assignment) => {
            line.append_pair("id", &assignment.experiment_id.to_string());
            line.append_pair("variationId", &assignment.variation_id.to_string());
        }
        TrackedItem::PageView(page_view) => {
            line.append_pair("href", &page_view.url);
            line.append_pair("title", &page_view.title);
            if !page_view.referrers.is_empty() {
                let referrers = page_view
                    .referrers
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                line.append_pair("referrers", &format!("[{referrers}]"));
            }
        }
        TrackedItem::Device(device) => {
            line.append_pair("deviceType", device.device_type.as_str());
        }
        TrackedItem::Browser(browser) => {
            line.append_pair("browserIndex", &(browser.browser_type as u8).to_string());
            if let Some(version) = browser.version {
                line.append_pair("browserVersion", &version.to_string());
            }
        }
        TrackedItem::OperatingSystem(os) => {
            line.append_pair("os", os.os_type.as_str());
            line.append_pair("osIndex", &(os.os_type as u8).to_string());
        }
        TrackedItem::Geolocation(geolocation) => {
            line.append_pair("country", &geolocation.country);
            if let Some(region) = &geolocation.region {
                line.append_pair("region", region);
            }
            if let Some(city) = &geolocation.city {
                line.append_pair("city", city);
            }
            if let Some(postal_code) = &geolocation.postal_code {
                line.append_pair("postalCode", postal_code);
            }
            if let Some((latitude, longitude)) = geolocation.coordinates {
                line.append_pair("latitude", &latitude.to_string());
                line.append_pair("longitude", &longitude.to_string());
            }
        }
        TrackedItem::Activity => {}
    }

    line.finish()
}

fn event_type(item: &TrackedItem) -> &'static str {
    match item {
        TrackedItem::CustomData { .. } => "customData",
        TrackedItem::Conversion(_) => "conversion",
        TrackedItem::Assignment(_) => "experiment",
        TrackedItem::PageView(_) => "page",
        TrackedItem::Device(_) | TrackedItem::Browser(_) | TrackedItem::OperatingSystem(_) => {
            "staticData"
        }
        TrackedItem::Geolocation(_) => "geolocation",
        TrackedItem::Activity => "activity",
    }
}

/// Values are counted once each: `{"a":1,"b":1}`.
fn value_to_count(values: &[String]) -> String {
    let counts: serde_json::Map<String, serde_json::Value> = values
        .iter()
        .map(|value| (value.clone(), serde_json::Value::from(1)))
        .collect();
    serde_json::Value::Object(counts).to_string()
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
