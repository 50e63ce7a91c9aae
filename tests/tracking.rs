use std::time::Duration;

use flagline::{Conversion, CustomData, Device, DeviceType, Error, PageView};

mod common;
use common::{client_with, read_configuration, wait_until, MockTransport};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn tracked_assignment_is_delivered_once() {
    let transport = MockTransport::new(&read_configuration());
    let client = client_with(&transport);

    client.get_variation("visitor-1", "f1", true).unwrap();
    assert!(wait_until(TIMEOUT, || !transport.tracking_lines().is_empty()));

    let lines = transport.tracking_lines();
    let experiment = lines
        .iter()
        .find(|line| line["eventType"] == "experiment")
        .expect("experiment event");
    assert_eq!(experiment["visitorCode"], "visitor-1");
    assert_eq!(experiment["id"], "100");
    assert_eq!(experiment["variationId"], "1");
    assert_eq!(experiment["nonce"].len(), 32);

    // The stored assignment is reused and was already delivered.
    client.get_variation("visitor-1", "f1", true).unwrap();
    client.flush("visitor-1").unwrap();
    assert!(wait_until(TIMEOUT, || transport.tracking.lock().unwrap().len() >= 2));
    let experiments = transport
        .tracking_lines()
        .iter()
        .filter(|line| line["eventType"] == "experiment")
        .count();
    assert_eq!(experiments, 1);
    client.close().unwrap();
}

#[test]
fn failed_delivery_is_retried_with_same_nonce() {
    let transport = MockTransport::new(&read_configuration());
    // Both attempts of the first cycle fail.
    transport.fail_tracking(Error::HttpStatus(503));
    transport.fail_tracking(Error::HttpStatus(503));
    let client = client_with(&transport);

    client.track_conversion("visitor-1", 42, Some(10.0)).unwrap();
    assert!(wait_until(TIMEOUT, || transport.tracking.lock().unwrap().len() >= 3));

    let conversions: Vec<_> = transport
        .tracking_lines()
        .into_iter()
        .filter(|line| line["eventType"] == "conversion")
        .collect();
    assert!(conversions.len() >= 3);
    assert!(conversions.iter().all(|c| c["goalId"] == "42"));
    assert!(conversions.iter().all(|c| c["nonce"] == conversions[0]["nonce"]));

    // Once delivered, the conversion is not sent again.
    client.flush("visitor-1").unwrap();
    assert!(wait_until(TIMEOUT, || transport.tracking.lock().unwrap().len() >= 4));
    let after: usize = transport
        .tracking_lines()
        .iter()
        .filter(|line| line["eventType"] == "conversion")
        .count();
    assert_eq!(after, conversions.len());
    client.close().unwrap();
}

#[test]
fn untracked_evaluation_is_not_scheduled() {
    let transport = MockTransport::new(&read_configuration());
    let client = client_with(&transport);

    client.get_variation("visitor-2", "f1", false).unwrap();
    std::thread::sleep(Duration::from_millis(400));
    assert!(transport.tracking.lock().unwrap().is_empty());

    // A flush does not report the untracked assignment.
    client.flush("visitor-2").unwrap();
    assert!(wait_until(TIMEOUT, || !transport.tracking_lines().is_empty()));
    assert!(!transport
        .tracking_lines()
        .iter()
        .any(|line| line["eventType"] == "experiment"));

    // A tracked evaluation of the same assignment reports it once.
    client.get_variation("visitor-2", "f1", true).unwrap();
    assert!(wait_until(TIMEOUT, || transport
        .tracking_lines()
        .iter()
        .any(|line| line["eventType"] == "experiment")));
    client.get_variation("visitor-2", "f1", true).unwrap();
    client.flush("visitor-2").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let experiments = transport
        .tracking_lines()
        .iter()
        .filter(|line| line["eventType"] == "experiment")
        .count();
    assert_eq!(experiments, 1);
    client.close().unwrap();
}

#[test]
fn local_only_custom_data_is_never_sent() {
    let transport = MockTransport::new(&read_configuration());
    let client = client_with(&transport);

    client
        .add_data(
            "visitor-3",
            [
                CustomData::new(1, ["shared"]).into(),
                CustomData::new(2, ["secret"]).into(),
                PageView::new("https://example.com/", "Home").into(),
            ],
        )
        .unwrap();
    client.flush("visitor-3").unwrap();
    assert!(wait_until(TIMEOUT, || !transport.tracking_lines().is_empty()));

    let lines = transport.tracking_lines();
    let indexes: Vec<&str> = lines
        .iter()
        .filter(|line| line["eventType"] == "customData")
        .map(|line| line["index"].as_str())
        .collect();
    assert_eq!(indexes, vec!["1"]);
    assert!(lines.iter().any(|line| line["eventType"] == "page"));
    client.close().unwrap();
}

#[test]
fn consent_restricts_tracking() {
    let mut configuration = read_configuration();
    configuration["settings"]["consentType"] = "REQUIRED".into();
    let transport = MockTransport::new(&configuration);
    let client = client_with(&transport);

    client
        .add_data(
            "visitor-4",
            [
                CustomData::new(1, ["shared"]).into(),
                Conversion::new(7).into(),
            ],
        )
        .unwrap();
    // f1 assigns through an experimentation rule, held back without consent.
    client.get_variation("visitor-4", "f1", true).unwrap();
    assert!(wait_until(TIMEOUT, || !transport.tracking_lines().is_empty()));

    let lines = transport.tracking_lines();
    assert!(lines.iter().any(|line| line["eventType"] == "conversion"));
    assert!(!lines.iter().any(|line| line["eventType"] == "customData"));
    assert!(!lines.iter().any(|line| line["eventType"] == "experiment"));

    // Once consent is given, everything held back goes out.
    client.set_legal_consent("visitor-4", true).unwrap();
    client.flush("visitor-4").unwrap();
    assert!(wait_until(TIMEOUT, || {
        let lines = transport.tracking_lines();
        lines.iter().any(|line| line["eventType"] == "customData")
            && lines.iter().any(|line| line["eventType"] == "experiment")
    }));
    client.close().unwrap();
}

#[test]
fn flush_all_reports_every_visitor() {
    let transport = MockTransport::new(&read_configuration());
    let client = client_with(&transport);

    client
        .add_data("visitor-5", [CustomData::new(1, ["a"]).into()])
        .unwrap();
    client
        .add_data("visitor-6", [CustomData::new(1, ["b"]).into()])
        .unwrap();
    client.flush_all().unwrap();

    assert!(wait_until(TIMEOUT, || {
        let lines = transport.tracking_lines();
        ["visitor-5", "visitor-6"].iter().all(|code| {
            lines
                .iter()
                .any(|line| line["visitorCode"] == *code && line["eventType"] == "customData")
        })
    }));
    client.close().unwrap();
}

#[test]
fn visitor_held_back_by_consent_sends_nothing() {
    let mut configuration = read_configuration();
    configuration["settings"]["consentType"] = "REQUIRED".into();
    let transport = MockTransport::new(&configuration);
    let client = client_with(&transport);

    client
        .add_data("visitor-7", [CustomData::new(1, ["x"]).into()])
        .unwrap();
    client.flush("visitor-7").unwrap();
    std::thread::sleep(Duration::from_millis(400));
    assert!(transport.tracking.lock().unwrap().is_empty());

    client
        .add_data("visitor-7", [CustomData::new(1, ["y"]).into()])
        .unwrap();
    client.track_conversion("visitor-8", 5, None).unwrap();
    client.flush("visitor-7").unwrap();
    assert!(wait_until(TIMEOUT, || !transport
        .tracking
        .lock()
        .unwrap()
        .is_empty()));

    let bodies = transport.tracking.lock().unwrap().clone();
    assert!(bodies
        .iter()
        .all(|body| !body.is_empty() && body.lines().all(|line| !line.is_empty())));
    assert!(transport
        .tracking_lines()
        .iter()
        .all(|line| line["visitorCode"] == "visitor-8"));
    client.close().unwrap();
}

#[test]
fn repeated_targeted_delivery_is_reported_once() {
    let transport = MockTransport::new(&read_configuration());
    let client = client_with(&transport);
    client
        .add_data("visitor-2", [Device::from(DeviceType::Phone).into()])
        .unwrap();

    // mobile-only serves "mobile" to phones through a targeted delivery rule of experiment 300.
    for _ in 0..2 {
        assert_eq!(
            client.get_variation("visitor-2", "mobile-only", true).unwrap().key,
            "mobile"
        );
    }
    assert!(wait_until(TIMEOUT, || transport
        .tracking_lines()
        .iter()
        .any(|line| line["eventType"] == "experiment")));

    assert_eq!(
        client.get_variation("visitor-2", "mobile-only", true).unwrap().key,
        "mobile"
    );
    client.flush("visitor-2").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let experiments: Vec<_> = transport
        .tracking_lines()
        .into_iter()
        .filter(|line| line["eventType"] == "experiment")
        .collect();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0]["id"], "300");
    client.close().unwrap();
}
