use std::{
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use flagline::{ClientConfig, ClientRegistry, ConfigurationUpdate, Error};

mod common;
use common::{init_logger, read_configuration, wait_until, MockTransport};

const TIMEOUT: Duration = Duration::from_secs(5);

fn realtime_configuration(timestamp: i64, default_variation: &str) -> serde_json::Value {
    let mut configuration = read_configuration();
    configuration["timestamp"] = timestamp.into();
    configuration["settings"]["realTimeUpdate"] = true.into();
    configuration["featureFlags"][1]["defaultVariationKey"] = default_variation.into();
    configuration
}

#[test]
fn realtime_notifications_apply_newer_configurations() {
    init_logger();
    let transport = MockTransport::new(&realtime_configuration(1000, "off"));
    let events = transport.realtime_sender();
    let updates = Arc::new(Mutex::new(Vec::new()));

    let client = {
        let updates = updates.clone();
        ClientConfig::from_site_code("test-site")
            .transport(transport.clone())
            .update_listener(move |update: ConfigurationUpdate| {
                updates.lock().unwrap().push(update.timestamp);
            })
            .to_client()
            .unwrap()
    };
    client.wait_init().unwrap();
    assert!(wait_until(TIMEOUT, || transport
        .streams_opened
        .load(Ordering::SeqCst)
        == 1));

    // visitor-0 is in the td-stop segment, so it gets the flag default.
    client
        .add_data("visitor-0", [flagline::CustomData::new(1, ["vip"]).into()])
        .unwrap();
    assert_eq!(
        client.get_variation("visitor-0", "td-stop", false).unwrap().key,
        "off"
    );

    transport.set_configuration(&realtime_configuration(2000, "on"));
    events.send(2000).unwrap();
    assert!(wait_until(TIMEOUT, || client
        .configuration()
        .is_some_and(|c| c.timestamp() == 2000)));
    assert_eq!(
        client.get_variation("visitor-0", "td-stop", false).unwrap().key,
        "on"
    );
    assert!(transport.fetches.lock().unwrap().contains(&Some(2000)));

    // A notification about an older configuration is ignored.
    let fetches = transport.fetches.lock().unwrap().len();
    events.send(1500).unwrap();
    // Followed by a newer one to know the older one was processed.
    transport.set_configuration(&realtime_configuration(3000, "on"));
    events.send(3000).unwrap();
    assert!(wait_until(TIMEOUT, || client
        .configuration()
        .is_some_and(|c| c.timestamp() == 3000)));
    assert_eq!(transport.fetches.lock().unwrap().len(), fetches + 1);

    assert_eq!(*updates.lock().unwrap(), vec![1000, 2000, 3000]);
    client.close().unwrap();
}

#[test]
fn outdated_configuration_is_discarded() {
    init_logger();
    let transport = MockTransport::new(&realtime_configuration(1000, "off"));
    let events = transport.realtime_sender();
    let client = ClientConfig::from_site_code("test-site")
        .transport(transport.clone())
        .to_client()
        .unwrap();
    client.wait_init().unwrap();
    assert!(wait_until(TIMEOUT, || transport
        .streams_opened
        .load(Ordering::SeqCst)
        == 1));

    // The server announces a newer configuration but serves a stale one.
    transport.set_configuration(&realtime_configuration(500, "on"));
    events.send(2000).unwrap();
    assert!(wait_until(TIMEOUT, || transport
        .fetches
        .lock()
        .unwrap()
        .contains(&Some(2000))));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(client.configuration().unwrap().timestamp(), 1000);
    client.close().unwrap();
}

#[test]
fn evaluation_without_configuration_fails() {
    init_logger();
    let transport = MockTransport::new(&serde_json::json!("not a configuration"));
    let client = ClientConfig::from_site_code("test-site")
        .transport(transport.clone())
        .to_client()
        .unwrap();

    assert!(matches!(client.wait_init(), Err(Error::Parse(_))));
    assert!(matches!(
        client.get_variation("visitor-0", "f1", true),
        Err(Error::ConfigurationNotLoaded)
    ));
    client.close().unwrap();
}

#[test]
fn registry_shares_clients_per_site() {
    init_logger();
    let transport = MockTransport::new(&read_configuration());
    let registry = ClientRegistry::new();

    let a = registry
        .get_or_create(ClientConfig::from_site_code("site-a").transport(transport.clone()))
        .unwrap();
    let again = registry
        .get_or_create(ClientConfig::from_site_code("site-a").transport(transport.clone()))
        .unwrap();
    assert!(Arc::ptr_eq(&a, &again));

    let b = registry
        .get_or_create(ClientConfig::from_site_code("site-b").transport(transport.clone()))
        .unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.get("site-b").is_some());

    assert!(registry.remove("site-a"));
    assert!(a.is_closed());
    assert!(!registry.remove("site-a"));

    registry.close_all();
    assert!(b.is_closed());
    assert!(registry.is_empty());
}
