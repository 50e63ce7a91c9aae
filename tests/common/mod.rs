#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::{Duration, Instant},
};

use flagline::{Client, ClientConfig, Error, RealtimeStream, Result, Transport};

pub const CONFIGURATION: &str = "tests/data/configuration.json";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn read_configuration() -> serde_json::Value {
    let file = std::fs::File::open(CONFIGURATION).unwrap();
    serde_json::from_reader(file).unwrap()
}

/// In-memory transport serving a mutable configuration document and recording tracking requests.
#[derive(Default)]
pub struct MockTransport {
    configuration: Mutex<Vec<u8>>,
    pub fetches: Mutex<Vec<Option<i64>>>,
    /// Errors returned by upcoming tracking requests.
    tracking_failures: Mutex<VecDeque<Error>>,
    pub tracking: Mutex<Vec<String>>,
    remote_data: Mutex<HashMap<String, Vec<u8>>>,
    stream: Mutex<Option<mpsc::Receiver<i64>>>,
    pub streams_opened: AtomicUsize,
}

impl MockTransport {
    pub fn new(configuration: &serde_json::Value) -> Arc<MockTransport> {
        let transport = MockTransport::default();
        transport.set_configuration(configuration);
        Arc::new(transport)
    }

    pub fn set_configuration(&self, configuration: &serde_json::Value) {
        *self.configuration.lock().unwrap() = serde_json::to_vec(configuration).unwrap();
    }

    pub fn fail_tracking(&self, error: Error) {
        self.tracking_failures.lock().unwrap().push_back(error);
    }

    pub fn set_remote_data(&self, key: &str, value: &serde_json::Value) {
        self.remote_data
            .lock()
            .unwrap()
            .insert(key.to_owned(), serde_json::to_vec(value).unwrap());
    }

    /// Returns the sender side of the next real-time stream.
    pub fn realtime_sender(&self) -> mpsc::Sender<i64> {
        let (sender, receiver) = mpsc::channel();
        *self.stream.lock().unwrap() = Some(receiver);
        sender
    }

    /// Parsed tracking lines of all requests, successful or not.
    pub fn tracking_lines(&self) -> Vec<HashMap<String, String>> {
        self.tracking
            .lock()
            .unwrap()
            .iter()
            .flat_map(|body| body.lines().map(str::to_owned).collect::<Vec<_>>())
            .map(|line| {
                url::form_urlencoded::parse(line.as_bytes())
                    .into_owned()
                    .collect()
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn fetch_configuration(&self, timestamp: Option<i64>) -> Result<Vec<u8>> {
        self.fetches.lock().unwrap().push(timestamp);
        Ok(self.configuration.lock().unwrap().clone())
    }

    fn open_realtime_stream(&self) -> Result<RealtimeStream> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        match self.stream.lock().unwrap().take() {
            Some(receiver) => Ok(Box::new(receiver.into_iter().map(Ok::<i64, Error>))),
            None => Err(Error::HttpStatus(503)),
        }
    }

    fn send_tracking_data(&self, lines: &str) -> Result<()> {
        self.tracking.lock().unwrap().push(lines.to_owned());
        match self.tracking_failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn get_remote_data(&self, key: &str, _timeout: Duration) -> Result<Vec<u8>> {
        self.remote_data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::HttpStatus(404))
    }
}

pub fn client_with(transport: &Arc<MockTransport>) -> Client {
    init_logger();
    let client = ClientConfig::from_site_code("test-site")
        .tracking_interval(Duration::from_millis(100))
        .transport(transport.clone())
        .to_client()
        .unwrap();
    client.wait_init().unwrap();
    client
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
