//! Network collaborator of the client.
//!
//! The client never opens connections itself: everything goes through a [`Transport`]. The
//! default [`HttpTransport`] talks to the service over HTTPS; tests and hosts with their own HTTP
//! stack can provide another implementation via
//! [`ClientConfig::transport`](crate::ClientConfig::transport).
use std::{
    io::{BufRead, BufReader},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::{eval::SDK_NAME, eval::SDK_VERSION, Error, Result};

/// Stream of real-time configuration update notifications. Each item is the server timestamp of
/// a new configuration. The stream ends when the connection is lost.
pub type RealtimeStream = Box<dyn Iterator<Item = Result<i64>> + Send>;

/// Operations the client needs from the network.
pub trait Transport: Send + Sync {
    /// Fetch the configuration document. `timestamp` is the server timestamp the fetch was
    /// triggered by, `None` requests the latest configuration unconditionally.
    fn fetch_configuration(&self, timestamp: Option<i64>) -> Result<Vec<u8>>;

    /// Subscribe to real-time configuration update notifications.
    fn open_realtime_stream(&self) -> Result<RealtimeStream>;

    /// Deliver a batch of newline-separated tracking lines.
    fn send_tracking_data(&self, lines: &str) -> Result<()>;

    /// Look up remote data stored under `key`.
    fn get_remote_data(&self, key: &str, timeout: Duration) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn fetch_configuration(&self, timestamp: Option<i64>) -> Result<Vec<u8>> {
        (**self).fetch_configuration(timestamp)
    }

    fn open_realtime_stream(&self) -> Result<RealtimeStream> {
        (**self).open_realtime_stream()
    }

    fn send_tracking_data(&self, lines: &str) -> Result<()> {
        (**self).send_tracking_data(lines)
    }

    fn get_remote_data(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        (**self).get_remote_data(key, timeout)
    }
}

/// Base URLs of the services the client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    /// Configuration documents.
    pub configuration: String,
    /// Real-time update notifications.
    pub events: String,
    /// Tracking and remote data.
    pub data: String,
}

impl ServiceUrls {
    /// Default configuration service.
    pub const DEFAULT_CONFIGURATION_URL: &'static str = "https://config.flagline.io";
    /// Default real-time events service.
    pub const DEFAULT_EVENTS_URL: &'static str = "https://events.flagline.io";
    /// Default data service.
    pub const DEFAULT_DATA_URL: &'static str = "https://data.flagline.io";
}

impl Default for ServiceUrls {
    fn default() -> Self {
        ServiceUrls {
            configuration: ServiceUrls::DEFAULT_CONFIGURATION_URL.to_owned(),
            events: ServiceUrls::DEFAULT_EVENTS_URL.to_owned(),
            data: ServiceUrls::DEFAULT_DATA_URL.to_owned(),
        }
    }
}

const CONFIGURATION_ENDPOINT: &str = "/v1/configuration";
const EVENTS_ENDPOINT: &str = "/v1/sse";
const TRACKING_ENDPOINT: &str = "/v1/visit/events";
const REMOTE_DATA_ENDPOINT: &str = "/v1/data";

/// [`Transport`] over HTTPS with a blocking `reqwest` client.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    /// Separate client without a request timeout for the long-lived event stream.
    stream_client: reqwest::blocking::Client,
    site_code: String,
    environment: Option<String>,
    urls: ServiceUrls,
    /// If we receive a 401 Unauthorized error during a request, it means the site code is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpTransport {
    /// Create a transport for `site_code`. `timeout` bounds every request except the event
    /// stream.
    pub fn new(
        site_code: impl Into<String>,
        environment: Option<String>,
        urls: ServiceUrls,
        timeout: Duration,
    ) -> Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        let stream_client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()?;
        Ok(HttpTransport {
            client,
            stream_client,
            site_code: site_code.into(),
            environment,
            urls,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn configuration_url(&self, timestamp: Option<i64>) -> Result<Url> {
        let base = format!(
            "{}{}/{}",
            self.urls.configuration, CONFIGURATION_ENDPOINT, self.site_code
        );
        let mut url = Url::parse(&base).map_err(Error::InvalidUrl)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sdkName", SDK_NAME);
            query.append_pair("sdkVersion", SDK_VERSION);
            if let Some(environment) = &self.environment {
                query.append_pair("environment", environment);
            }
            if let Some(timestamp) = timestamp {
                query.append_pair("ts", &timestamp.to_string());
            }
        }
        Ok(url)
    }

    fn url(&self, base: &str, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{base}{endpoint}")).map_err(Error::InvalidUrl)?;
        url.query_pairs_mut()
            .append_pair("siteCode", &self.site_code)
            .extend_pairs(params);
        Ok(url)
    }

    fn check_response(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            log::warn!(target: "flagline", "client is not authorized. Check your site code");
            self.unauthorized.store(true, Ordering::Relaxed);
            return Err(Error::Unauthorized);
        }
        log::warn!(target: "flagline", status = status.as_u16(); "received non-success response");
        Err(Error::HttpStatus(status.as_u16()))
    }

    fn ensure_authorized(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn fetch_configuration(&self, timestamp: Option<i64>) -> Result<Vec<u8>> {
        self.ensure_authorized()?;
        let url = self.configuration_url(timestamp)?;
        log::debug!(target: "flagline", "fetching configuration");
        let response = self.check_response(self.client.get(url).send()?)?;
        Ok(response.bytes()?.to_vec())
    }

    fn open_realtime_stream(&self) -> Result<RealtimeStream> {
        self.ensure_authorized()?;
        let url = self.url(&self.urls.events, EVENTS_ENDPOINT, &[])?;
        log::debug!(target: "flagline", "opening real-time update stream");
        let response = self.check_response(
            self.stream_client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()?,
        )?;
        Ok(Box::new(SseEvents::new(BufReader::new(response))))
    }

    fn send_tracking_data(&self, lines: &str) -> Result<()> {
        self.ensure_authorized()?;
        let url = self.url(&self.urls.data, TRACKING_ENDPOINT, &[])?;
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(lines.to_owned())
            .send()?;
        self.check_response(response)?;
        Ok(())
    }

    fn get_remote_data(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_authorized()?;
        let url = self.url(&self.urls.data, REMOTE_DATA_ENDPOINT, &[("key", key)])?;
        let response = self.check_response(self.client.get(url).timeout(timeout).send()?)?;
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct UpdateEvent {
    ts: i64,
}

/// Parses `text/event-stream` data lines into configuration timestamps.
pub(crate) struct SseEvents<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> SseEvents<R> {
    pub fn new(reader: R) -> SseEvents<R> {
        SseEvents {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for SseEvents<R> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Result<i64>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            let Some(data) = self.line.trim_end().strip_prefix("data:") else {
                // Comments, event names, ids and blank separators.
                continue;
            };
            match serde_json::from_str::<UpdateEvent>(data.trim_start()) {
                Ok(event) => return Some(Ok(event.ts)),
                Err(err) => {
                    log::debug!(target: "flagline", "ignoring malformed real-time event: {err}");
                }
            }
        }
    }
}
