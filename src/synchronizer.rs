//! A background thread that keeps the configuration store up to date, either by polling or by
//! following real-time update notifications.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    configuration::{Configuration, Settings},
    configuration_store::ConfigurationStore,
    transport::Transport,
    update_listener::{ConfigurationUpdate, UpdateListener},
    Error, Result,
};

/// Configuration for [`Synchronizer`].
#[derive(Debug, Clone)]
pub(crate) struct SynchronizerConfig {
    /// Interval between polls while polling.
    pub refresh_interval: Duration,
    /// Randomized duration subtracted from the interval so that client instances don't poll in
    /// lockstep.
    pub jitter: Duration,
    /// Attempts of the initial fetch before the readiness gate reports the failure.
    pub initial_attempts: u32,
    /// Wait between initial fetch attempts.
    pub initial_backoff: Duration,
}

impl SynchronizerConfig {
    pub const DEFAULT_INITIAL_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

    pub fn new(refresh_interval: Duration) -> SynchronizerConfig {
        SynchronizerConfig {
            refresh_interval,
            jitter: refresh_interval / 20,
            initial_attempts: SynchronizerConfig::DEFAULT_INITIAL_ATTEMPTS,
            initial_backoff: SynchronizerConfig::DEFAULT_INITIAL_BACKOFF,
        }
    }
}

enum Command {
    Stop,
    /// A real-time notification about a configuration with the given server timestamp.
    StreamEvent(i64),
    StreamClosed,
}

/// Outcome of the initial configuration fetch.
///
/// Holds `None` until the first fetch completes, `Some(Ok(()))` once a configuration has been
/// applied and `Some(Err(...))` if the initial fetch failed.
#[derive(Default)]
struct Readiness {
    result: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl Readiness {
    fn set(&self, value: Result<()>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.ready.notify_all();
    }

    fn set_if_unset(&self, value: Result<()>) {
        let mut result = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if result.is_none() {
            *result = Some(value);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut lock = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .ready
                        .wait(lock)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    #[cfg(test)]
    fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let lock = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        let (lock, _) = self
            .ready
            .wait_timeout_while(lock, timeout, |result| result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        lock.clone()
    }
}

/// The configuration synchronizer thread.
///
/// Fetches the configuration once at start, then keeps it fresh. When the configuration enables
/// real-time updates, a reader thread follows the event stream and every notification triggers a
/// fetch. Losing the stream or failing a fetch falls back to polling; the next successful fetch
/// reconnects the stream.
pub(crate) struct Synchronizer {
    join_handle: Mutex<Option<JoinHandle<()>>>,
    /// Used to send commands to the synchronizer thread.
    command_sender: mpsc::Sender<Command>,
    readiness: Arc<Readiness>,
}

impl Synchronizer {
    pub fn start(
        transport: Arc<dyn Transport>,
        store: Arc<ConfigurationStore>,
        listener: Arc<dyn UpdateListener + Send + Sync>,
        config: SynchronizerConfig,
    ) -> std::io::Result<Synchronizer> {
        let (command_sender, command_receiver) = mpsc::channel::<Command>();
        let readiness = Arc::new(Readiness::default());

        let join_handle = {
            let readiness = Arc::clone(&readiness);
            let mut worker = Worker {
                transport,
                store,
                listener,
                config,
                commands: command_receiver,
                command_sender: command_sender.clone(),
                readiness: Arc::clone(&readiness),
                stream: None,
                polling: true,
            };

            std::thread::Builder::new()
                .name("flagline-synchronizer".to_owned())
                .spawn(move || {
                    let result =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker.run()));
                    if result.is_err() {
                        readiness.set_if_unset(Err(Error::SynchronizerPanicked));
                    } else {
                        readiness.set_if_unset(Err(Error::ClientClosed));
                    }
                })?
        };

        Ok(Synchronizer {
            join_handle: Mutex::new(Some(join_handle)),
            command_sender,
            readiness,
        })
    }

    /// Block until the initial fetch completes.
    ///
    /// # Errors
    ///
    /// Returns the error of the last initial fetch attempt, [`Error::ClientClosed`] if the
    /// synchronizer was stopped first or [`Error::SynchronizerPanicked`].
    pub fn wait_for_configuration(&self) -> Result<()> {
        self.readiness.wait()
    }

    /// Like [`Synchronizer::wait_for_configuration`], but gives up after `timeout` and returns
    /// `None`.
    #[cfg(test)]
    pub fn wait_for_configuration_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.readiness.wait_timeout(timeout)
    }

    /// Stop the synchronizer thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means that the receiver was dropped: the thread has already exited.
        let _ = self.command_sender.send(Command::Stop);
    }

    /// Stop the synchronizer thread and block waiting for it to exit. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| Error::SynchronizerPanicked)?;
        }
        Ok(())
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        // The worker holds its own sender, so the channel never disconnects on its own.
        self.stop();
    }
}

/// Handle of a running stream reader thread.
struct StreamHandle {
    /// Asks the reader to exit after the next notification.
    cancelled: Arc<AtomicBool>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    store: Arc<ConfigurationStore>,
    listener: Arc<dyn UpdateListener + Send + Sync>,
    config: SynchronizerConfig,
    commands: mpsc::Receiver<Command>,
    /// Handed to stream readers.
    command_sender: mpsc::Sender<Command>,
    readiness: Arc<Readiness>,
    /// Running stream reader, if any.
    stream: Option<StreamHandle>,
    /// Whether the worker fetches on a timer.
    polling: bool,
}

enum Wake {
    Stop,
    Timeout,
    StreamEvent(i64),
    StreamClosed,
}

impl Worker {
    fn run(&mut self) {
        if !self.initial_fetch() {
            return;
        }

        loop {
            match self.next_wake() {
                Wake::Stop => {
                    log::debug!(target: "flagline", "synchronizer thread received stop command");
                    return;
                }
                Wake::Timeout => {
                    log::debug!(target: "flagline", "polling configuration");
                    if let Err(err @ (Error::Unauthorized | Error::InvalidUrl(_))) =
                        self.fetch(None)
                    {
                        log::warn!(target: "flagline", "stopping configuration updates: {err}");
                        return;
                    }
                }
                Wake::StreamEvent(timestamp) => {
                    if self.stream.is_none() {
                        continue;
                    }
                    let is_newer = self
                        .store
                        .get_configuration()
                        .map_or(true, |current| current.timestamp() < timestamp);
                    if is_newer {
                        log::debug!(target: "flagline", timestamp; "received configuration update notification");
                        let _ = self.fetch(Some(timestamp));
                    }
                }
                Wake::StreamClosed => {
                    if self.stream.take().is_some() {
                        log::warn!(target: "flagline", "real-time update stream lost, falling back to polling");
                    }
                    self.polling = true;
                }
            }
        }
    }

    /// Returns `false` if the worker should exit.
    fn initial_fetch(&mut self) -> bool {
        let attempts = self.config.initial_attempts.max(1);
        for attempt in 1..=attempts {
            match self.fetch(None) {
                Ok(()) => return true,
                Err(err @ (Error::Unauthorized | Error::InvalidUrl(_))) => {
                    // Unrecoverable errors
                    self.readiness.set(Err(err));
                    return false;
                }
                Err(err) if attempt == attempts => {
                    log::warn!(target: "flagline", attempts; "initial configuration fetch failed: {err}");
                    self.readiness.set(Err(err));
                }
                Err(err) => {
                    log::debug!(target: "flagline", attempt; "configuration fetch failed, retrying: {err}");
                    match self.commands.recv_timeout(self.config.initial_backoff) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
                        // No stream is running before the first configuration.
                        Ok(Command::StreamEvent(_) | Command::StreamClosed) => {}
                    }
                }
            }
        }
        true
    }

    fn next_wake(&self) -> Wake {
        let command = if self.polling {
            let timeout = jitter(self.config.refresh_interval, self.config.jitter);
            match self.commands.recv_timeout(timeout) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => return Wake::Timeout,
                Err(RecvTimeoutError::Disconnected) => return Wake::Stop,
            }
        } else {
            match self.commands.recv() {
                Ok(command) => command,
                Err(_) => return Wake::Stop,
            }
        };
        match command {
            Command::Stop => Wake::Stop,
            Command::StreamEvent(timestamp) => Wake::StreamEvent(timestamp),
            Command::StreamClosed => Wake::StreamClosed,
        }
    }

    /// Fetch and apply a configuration, then re-evaluate the synchronization mode.
    fn fetch(&mut self, timestamp: Option<i64>) -> Result<()> {
        match self.fetch_and_apply(timestamp) {
            Ok(settings) => {
                self.readiness.set(Ok(()));
                self.select_mode(&settings);
                Ok(())
            }
            Err(err) => {
                if !self.polling {
                    log::warn!(target: "flagline", "configuration fetch failed, falling back to polling: {err}");
                    self.polling = true;
                } else {
                    log::warn!(target: "flagline", "configuration fetch failed: {err}");
                }
                Err(err)
            }
        }
    }

    fn fetch_and_apply(&self, timestamp: Option<i64>) -> Result<Settings> {
        let body = self.transport.fetch_configuration(timestamp)?;
        let configuration = Configuration::from_json(&body)?;
        let settings = *configuration.settings();
        let update = ConfigurationUpdate::new(&configuration);
        if self.store.apply(configuration) {
            log::debug!(target: "flagline", timestamp = update.timestamp; "applied configuration");
            self.listener.on_update(update);
        }
        Ok(settings)
    }

    fn select_mode(&mut self, settings: &Settings) {
        if !settings.real_time_update {
            // Dropping the handle asks the reader to exit.
            self.stream = None;
            self.polling = true;
            return;
        }
        if self.stream.is_none() {
            self.stream = Some(self.spawn_stream_reader());
        }
        self.polling = false;
    }

    fn spawn_stream_reader(&self) -> StreamHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = StreamHandle {
            cancelled: Arc::clone(&cancelled),
        };
        let transport = Arc::clone(&self.transport);
        let sender = self.command_sender.clone();

        let spawned = std::thread::Builder::new()
            .name("flagline-stream".to_owned())
            .spawn(move || {
                // The reader may outlive the synchronizer while blocked on the connection. It
                // exits on the next notification once the command channel is gone.
                match transport.open_realtime_stream() {
                    Ok(stream) => {
                        for event in stream {
                            if cancelled.load(Ordering::Relaxed) {
                                return;
                            }
                            match event {
                                Ok(timestamp) => {
                                    if sender.send(Command::StreamEvent(timestamp)).is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    log::debug!(target: "flagline", "real-time stream error: {err}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!(target: "flagline", "failed to open real-time update stream: {err}");
                    }
                }
                if !cancelled.load(Ordering::Relaxed) {
                    let _ = sender.send(Command::StreamClosed);
                }
            });
        if let Err(err) = spawned {
            log::warn!(target: "flagline", "failed to start real-time stream reader: {err}");
            let _ = self.command_sender.send(Command::StreamClosed);
        }
        handle
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::transport::RealtimeStream;

    #[derive(Default)]
    struct ScriptedTransport {
        /// Responses for successive fetches. When exhausted the last one repeats.
        responses: Mutex<VecDeque<Result<Vec<u8>>>>,
        fetched: Mutex<Vec<Option<i64>>>,
        stream_events: Mutex<Vec<i64>>,
        streams_opened: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Vec<u8>>>) -> ScriptedTransport {
            ScriptedTransport {
                responses: Mutex::new(responses.into()),
                ..ScriptedTransport::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn fetch_configuration(&self, timestamp: Option<i64>) -> Result<Vec<u8>> {
            self.fetched.lock().unwrap().push(timestamp);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }

        fn open_realtime_stream(&self) -> Result<RealtimeStream> {
            self.streams_opened.fetch_add(1, Ordering::SeqCst);
            let events = std::mem::take(&mut *self.stream_events.lock().unwrap());
            Ok(Box::new(events.into_iter().map(Ok::<i64, Error>)))
        }

        fn send_tracking_data(&self, _lines: &str) -> Result<()> {
            Ok(())
        }

        fn get_remote_data(&self, _key: &str, _timeout: Duration) -> Result<Vec<u8>> {
            Err(Error::HttpStatus(404))
        }
    }

    fn document(timestamp: i64, real_time: bool) -> Result<Vec<u8>> {
        Ok(format!(
            r#"{{"timestamp": {timestamp}, "settings": {{"realTimeUpdate": {real_time}}}}}"#
        )
        .into_bytes())
    }

    fn config(refresh_interval: Duration) -> SynchronizerConfig {
        SynchronizerConfig {
            refresh_interval,
            jitter: Duration::ZERO,
            initial_attempts: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }

    fn start(
        transport: Arc<ScriptedTransport>,
        refresh_interval: Duration,
    ) -> (Synchronizer, Arc<ConfigurationStore>) {
        let store = Arc::new(ConfigurationStore::new());
        let synchronizer = Synchronizer::start(
            transport,
            store.clone(),
            Arc::new(crate::update_listener::NoopUpdateListener),
            config(refresh_interval),
        )
        .unwrap();
        (synchronizer, store)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn initial_fetch_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::HttpStatus(500)),
            Err(Error::HttpStatus(503)),
            document(1, false),
        ]));
        let (synchronizer, store) = start(transport.clone(), Duration::from_secs(60));

        assert!(synchronizer.wait_for_configuration().is_ok());
        assert_eq!(store.get_configuration().unwrap().timestamp(), 1);
        assert_eq!(transport.fetched.lock().unwrap().len(), 3);
        synchronizer.shutdown().unwrap();
    }

    #[test]
    fn initial_failure_is_reported_then_polling_recovers() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::HttpStatus(500)),
            Err(Error::HttpStatus(500)),
            Err(Error::HttpStatus(500)),
            document(7, false),
        ]));
        let (synchronizer, store) = start(transport.clone(), Duration::from_millis(20));

        assert!(matches!(
            synchronizer.wait_for_configuration(),
            Err(Error::HttpStatus(500))
        ));
        wait_until(|| store.get_configuration().is_some());
        assert_eq!(store.get_configuration().unwrap().timestamp(), 7);
        assert!(synchronizer.wait_for_configuration().is_ok());
        synchronizer.shutdown().unwrap();
    }

    #[test]
    fn unauthorized_stops_synchronizer() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(Error::Unauthorized)]));
        let (synchronizer, _store) = start(transport.clone(), Duration::from_millis(10));

        assert!(matches!(
            synchronizer.wait_for_configuration(),
            Err(Error::Unauthorized)
        ));
        synchronizer.shutdown().unwrap();
        assert_eq!(transport.fetched.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_notifications_trigger_fetches() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            document(1, true),
            document(5, true),
        ]));
        *transport.stream_events.lock().unwrap() = vec![5];
        let (synchronizer, store) = start(transport.clone(), Duration::from_millis(20));

        synchronizer.wait_for_configuration().unwrap();
        wait_until(|| store.get_configuration().unwrap().timestamp() == 5);
        assert!(transport.fetched.lock().unwrap().contains(&Some(5)));

        // The scripted stream ends right away: the synchronizer polls and reconnects.
        wait_until(|| transport.streams_opened.load(Ordering::SeqCst) >= 2);
        synchronizer.shutdown().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new(vec![document(1, false)]));
        let (synchronizer, _store) = start(transport, Duration::from_secs(60));
        synchronizer.wait_for_configuration().unwrap();
        synchronizer.stop();
        synchronizer.shutdown().unwrap();
        synchronizer.shutdown().unwrap();
    }

    #[test]
    fn stopping_before_configuration_unblocks_waiters() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(Error::HttpStatus(500))]));
        let store = Arc::new(ConfigurationStore::new());
        let synchronizer = Synchronizer::start(
            transport,
            store,
            Arc::new(crate::update_listener::NoopUpdateListener),
            SynchronizerConfig {
                initial_backoff: Duration::from_secs(60),
                ..config(Duration::from_secs(60))
            },
        )
        .unwrap();
        assert!(synchronizer
            .wait_for_configuration_timeout(Duration::from_millis(50))
            .is_none());
        synchronizer.shutdown().unwrap();
        assert!(matches!(
            synchronizer.wait_for_configuration(),
            Err(Error::ClientClosed)
        ));
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let result = super::jitter(interval, Duration::from_secs(30));
        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        assert_eq!(super::jitter(interval, Duration::ZERO), interval);
    }
}
