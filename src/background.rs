//! Periodic background loops.
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{Error, Result};

enum Signal {
    /// Run the next tick right away.
    Wake,
    Stop,
}

/// A named thread calling `tick` every `period` until stopped.
///
/// Each tick runs to completion: stopping prevents new ticks but never interrupts one in
/// progress.
pub(crate) struct BackgroundTask {
    name: String,
    sender: mpsc::Sender<Signal>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    pub fn spawn(
        name: impl Into<String>,
        period: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> std::io::Result<BackgroundTask> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Signal>();

        let join_handle = {
            let name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || loop {
                    match receiver.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) | Ok(Signal::Wake) => {}
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "flagline", task = name; "background task stopped");
                            return;
                        }
                    }
                    let result =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut tick));
                    if result.is_err() {
                        log::warn!(target: "flagline", task = name; "background task panicked, skipping this tick");
                    }
                })?
        };

        Ok(BackgroundTask {
            name,
            sender,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Run the next tick without waiting for the period to elapse.
    pub fn wake(&self) {
        let _ = self.sender.send(Signal::Wake);
    }

    /// Ask the task to stop without waiting for it.
    pub fn stop(&self) {
        // Error means the thread has already exited.
        let _ = self.sender.send(Signal::Stop);
    }

    /// Stop the task and wait for the current tick to complete. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| {
                log::warn!(target: "flagline", task = self.name; "background thread panicked");
                Error::SynchronizerPanicked
            })?;
        }
        Ok(())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
