//! Delivery lifecycle of tracked visitor data.
use std::ops::Deref;

use rand::RngCore;

/// Delivery state of a tracked item.
///
/// Transitions are monotonic (`Unsent -> Transmitting -> Sent`) except for the rollback
/// `Transmitting -> Unsent` after a failed delivery. `Suppressed` items wait for
/// [`Sendable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryState {
    Suppressed,
    Unsent,
    Transmitting,
    Sent,
}

/// A data item together with its delivery state and idempotency nonce.
///
/// The nonce is assigned on creation and kept across retries, so the backend can deduplicate a
/// batch that was delivered but reported as failed. It is dropped once the item is sent.
#[derive(Debug, Clone)]
pub(crate) struct Sendable<T> {
    data: T,
    state: DeliveryState,
    nonce: Option<String>,
}

impl<T> Sendable<T> {
    pub fn new(data: T) -> Sendable<T> {
        Sendable {
            data,
            state: DeliveryState::Unsent,
            nonce: Some(new_nonce()),
        }
    }

    /// An item kept on the visitor without being scheduled for delivery.
    pub fn suppressed(data: T) -> Sendable<T> {
        Sendable {
            state: DeliveryState::Suppressed,
            ..Sendable::new(data)
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    #[cfg(test)]
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn is_sent(&self) -> bool {
        self.state == DeliveryState::Sent
    }

    /// `Suppressed -> Unsent`. Returns `false` if the item was not suppressed.
    pub fn release(&mut self) -> bool {
        if self.state != DeliveryState::Suppressed {
            return false;
        }
        self.state = DeliveryState::Unsent;
        true
    }

    /// `Unsent -> Transmitting`. Returns the nonce to send the item with, or `None` if the item
    /// is not waiting for delivery.
    pub fn begin_transmission(&mut self) -> Option<String> {
        if self.state != DeliveryState::Unsent {
            return None;
        }
        self.state = DeliveryState::Transmitting;
        self.nonce.clone()
    }

    /// Apply a delivery outcome to an item sent with `nonce`. Items replaced since they were
    /// collected (different nonce) are left alone.
    pub fn complete_transmission(&mut self, nonce: &str, delivered: bool) {
        if self.state != DeliveryState::Transmitting || self.nonce.as_deref() != Some(nonce) {
            return;
        }
        if delivered {
            self.state = DeliveryState::Sent;
            self.nonce = None;
        } else {
            self.state = DeliveryState::Unsent;
        }
    }
}

impl<T> Deref for Sendable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

/// Random 16-byte hex token.
pub(crate) fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
