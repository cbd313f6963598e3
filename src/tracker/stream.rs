//! Bounded subscription streams over a tracker's transitions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{IdleResult, StreamError};

use super::listener::{ListenerRegistration, TransitionEvent};

/// A subscription stream for transition events of both kinds.
///
/// Dropping this stream removes its listeners.
#[derive(Debug)]
pub struct TransitionStream {
    rx: Receiver<TransitionEvent>,
    registrations: Vec<ListenerRegistration>,
    dropped: Arc<AtomicU64>,
    unsubscribed: AtomicBool,
}

impl TransitionStream {
    pub(crate) fn new(
        rx: Receiver<TransitionEvent>,
        registrations: Vec<ListenerRegistration>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            rx,
            registrations,
            dropped,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// Explicit unsubscription. Idempotent.
    ///
    /// Events already buffered can still be received; afterwards the stream
    /// reports `Disconnected`.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        for registration in &self.registrations {
            registration.remove();
        }
    }

    /// Number of events discarded because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true when no event is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> IdleResult<TransitionEvent> {
        self.rx.recv().map_err(|_| StreamError::Disconnected.into())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> IdleResult<TransitionEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StreamError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into(),
            RecvTimeoutError::Disconnected => StreamError::Disconnected.into(),
        })
    }

    /// Receive an already buffered event without blocking.
    pub fn try_recv(&self) -> IdleResult<TransitionEvent> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => StreamError::Empty.into(),
            TryRecvError::Disconnected => StreamError::Disconnected.into(),
        })
    }

    /// Drains every buffered event.
    pub fn drain(&self) -> Vec<TransitionEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for TransitionStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
