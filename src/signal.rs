//! Capabilities supplied by the host around a tracker.
//!
//! The tracker never produces input on its own. The host hands it a
//! [`SignalSource`] that forwards pointer/keyboard activity into a
//! [`SignalSink`], and optionally a [`PresentationSink`] that mirrors the
//! active/idle state as a flag on some shared presentation root.

use std::fmt;
use std::sync::Weak;

use crate::activity::{PresentationFlag, TransitionKind};
use crate::tracker::{Tracker, TrackerId};

/// Source of raw activity signals for one subject.
///
/// The tracker calls [`attach`](Self::attach) when tracking starts and
/// [`detach`](Self::detach) when it stops. `observe`/`unobserve` are called
/// when the first listener of a kind arrives and when the last one leaves,
/// so a source can defer any per-kind wiring until someone is listening.
pub trait SignalSource: Send + Sync {
    /// Starts forwarding raw activity into `sink`.
    ///
    /// Runs under the tracker's hook lock: it may push signals, but must not
    /// untrack the subject or change listeners on the same tracker.
    fn attach(&self, sink: SignalSink);

    /// Stops forwarding. Called once, after which the sink is inert.
    fn detach(&self);

    /// A listener of `kind` now exists.
    fn observe(&self, kind: TransitionKind) {
        let _ = kind;
    }

    /// The last listener of `kind` went away.
    fn unobserve(&self, kind: TransitionKind) {
        let _ = kind;
    }
}

/// Handle a [`SignalSource`] uses to report activity.
///
/// The sink does not keep the tracker alive. Once the tracker is released,
/// signals are ignored.
#[derive(Clone)]
pub struct SignalSink {
    tracker_id: TrackerId,
    tracker: Weak<Tracker>,
}

impl SignalSink {
    pub(crate) fn new(tracker_id: TrackerId, tracker: Weak<Tracker>) -> Self {
        Self {
            tracker_id,
            tracker,
        }
    }

    /// Id of the tracker fed by this sink.
    #[must_use]
    pub const fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    /// Reports one raw activity signal.
    ///
    /// Returns false if the tracker has been released.
    pub fn signal(&self) -> bool {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.signal(),
            None => false,
        }
    }

    /// Returns true while the tracker still accepts signals.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|tracker| tracker.is_tracking())
    }
}

impl fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSink")
            .field("tracker_id", &self.tracker_id)
            .finish_non_exhaustive()
    }
}

/// Presentation root that mirrors the state as one of two exclusive flags.
pub trait PresentationSink: Send + Sync {
    /// Sets `flag` and removes the opposite one.
    fn set_flag(&self, flag: PresentationFlag);

    /// Removes both flags.
    fn clear(&self);
}

/// A source for hosts that push signals through [`Tracker::signal`] directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualSource;

impl SignalSource for ManualSource {
    fn attach(&self, _sink: SignalSink) {}

    fn detach(&self) {}
}
