//! Per-subject trackers.
//!
//! A [`Tracker`] binds one [`ActivityMonitor`] to a scheduler, a raw signal
//! source, an optional presentation sink and two listener lists. It is the
//! unit handed out by the registry.
//!
//! ## Fan-out
//!
//! Transitions are queued under the tracker lock and delivered with the lock
//! released, one transition at a time, to a snapshot of the listeners of the
//! matching kind. Only one thread delivers at a time: a transition produced
//! while a delivery pass is running (from another thread, or re-entrantly
//! from a listener) is delivered by that pass right after the current one.
//! With a single calling thread every transition is delivered before
//! `signal()` returns.

/// Events, listeners and registration handles.
pub mod listener;
/// Channel-backed subscription streams.
pub mod stream;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{
    ActivityMonitor, ActivityState, PresentationFlag, Step, TimerCommand, Transition,
    TransitionKind,
};
use crate::scheduler::{Scheduler, TimerEntry};
use crate::signal::{PresentationSink, SignalSink, SignalSource};

pub use listener::{ListenerId, ListenerRegistration, TransitionEvent, TransitionListener};
pub use stream::TransitionStream;

use listener::ListenerSet;

/// Unique identifier for a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackerId(Uuid);

impl TrackerId {
    /// Create a new random tracker id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrackerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Construction parameters resolved by the registry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackerSettings {
    pub timeout: Duration,
    pub sync_presentation: bool,
    pub stream_capacity: usize,
}

struct TrackerInner {
    monitor: ActivityMonitor,
    sync_presentation: bool,
    listeners: ListenerSet,
    observing: [bool; 2],
    pending: VecDeque<Transition>,
    dispatching: bool,
    released: bool,
}

/// Activity tracker for one subject.
pub struct Tracker {
    id: TrackerId,
    this: Weak<Tracker>,
    scheduler: Arc<dyn Scheduler>,
    source: Box<dyn SignalSource>,
    presentation: Option<Arc<dyn PresentationSink>>,
    stream_capacity: usize,
    // Serializes listener-count edges with the matching source hooks.
    hooks: Mutex<()>,
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    pub(crate) fn new(
        settings: TrackerSettings,
        scheduler: Arc<dyn Scheduler>,
        source: Box<dyn SignalSource>,
        presentation: Option<Arc<dyn PresentationSink>>,
    ) -> Arc<Self> {
        let monitor = ActivityMonitor::new(settings.timeout, scheduler.now());
        Arc::new_cyclic(|this| Self {
            id: TrackerId::new(),
            this: this.clone(),
            scheduler,
            source,
            presentation,
            stream_capacity: settings.stream_capacity.max(1),
            hooks: Mutex::new(()),
            inner: Mutex::new(TrackerInner {
                monitor,
                sync_presentation: settings.sync_presentation,
                listeners: ListenerSet::default(),
                observing: [false; 2],
                pending: VecDeque::new(),
                dispatching: false,
                released: false,
            }),
        })
    }

    /// Arms the first idle timer, attaches the signal source and mirrors
    /// the initial state. Does nothing once the tracker has been released.
    pub(crate) fn start(&self) {
        {
            // Held across attach so a concurrent release detaches after it.
            let _hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            {
                let inner = self.lock();
                if inner.released {
                    return;
                }
                self.apply_timer(inner.monitor.pending_timer());
            }
            self.source.attach(SignalSink::new(self.id, self.this.clone()));
        }

        let sync = {
            let inner = self.lock();
            if inner.released {
                return;
            }
            inner.sync_presentation
        };
        if sync {
            if let Some(sink) = &self.presentation {
                sink.set_flag(PresentationFlag::UserActive);
                // Released while the flag was being set.
                if !self.is_tracking() {
                    sink.clear();
                }
            }
        }
        tracing::debug!(tracker = %self.id, timeout_ms = self.timeout_ms(), "tracking started");
    }

    /// Stops tracking: cancels the idle timer, drops every listener and
    /// detaches the source. Idempotent.
    pub(crate) fn release(&self) {
        let _hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let observed = {
            let mut inner = self.lock();
            if inner.released {
                return;
            }
            inner.released = true;
            inner.monitor.cancel();
            inner.pending.clear();
            inner.listeners.clear();
            std::mem::take(&mut inner.observing)
        };
        self.scheduler.cancel(self.id);

        for kind in TransitionKind::ALL {
            if observed[kind.index()] {
                self.source.unobserve(kind);
            }
        }
        self.source.detach();
        if let Some(sink) = &self.presentation {
            sink.clear();
        }
        tracing::debug!(tracker = %self.id, "tracking stopped");
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Unique id of this tracker.
    #[must_use]
    pub const fn id(&self) -> TrackerId {
        self.id
    }

    /// Current computed state.
    #[must_use]
    pub fn state(&self) -> ActivityState {
        self.lock().monitor.state()
    }

    /// Returns true while the subject is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Current idle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.lock().monitor.timeout()
    }

    /// Current idle timeout in milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout().as_millis()).unwrap_or(u64::MAX)
    }

    /// Instant of the last raw signal (or of tracking start).
    #[must_use]
    pub fn last_signal(&self) -> Instant {
        self.lock().monitor.last_signal()
    }

    /// Whether transitions are mirrored to the presentation sink.
    #[must_use]
    pub fn is_update_sync(&self) -> bool {
        self.lock().sync_presentation
    }

    /// Whether a presentation sink is configured.
    #[must_use]
    pub fn has_presentation(&self) -> bool {
        self.presentation.is_some()
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: TransitionKind) -> usize {
        self.lock().listeners.len(kind)
    }

    /// Whether the raw observer for `kind` is attached to the source.
    #[must_use]
    pub fn is_observing(&self, kind: TransitionKind) -> bool {
        self.lock().observing[kind.index()]
    }

    /// False once the tracker has been untracked.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        !self.lock().released
    }

    /// Number of transitions of `kind` since tracking started.
    #[must_use]
    pub fn transitions(&self, kind: TransitionKind) -> u64 {
        self.lock().monitor.transitions(kind)
    }

    /// A sink feeding this tracker, for hosts wiring their own sources.
    #[must_use]
    pub fn sink(&self) -> SignalSink {
        SignalSink::new(self.id, self.this.clone())
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Reports one raw activity signal.
    ///
    /// Returns false if the tracker has been released.
    pub fn signal(&self) -> bool {
        let now = self.scheduler.now();
        {
            let mut inner = self.lock();
            if inner.released {
                return false;
            }
            let step = inner.monitor.on_signal(now);
            self.apply(&mut inner, step);
        }
        tracing::trace!(tracker = %self.id, "activity signal");
        self.dispatch();
        true
    }

    /// Sets the idle timeout in milliseconds. Negative values become zero.
    pub fn set_timeout_ms(&self, timeout_ms: i64) {
        self.update_monitor(|monitor| monitor.set_timeout_ms(timeout_ms));
        tracing::debug!(tracker = %self.id, timeout_ms = self.timeout_ms(), "timeout changed");
    }

    /// Sets the idle timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.update_monitor(|monitor| monitor.set_timeout(timeout));
        tracing::debug!(tracker = %self.id, timeout_ms = self.timeout_ms(), "timeout changed");
    }

    /// Enables or disables mirroring to the presentation sink.
    ///
    /// Enabling mirrors the current state right away; disabling clears both
    /// flags.
    pub fn set_update_sync(&self, sync: bool) {
        let state = {
            let mut inner = self.lock();
            if inner.released || inner.sync_presentation == sync {
                inner.sync_presentation = sync;
                return;
            }
            inner.sync_presentation = sync;
            inner.monitor.state()
        };
        if let Some(sink) = &self.presentation {
            if sync {
                sink.set_flag(PresentationFlag::for_state(state));
            } else {
                sink.clear();
            }
        }
    }

    /// Adds a listener for `Idle -> Active` transitions.
    pub fn add_active_listener(
        &self,
        listener: impl TransitionListener + 'static,
    ) -> ListenerRegistration {
        self.add_listener(TransitionKind::Active, Arc::new(listener))
    }

    /// Adds a listener for `Active -> Idle` transitions.
    pub fn add_inactive_listener(
        &self,
        listener: impl TransitionListener + 'static,
    ) -> ListenerRegistration {
        self.add_listener(TransitionKind::Inactive, Arc::new(listener))
    }

    /// Adds a listener for the given kind.
    pub fn add_listener(
        &self,
        kind: TransitionKind,
        listener: Arc<dyn TransitionListener>,
    ) -> ListenerRegistration {
        let _hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let (id, first) = {
            let mut inner = self.lock();
            if inner.released {
                return ListenerRegistration::inert(kind);
            }
            let (id, first) = inner.listeners.insert(kind, listener);
            if first {
                inner.observing[kind.index()] = true;
            }
            (id, first)
        };
        if first {
            self.source.observe(kind);
            tracing::debug!(tracker = %self.id, %kind, "observer attached");
        }
        ListenerRegistration::new(self.this.clone(), kind, id)
    }

    /// Subscribes to both kinds through a bounded stream.
    pub fn subscribe(&self) -> TransitionStream {
        self.subscribe_with_capacity(self.stream_capacity)
    }

    /// Subscribes with an explicit buffer size. A full buffer drops events.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> TransitionStream {
        let (tx, rx) = bounded::<TransitionEvent>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let registrations = TransitionKind::ALL
            .iter()
            .map(|&kind| {
                let listener = forwarder(tx.clone(), Arc::clone(&dropped));
                self.add_listener(kind, Arc::new(listener))
            })
            .collect();

        TransitionStream::new(rx, registrations, dropped)
    }

    // ── Internals ────────────────────────────────────────────────────

    pub(crate) fn remove_listener(&self, kind: TransitionKind, id: ListenerId) -> bool {
        let _hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let last = {
            let mut inner = self.lock();
            if inner.released {
                return false;
            }
            let Some(last) = inner.listeners.remove(kind, id) else {
                return false;
            };
            if last {
                inner.observing[kind.index()] = false;
            }
            last
        };
        if last {
            self.source.unobserve(kind);
            tracing::debug!(tracker = %self.id, %kind, "observer detached");
        }
        true
    }

    /// Handles expiry of the idle timer armed with `generation`.
    pub(crate) fn expire(&self, generation: u64) {
        let now = self.scheduler.now();
        {
            let mut inner = self.lock();
            if inner.released {
                return;
            }
            let step = inner.monitor.on_timer(generation, now);
            self.apply(&mut inner, step);
        }
        self.dispatch();
    }

    fn update_monitor(&self, op: impl FnOnce(&mut ActivityMonitor) -> Step) {
        {
            let mut inner = self.lock();
            if inner.released {
                return;
            }
            let step = op(&mut inner.monitor);
            self.apply(&mut inner, step);
        }
        self.dispatch();
    }

    fn apply(&self, inner: &mut TrackerInner, step: Step) {
        // Armed while the lock is held so the scheduler sees generations in order.
        self.apply_timer(step.timer);
        if let Some(transition) = step.transition {
            inner.pending.push_back(transition);
        }
    }

    fn apply_timer(&self, command: TimerCommand) {
        match command {
            TimerCommand::Keep => {}
            TimerCommand::Arm {
                generation,
                deadline,
            } => self
                .scheduler
                .arm(TimerEntry::new(self.id, generation, deadline, self.this.clone())),
            TimerCommand::Cancel => self.scheduler.cancel(self.id),
        }
    }

    fn dispatch(&self) {
        {
            let mut inner = self.lock();
            if inner.dispatching || inner.pending.is_empty() {
                return;
            }
            inner.dispatching = true;
        }
        let guard = DispatchGuard(self);

        loop {
            let (transition, listeners, mirror) = {
                let mut inner = self.lock();
                let Some(transition) = inner.pending.pop_front() else {
                    inner.dispatching = false;
                    break;
                };
                let listeners = inner.listeners.snapshot(transition.kind);
                let mirror = inner.sync_presentation;
                (transition, listeners, mirror)
            };

            tracing::info!(tracker = %self.id, kind = %transition.kind, "activity transition");

            if mirror {
                if let Some(sink) = &self.presentation {
                    sink.set_flag(transition.kind.flag());
                }
            }
            if listeners.is_empty() {
                continue;
            }
            let Some(this) = self.this.upgrade() else {
                continue;
            };
            let event = TransitionEvent::new(this, transition.kind);
            for listener in &listeners {
                listener.on_transition(&event);
            }
        }
        std::mem::forget(guard);
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("state", &inner.monitor.state())
            .field("timeout", &inner.monitor.timeout())
            .field("sync_presentation", &inner.sync_presentation)
            .field("released", &inner.released)
            .finish_non_exhaustive()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.release();
    }
}

/// Clears the dispatching flag if a listener panics mid-pass.
struct DispatchGuard<'a>(&'a Tracker);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().dispatching = false;
    }
}

fn forwarder(
    tx: Sender<TransitionEvent>,
    dropped: Arc<AtomicU64>,
) -> impl Fn(&TransitionEvent) + Send + Sync {
    move |event: &TransitionEvent| match tx.try_send(event.clone()) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!(tracker = %event.tracker_id(), "transition stream full, event dropped");
        }
    }
}
