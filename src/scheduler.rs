//! Scheduling contexts for idle timers.
//!
//! A [`Scheduler`] is the clock and the one-shot timer facility shared by the
//! trackers of a registry. It keeps at most one pending [`TimerEntry`] per
//! tracker: arming replaces whatever was pending for the same tracker.
//!
//! Two implementations are provided:
//! - [`ThreadScheduler`] runs a dedicated worker thread that sleeps until the
//!   next deadline. Transitions to `Idle` are delivered on that thread.
//! - [`ManualScheduler`] keeps virtual time and fires timers only when the
//!   host calls [`ManualScheduler::advance`] or [`ManualScheduler::run_due`].
//!   It suits hosts that already own an event loop, and deterministic tests.
//!
//! Cancellation does not depend on the scheduler: every entry carries the
//! generation it was armed with, and the tracker ignores stale generations.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{IdleError, IdleResult};
use crate::tracker::{Tracker, TrackerId};

/// A pending idle timer for one tracker.
pub struct TimerEntry {
    tracker_id: TrackerId,
    generation: u64,
    deadline: Instant,
    target: Weak<Tracker>,
}

impl TimerEntry {
    pub(crate) fn new(
        tracker_id: TrackerId,
        generation: u64,
        deadline: Instant,
        target: Weak<Tracker>,
    ) -> Self {
        Self {
            tracker_id,
            generation,
            deadline,
            target,
        }
    }

    /// The tracker this timer belongs to.
    #[must_use]
    pub const fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    /// Generation the timer was armed with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// When the timer is due.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Delivers the expiry to the tracker, if it still exists.
    ///
    /// Must be called without holding any scheduler lock: the tracker may
    /// re-arm or cancel from inside its listeners.
    pub fn fire(self) {
        if let Some(tracker) = self.target.upgrade() {
            tracker.expire(self.generation);
        }
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("tracker_id", &self.tracker_id)
            .field("generation", &self.generation)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Clock plus one-shot timers, one pending timer per tracker.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Current time on this scheduler's clock.
    fn now(&self) -> Instant;

    /// Schedules `entry`, replacing any pending timer of the same tracker.
    fn arm(&self, entry: TimerEntry);

    /// Drops the pending timer of a tracker, if any.
    fn cancel(&self, tracker_id: TrackerId);
}

// ── Thread scheduler ─────────────────────────────────────────────────

enum ControlMsg {
    Arm(TimerEntry),
    Cancel(TrackerId),
}

/// Scheduler backed by a dedicated timer thread.
///
/// Dropping the scheduler closes the control channel; the worker exits once
/// it notices and discards any pending timers.
pub struct ThreadScheduler {
    control_tx: Sender<ControlMsg>,
    fired: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Spawns a scheduler with the default worker name.
    ///
    /// # Errors
    ///
    /// Returns `IdleError::Internal` if the worker thread cannot be spawned.
    pub fn new() -> IdleResult<Self> {
        Self::with_name("idlewatch-timer")
    }

    /// Spawns a scheduler whose worker thread carries `name`.
    ///
    /// # Errors
    ///
    /// Returns `IdleError::Internal` if the worker thread cannot be spawned.
    pub fn with_name(name: impl Into<String>) -> IdleResult<Self> {
        let (control_tx, control_rx) = unbounded::<ControlMsg>();
        let fired = Arc::new(AtomicU64::new(0));

        let thread_fired = Arc::clone(&fired);
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_loop(&control_rx, &thread_fired))
            .map_err(|e| IdleError::internal(format!("failed to spawn timer worker: {e}")))?;

        Ok(Self {
            control_tx,
            fired,
            join: Mutex::new(Some(join)),
        })
    }

    /// Number of timers delivered so far (stale ones included).
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Wraps the scheduler for sharing with a registry.
    #[must_use]
    pub fn shared(self) -> Arc<dyn Scheduler> {
        Arc::new(self)
    }
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("fired", &self.fired())
            .finish_non_exhaustive()
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn arm(&self, entry: TimerEntry) {
        tracing::trace!(
            tracker = %entry.tracker_id,
            generation = entry.generation,
            "arming idle timer"
        );
        // The worker only goes away after this handle is dropped.
        let _ = self.control_tx.send(ControlMsg::Arm(entry));
    }

    fn cancel(&self, tracker_id: TrackerId) {
        let _ = self.control_tx.send(ControlMsg::Cancel(tracker_id));
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        // Swap in a dead sender so the worker observes a closed channel.
        let (dummy_tx, _) = unbounded::<ControlMsg>();
        drop(std::mem::replace(&mut self.control_tx, dummy_tx));

        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // A timer callback may drop the last scheduler handle from the
            // worker itself; joining there would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(control_rx: &Receiver<ControlMsg>, fired: &AtomicU64) {
    let mut pending: HashMap<TrackerId, TimerEntry> = HashMap::new();

    tracing::debug!("timer worker started");
    loop {
        let next_deadline = pending.values().map(TimerEntry::deadline).min();
        let msg = match next_deadline {
            Some(deadline) => control_rx.recv_deadline(deadline),
            None => control_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match msg {
            Ok(ControlMsg::Arm(entry)) => {
                pending.insert(entry.tracker_id, entry);
            }
            Ok(ControlMsg::Cancel(tracker_id)) => {
                pending.remove(&tracker_id);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Checked after every message so a busy control channel cannot
        // starve due timers.
        for entry in take_due(&mut pending, Instant::now()) {
            fired.fetch_add(1, Ordering::Relaxed);
            entry.fire();
        }
    }
    tracing::debug!(discarded = pending.len(), "timer worker stopped");
}

/// Removes every entry due at `now`, earliest deadline first.
fn take_due(pending: &mut HashMap<TrackerId, TimerEntry>, now: Instant) -> Vec<TimerEntry> {
    let due_ids: Vec<TrackerId> = pending
        .values()
        .filter(|entry| entry.deadline <= now)
        .map(TimerEntry::tracker_id)
        .collect();

    let mut due: Vec<TimerEntry> = due_ids
        .iter()
        .filter_map(|id| pending.remove(id))
        .collect();
    due.sort_by_key(TimerEntry::deadline);
    due
}

// ── Manual scheduler ─────────────────────────────────────────────────

#[derive(Debug)]
struct ManualState {
    now: Instant,
    pending: HashMap<TrackerId, TimerEntry>,
}

/// Scheduler driven by explicit calls instead of a thread.
///
/// Time only moves through [`advance`](Self::advance). Timers fire on the
/// calling thread, earliest deadline first, with virtual time set to each
/// timer's deadline while it fires.
#[derive(Debug)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a scheduler whose virtual clock starts at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a scheduler whose virtual clock starts at `now`.
    #[must_use]
    pub fn starting_at(now: Instant) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                pending: HashMap::new(),
            }),
        }
    }

    /// Moves virtual time forward by `by` and fires every timer due on the way.
    ///
    /// Timers armed while firing are honoured if they fall inside the window.
    /// Returns the number of timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = {
            let state = self.lock();
            state.now.checked_add(by).unwrap_or(state.now)
        };

        let mut fired = 0;
        loop {
            let next = {
                let mut state = self.lock();
                let due = state
                    .pending
                    .values()
                    .filter(|entry| entry.deadline <= target)
                    .min_by_key(|entry| entry.deadline)
                    .map(TimerEntry::tracker_id);
                match due.and_then(|id| state.pending.remove(&id)) {
                    Some(entry) => {
                        state.now = state.now.max(entry.deadline);
                        Some(entry)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            let Some(entry) = next else {
                return fired;
            };
            entry.fire();
            fired += 1;
        }
    }

    /// Fires every timer that is already due without moving time.
    pub fn run_due(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().pending.values().map(TimerEntry::deadline).min()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.lock().now
    }

    fn arm(&self, entry: TimerEntry) {
        self.lock().pending.insert(entry.tracker_id, entry);
    }

    fn cancel(&self, tracker_id: TrackerId) {
        self.lock().pending.remove(&tracker_id);
    }
}
