//! Activity state machine.
//!
//! `ActivityMonitor` turns raw activity signals and a mutable timeout into a
//! two-state machine. It performs no I/O and owns no timer: every operation
//! returns a [`Step`] telling the caller which transition (if any) happened
//! and what to do with the single pending idle timer.
//!
//! ## State Transitions
//!
//! ```text
//! Active --(no signal for `timeout`)--> Idle
//! Idle   --(any signal)---------------> Active
//! ```
//!
//! The idle timer is debounced: every signal while `Active` re-arms it from
//! scratch. Each arm carries a fresh generation number and a timer callback
//! with a stale generation is ignored, so a cancelled timer can never
//! produce a transition.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Computed activity state of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// The subject produced a signal within the timeout window.
    #[default]
    Active,
    /// No signal arrived for at least the timeout.
    Idle,
}

impl ActivityState {
    /// Returns true for `Active`.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Kind of edge reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// `Idle -> Active`.
    Active,
    /// `Active -> Idle`.
    Inactive,
}

impl TransitionKind {
    /// Both kinds, in a stable order.
    pub const ALL: [Self; 2] = [Self::Active, Self::Inactive];

    /// The state entered by this transition.
    #[must_use]
    pub const fn target(self) -> ActivityState {
        match self {
            Self::Active => ActivityState::Active,
            Self::Inactive => ActivityState::Idle,
        }
    }

    /// The presentation flag that mirrors this transition.
    #[must_use]
    pub const fn flag(self) -> PresentationFlag {
        match self {
            Self::Active => PresentationFlag::UserActive,
            Self::Inactive => PresentationFlag::UserInactive,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Active => 0,
            Self::Inactive => 1,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("user-active"),
            Self::Inactive => f.write_str("user-inactive"),
        }
    }
}

/// Mutually exclusive presentation flags mirrored onto a presentation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationFlag {
    /// Class `useractive`.
    UserActive,
    /// Class `userinactive`.
    UserInactive,
}

impl PresentationFlag {
    /// The class name toggled on the presentation root.
    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::UserActive => "useractive",
            Self::UserInactive => "userinactive",
        }
    }

    /// The flag that mirrors a given state.
    #[must_use]
    pub const fn for_state(state: ActivityState) -> Self {
        match state {
            ActivityState::Active => Self::UserActive,
            ActivityState::Idle => Self::UserInactive,
        }
    }

    /// The other flag of the pair.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::UserActive => Self::UserInactive,
            Self::UserInactive => Self::UserActive,
        }
    }
}

impl fmt::Display for PresentationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// A state change produced by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Direction of the change.
    pub kind: TransitionKind,
    /// Scheduler time at which the state changed.
    pub at: Instant,
}

/// What the caller must do with the pending idle timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Leave the pending timer (if any) untouched.
    Keep,
    /// Replace any pending timer with one firing at `deadline`.
    Arm {
        /// Generation to hand back to `on_timer`.
        generation: u64,
        /// When the timer is due.
        deadline: Instant,
    },
    /// Drop the pending timer.
    Cancel,
}

/// Outcome of one monitor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Transition to deliver, if the state changed.
    pub transition: Option<Transition>,
    /// Timer action to apply.
    pub timer: TimerCommand,
}

impl Step {
    const fn keep() -> Self {
        Self {
            transition: None,
            timer: TimerCommand::Keep,
        }
    }
}

/// Debounced active/idle state machine for a single subject.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    state: ActivityState,
    timeout: Duration,
    last_signal: Instant,
    generation: u64,
    armed: bool,
    transitions: [u64; 2],
}

impl ActivityMonitor {
    /// Creates a monitor in the `Active` state, as if a signal arrived at `now`.
    ///
    /// The first idle timer is armed immediately; see
    /// [`pending_timer`](Self::pending_timer).
    #[must_use]
    pub fn new(timeout: Duration, now: Instant) -> Self {
        let mut monitor = Self {
            state: ActivityState::Active,
            timeout,
            last_signal: now,
            generation: 0,
            armed: false,
            transitions: [0; 2],
        };
        monitor.arm();
        monitor
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ActivityState {
        self.state
    }

    /// Current (clamped) timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time of the last signal, or of construction.
    #[must_use]
    pub const fn last_signal(&self) -> Instant {
        self.last_signal
    }

    /// Generation of the most recently armed (or cancelled) timer.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an idle timer is currently expected to be pending.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Deadline of the pending idle timer.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.armed.then(|| self.idle_deadline())
    }

    /// The command that (re)establishes the currently expected timer.
    #[must_use]
    pub fn pending_timer(&self) -> TimerCommand {
        if self.armed {
            TimerCommand::Arm {
                generation: self.generation,
                deadline: self.idle_deadline(),
            }
        } else {
            TimerCommand::Keep
        }
    }

    /// Number of transitions of the given kind produced so far.
    #[must_use]
    pub const fn transitions(&self, kind: TransitionKind) -> u64 {
        self.transitions[kind.index()]
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Records a raw activity signal.
    ///
    /// While idle this reports `Idle -> Active` immediately. In both states
    /// the idle timer is re-armed from `now`.
    pub fn on_signal(&mut self, now: Instant) -> Step {
        self.last_signal = now;
        let transition = match self.state {
            ActivityState::Idle => Some(self.enter(TransitionKind::Active, now)),
            ActivityState::Active => None,
        };
        Step {
            transition,
            timer: self.arm(),
        }
    }

    /// Sets the idle timeout in milliseconds, clamping negative values to zero.
    pub fn set_timeout_ms(&mut self, timeout_ms: i64) -> Step {
        let clamped = u64::try_from(timeout_ms).unwrap_or(0);
        self.set_timeout(Duration::from_millis(clamped))
    }

    /// Sets the idle timeout.
    ///
    /// While active the pending timer is re-armed against the last signal,
    /// not against `now`, so a timeout shorter than the quiet time already
    /// elapsed expires on the next scheduling tick. While idle the new value
    /// only applies once a signal reactivates the subject.
    pub fn set_timeout(&mut self, timeout: Duration) -> Step {
        self.timeout = timeout;
        match self.state {
            ActivityState::Active => Step {
                transition: None,
                timer: self.arm(),
            },
            ActivityState::Idle => Step::keep(),
        }
    }

    /// Handles expiry of the timer armed with `generation`.
    ///
    /// Stale generations, expiries while idle and early expiries are ignored.
    pub fn on_timer(&mut self, generation: u64, now: Instant) -> Step {
        if !self.armed || generation != self.generation || self.state != ActivityState::Active {
            return Step::keep();
        }
        if now < self.idle_deadline() {
            // Woken early; wait for the real deadline.
            return Step {
                transition: None,
                timer: self.arm(),
            };
        }
        self.armed = false;
        Step {
            transition: Some(self.enter(TransitionKind::Inactive, now)),
            timer: TimerCommand::Keep,
        }
    }

    /// Invalidates any pending timer. The state is left untouched.
    pub fn cancel(&mut self) -> Step {
        self.generation = self.generation.wrapping_add(1);
        let was_armed = std::mem::replace(&mut self.armed, false);
        Step {
            transition: None,
            timer: if was_armed {
                TimerCommand::Cancel
            } else {
                TimerCommand::Keep
            },
        }
    }

    fn idle_deadline(&self) -> Instant {
        self.last_signal
            .checked_add(self.timeout)
            .unwrap_or(self.last_signal)
    }

    fn arm(&mut self) -> TimerCommand {
        self.generation = self.generation.wrapping_add(1);
        self.armed = true;
        TimerCommand::Arm {
            generation: self.generation,
            deadline: self.idle_deadline(),
        }
    }

    fn enter(&mut self, kind: TransitionKind, at: Instant) -> Transition {
        self.state = kind.target();
        self.transitions[kind.index()] += 1;
        Transition { kind, at }
    }
}
