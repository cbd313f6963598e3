//! Transition events, listeners and their registrations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::activity::TransitionKind;

use super::{Tracker, TrackerId};

/// An `Active`/`Inactive` edge delivered to listeners.
///
/// Events are created when the state changes, handed to every listener of
/// the matching kind and then discarded.
#[derive(Clone)]
pub struct TransitionEvent {
    event_id: Uuid,
    tracker: Arc<Tracker>,
    kind: TransitionKind,
    at: DateTime<Utc>,
}

impl TransitionEvent {
    pub(crate) fn new(tracker: Arc<Tracker>, kind: TransitionKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tracker,
            kind,
            at: Utc::now(),
        }
    }

    /// Unique id of this event.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// The tracker that produced the event.
    #[must_use]
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Id of the tracker that produced the event.
    #[must_use]
    pub fn tracker_id(&self) -> TrackerId {
        self.tracker.id()
    }

    /// Direction of the transition.
    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        self.kind
    }

    /// Wall-clock time the transition was delivered.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Returns true for an `Idle -> Active` edge.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.kind, TransitionKind::Active)
    }
}

impl fmt::Debug for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionEvent")
            .field("event_id", &self.event_id)
            .field("tracker_id", &self.tracker.id())
            .field("kind", &self.kind)
            .field("at", &self.at)
            .finish()
    }
}

/// Receives transition events.
///
/// Implemented for every `Fn(&TransitionEvent) + Send + Sync`. Listeners run
/// synchronously on the thread that produced the transition and may add or
/// remove listeners, including themselves.
pub trait TransitionListener: Send + Sync {
    /// Invoked once per transition of the kind this listener was added for.
    fn on_transition(&self, event: &TransitionEvent);
}

impl<F> TransitionListener for F
where
    F: Fn(&TransitionEvent) + Send + Sync,
{
    fn on_transition(&self, event: &TransitionEvent) {
        self(event);
    }
}

/// Identifier of one listener registration within a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Entry = (ListenerId, Arc<dyn TransitionListener>);

/// Per-kind listener lists in registration order.
#[derive(Default)]
pub(crate) struct ListenerSet {
    by_kind: [Vec<Entry>; 2],
    next_id: u64,
}

impl ListenerSet {
    /// Adds a listener; the flag is true if it is the first of its kind.
    pub(crate) fn insert(
        &mut self,
        kind: TransitionKind,
        listener: Arc<dyn TransitionListener>,
    ) -> (ListenerId, bool) {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        let list = &mut self.by_kind[kind.index()];
        list.push((id, listener));
        (id, list.len() == 1)
    }

    /// Removes a listener; `Some(true)` if it was the last of its kind.
    pub(crate) fn remove(&mut self, kind: TransitionKind, id: ListenerId) -> Option<bool> {
        let list = &mut self.by_kind[kind.index()];
        let pos = list.iter().position(|(entry_id, _)| *entry_id == id)?;
        list.remove(pos);
        Some(list.is_empty())
    }

    /// Copy of the listeners of `kind`, safe to iterate while the set changes.
    pub(crate) fn snapshot(&self, kind: TransitionKind) -> Vec<Arc<dyn TransitionListener>> {
        self.by_kind[kind.index()]
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn len(&self, kind: TransitionKind) -> usize {
        self.by_kind[kind.index()].len()
    }

    pub(crate) fn clear(&mut self) {
        for list in &mut self.by_kind {
            list.clear();
        }
    }
}

/// Handle returned when a listener is added.
///
/// Removing the handle, explicitly or by dropping it, removes exactly that
/// listener. Use [`forget`](Self::forget) to keep the listener for as long
/// as the tracker lives.
#[must_use = "dropping the registration removes the listener"]
pub struct ListenerRegistration {
    tracker: Weak<Tracker>,
    kind: TransitionKind,
    id: ListenerId,
    removed: AtomicBool,
}

impl ListenerRegistration {
    pub(crate) fn new(tracker: Weak<Tracker>, kind: TransitionKind, id: ListenerId) -> Self {
        Self {
            tracker,
            kind,
            id,
            removed: AtomicBool::new(false),
        }
    }

    /// A registration for a listener that was never added.
    pub(crate) fn inert(kind: TransitionKind) -> Self {
        Self {
            tracker: Weak::new(),
            kind,
            id: ListenerId(0),
            removed: AtomicBool::new(true),
        }
    }

    /// Id of the registered listener.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Kind the listener was registered for.
    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        self.kind
    }

    /// Returns true once the listener has been removed through this handle.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Removes the listener. Idempotent.
    ///
    /// Returns true if this call removed it.
    pub fn remove(&self) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tracker
            .upgrade()
            .is_some_and(|tracker| tracker.remove_listener(self.kind, self.id))
    }

    /// Drops the handle without removing the listener.
    pub fn forget(self) {
        self.removed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("removed", &self.is_removed())
            .finish_non_exhaustive()
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn TransitionListener> {
        Arc::new(|_: &TransitionEvent| {})
    }

    #[test]
    fn listener_set_reports_first_and_last_of_kind() {
        let mut set = ListenerSet::default();
        let (a, first) = set.insert(TransitionKind::Inactive, noop());
        assert!(first);
        let (b, first) = set.insert(TransitionKind::Inactive, noop());
        assert!(!first);
        let (_, first) = set.insert(TransitionKind::Active, noop());
        assert!(first);

        assert_eq!(set.remove(TransitionKind::Inactive, a), Some(false));
        assert_eq!(set.remove(TransitionKind::Inactive, a), None);
        assert_eq!(set.remove(TransitionKind::Inactive, b), Some(true));
        assert_eq!(set.len(TransitionKind::Active), 1);
    }

    #[test]
    fn listener_set_snapshot_is_detached_from_set() {
        let mut set = ListenerSet::default();
        let (a, _) = set.insert(TransitionKind::Active, noop());
        set.insert(TransitionKind::Active, noop());

        let snapshot = set.snapshot(TransitionKind::Active);
        set.remove(TransitionKind::Active, a);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(set.len(TransitionKind::Active), 1);

        set.clear();
        assert_eq!(set.len(TransitionKind::Active), 0);
    }

    #[test]
    fn inert_registration_is_already_removed() {
        let reg = ListenerRegistration::inert(TransitionKind::Active);
        assert!(reg.is_removed());
        assert!(!reg.remove());
    }
}
