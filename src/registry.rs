//! Subject to tracker registry.
//!
//! The registry enforces at most one tracker per live subject. Subjects are
//! identified by reference: the key is the address of the subject's `Arc`
//! allocation, and the entry only holds a `Weak` to it, so tracking never
//! keeps a subject alive. An entry whose subject has been dropped is treated
//! as absent and released the next time the registry looks at it (or on an
//! explicit [`TrackerRegistry::reap`]).
//!
//! A registry instance is the tracking scope. Hosts that want a process-wide
//! scope keep one registry in a static.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::config::TrackerConfig;
use crate::error::{IdleResult, TrackingError};
use crate::scheduler::Scheduler;
use crate::signal::{PresentationSink, SignalSource};
use crate::tracker::{Tracker, TrackerSettings};

/// Per-call overrides for [`TrackerRegistry::track_with`].
///
/// Unset fields fall back to the registry's [`TrackerConfig`].
#[derive(Clone, Default)]
pub struct TrackOptions {
    /// Inactivity timeout in milliseconds; negative values become zero.
    pub timeout_ms: Option<i64>,
    /// Whether to mirror transitions to the presentation sink.
    pub sync_presentation: Option<bool>,
    /// Presentation root for this subject.
    pub presentation: Option<Arc<dyn PresentationSink>>,
}

impl TrackOptions {
    /// Options that defer everything to the registry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the timeout.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Overrides presentation mirroring.
    #[must_use]
    pub fn sync_presentation(mut self, sync: bool) -> Self {
        self.sync_presentation = Some(sync);
        self
    }

    /// Sets the presentation root.
    #[must_use]
    pub fn presentation(mut self, sink: Arc<dyn PresentationSink>) -> Self {
        self.presentation = Some(sink);
        self
    }
}

impl fmt::Debug for TrackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("sync_presentation", &self.sync_presentation)
            .field("presentation", &self.presentation.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubjectKey(usize);

impl SubjectKey {
    fn of<S>(subject: &Arc<S>) -> Self {
        Self(Arc::as_ptr(subject).cast::<()>() as usize)
    }
}

struct Entry<S> {
    subject: Weak<S>,
    tracker: Arc<Tracker>,
}

impl<S> Entry<S> {
    fn is_alive(&self) -> bool {
        self.subject.strong_count() > 0
    }
}

/// Registry of trackers keyed by subject identity.
pub struct TrackerRegistry<S> {
    scheduler: Arc<dyn Scheduler>,
    config: TrackerConfig,
    entries: Mutex<HashMap<SubjectKey, Entry<S>>>,
}

impl<S: Send + Sync + 'static> TrackerRegistry<S> {
    /// Creates a registry with the default configuration.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_config(scheduler, TrackerConfig::default())
    }

    /// Creates a registry whose trackers start from `config`.
    #[must_use]
    pub fn with_config(scheduler: Arc<dyn Scheduler>, config: TrackerConfig) -> Self {
        Self {
            scheduler,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Defaults applied to new trackers.
    #[must_use]
    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Scheduler shared by every tracker of this registry.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Starts tracking `subject` with the registry defaults.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::AlreadyTracked` if the subject already has a
    /// tracker. Untrack it first, or check [`get`](Self::get).
    pub fn track(
        &self,
        subject: &Arc<S>,
        source: impl SignalSource + 'static,
    ) -> IdleResult<Arc<Tracker>> {
        self.track_with(subject, source, TrackOptions::default())
    }

    /// Starts tracking `subject` with a specific timeout in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::AlreadyTracked` if the subject already has a
    /// tracker.
    pub fn track_with_timeout(
        &self,
        subject: &Arc<S>,
        source: impl SignalSource + 'static,
        timeout_ms: i64,
    ) -> IdleResult<Arc<Tracker>> {
        self.track_with(subject, source, TrackOptions::new().timeout_ms(timeout_ms))
    }

    /// Starts tracking `subject` with explicit options.
    ///
    /// # Errors
    ///
    /// Returns `TrackingError::AlreadyTracked` if the subject already has a
    /// tracker.
    pub fn track_with(
        &self,
        subject: &Arc<S>,
        source: impl SignalSource + 'static,
        options: TrackOptions,
    ) -> IdleResult<Arc<Tracker>> {
        let key = SubjectKey::of(subject);
        let timeout_ms = options
            .timeout_ms
            .map_or(self.config.timeout_ms, |ms| u64::try_from(ms).unwrap_or(0));
        let settings = TrackerSettings {
            timeout: Duration::from_millis(timeout_ms),
            sync_presentation: options.sync_presentation.unwrap_or(self.config.sync_presentation),
            stream_capacity: self.config.stream_capacity,
        };

        let (result, dead) = {
            let mut entries = self.lock();
            let dead = take_dead(&mut entries);
            let result = match entries.get(&key) {
                Some(entry) => Err(TrackingError::AlreadyTracked {
                    tracker: entry.tracker.id(),
                }),
                None => {
                    let tracker = Tracker::new(
                        settings,
                        Arc::clone(&self.scheduler),
                        Box::new(source),
                        options.presentation,
                    );
                    entries.insert(
                        key,
                        Entry {
                            subject: Arc::downgrade(subject),
                            tracker: Arc::clone(&tracker),
                        },
                    );
                    Ok(tracker)
                }
            };
            (result, dead)
        };
        release_all(dead);

        let tracker = result?;
        tracker.start();
        tracing::debug!(tracker = %tracker.id(), timeout_ms, "subject tracked");
        Ok(tracker)
    }

    /// The tracker of `subject`, if it is tracked.
    #[must_use]
    pub fn get(&self, subject: &Arc<S>) -> Option<Arc<Tracker>> {
        let key = SubjectKey::of(subject);
        self.with_live_entries(|entries| entries.get(&key).map(|entry| Arc::clone(&entry.tracker)))
    }

    /// Whether `subject` currently has a tracker.
    #[must_use]
    pub fn contains(&self, subject: &Arc<S>) -> bool {
        self.get(subject).is_some()
    }

    /// Stops tracking `subject`.
    ///
    /// Cancels its idle timer, drops its listeners and detaches its signal
    /// source. Returns false (and does nothing) if the subject was not
    /// tracked.
    pub fn untrack(&self, subject: &Arc<S>) -> bool {
        let key = SubjectKey::of(subject);
        let Some(entry) = self.with_live_entries(|entries| entries.remove(&key)) else {
            return false;
        };
        entry.tracker.release();
        tracing::debug!(tracker = %entry.tracker.id(), "subject untracked");
        true
    }

    /// Stops tracking every subject. Returns the number of trackers released.
    pub fn untrack_all(&self) -> usize {
        let drained: Vec<Entry<S>> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        release_all(drained);
        count
    }

    /// Releases trackers whose subject has been dropped.
    ///
    /// Returns the number of entries removed.
    pub fn reap(&self) -> usize {
        let dead = take_dead(&mut self.lock());
        let count = dead.len();
        release_all(dead);
        count
    }

    /// Trackers of all live subjects.
    #[must_use]
    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        self.with_live_entries(|entries| {
            entries
                .values()
                .map(|entry| Arc::clone(&entry.tracker))
                .collect()
        })
    }

    /// Number of live tracked subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_live_entries(|entries| entries.len())
    }

    /// True when no live subject is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `op` on the map after removing dead entries, then releases
    /// those entries with the lock dropped.
    fn with_live_entries<R>(&self, op: impl FnOnce(&mut HashMap<SubjectKey, Entry<S>>) -> R) -> R {
        let (result, dead) = {
            let mut entries = self.lock();
            let dead = take_dead(&mut entries);
            (op(&mut entries), dead)
        };
        release_all(dead);
        result
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubjectKey, Entry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> fmt::Debug for TrackerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("TrackerRegistry")
            .field("config", &self.config)
            .field("entries", &entries)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for TrackerRegistry<S> {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        release_all(entries.drain().map(|(_, entry)| entry).collect());
    }
}

fn take_dead<S>(entries: &mut HashMap<SubjectKey, Entry<S>>) -> Vec<Entry<S>> {
    let keys: Vec<SubjectKey> = entries
        .iter()
        .filter(|(_, entry)| !entry.is_alive())
        .map(|(key, _)| *key)
        .collect();
    let dead: Vec<Entry<S>> = keys.iter().filter_map(|key| entries.remove(key)).collect();
    if !dead.is_empty() {
        tracing::debug!(count = dead.len(), "reaped trackers of dropped subjects");
    }
    dead
}

fn release_all<S>(entries: Vec<Entry<S>>) {
    for entry in entries {
        entry.tracker.release();
    }
}
