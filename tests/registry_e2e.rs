use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use idlewatch::{
    ActivityState, ListenerRegistration, ManualScheduler, ManualSource, PresentationFlag,
    PresentationSink, SignalSink, SignalSource, TrackOptions, TrackerConfig, TrackerRegistry,
    TransitionEvent, TransitionKind,
};

struct Session;

fn setup() -> (Arc<ManualScheduler>, TrackerRegistry<Session>) {
    let scheduler = Arc::new(ManualScheduler::new());
    let registry = TrackerRegistry::new(scheduler.clone());
    (scheduler, registry)
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Signal source that records every hook call and keeps the sink around so
/// tests can push raw activity through it.
#[derive(Default)]
struct Probe {
    sink: Mutex<Option<SignalSink>>,
    calls: Mutex<Vec<String>>,
}

impl Probe {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn signal(&self) -> bool {
        let sink = self.sink.lock().unwrap().clone();
        sink.is_some_and(|sink| sink.signal())
    }
}

struct ProbeSource(Arc<Probe>);

impl SignalSource for ProbeSource {
    fn attach(&self, sink: SignalSink) {
        *self.0.sink.lock().unwrap() = Some(sink);
        self.0.calls.lock().unwrap().push("attach".to_string());
    }

    fn detach(&self) {
        self.0.calls.lock().unwrap().push("detach".to_string());
    }

    fn observe(&self, kind: TransitionKind) {
        self.0.calls.lock().unwrap().push(format!("observe:{kind}"));
    }

    fn unobserve(&self, kind: TransitionKind) {
        self.0.calls.lock().unwrap().push(format!("unobserve:{kind}"));
    }
}

#[derive(Default)]
struct RecordingRoot {
    current: Mutex<Option<PresentationFlag>>,
    clears: AtomicUsize,
}

impl RecordingRoot {
    fn current(&self) -> Option<PresentationFlag> {
        *self.current.lock().unwrap()
    }
}

impl PresentationSink for RecordingRoot {
    fn set_flag(&self, flag: PresentationFlag) {
        *self.current.lock().unwrap() = Some(flag);
    }

    fn clear(&self) {
        *self.current.lock().unwrap() = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&TransitionEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &TransitionEvent| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn quiet_period_reports_inactive_exactly_once() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 3000).unwrap();
    let (inactive, listener) = counter();
    let _reg = tracker.add_inactive_listener(listener);

    scheduler.advance(ms(2999));
    assert_eq!(inactive.load(Ordering::SeqCst), 0);
    assert!(tracker.is_active());

    scheduler.advance(ms(1));
    assert_eq!(inactive.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.state(), ActivityState::Idle);

    scheduler.advance(ms(10_000));
    assert_eq!(inactive.load(Ordering::SeqCst), 1);
}

#[test]
fn signals_inside_the_window_keep_the_subject_active() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 3000).unwrap();
    let (inactive, listener) = counter();
    let _reg = tracker.add_inactive_listener(listener);

    for _ in 0..10 {
        scheduler.advance(ms(2000));
        assert!(tracker.signal());
    }
    assert_eq!(inactive.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.pending(), 1);

    scheduler.advance(ms(3000));
    assert_eq!(inactive.load(Ordering::SeqCst), 1);
}

#[test]
fn signal_while_idle_reports_active_immediately() {
    let (scheduler, registry) = setup();
    let probe = Arc::new(Probe::default());
    let session = Arc::new(Session);
    let tracker = registry
        .track_with_timeout(&session, ProbeSource(Arc::clone(&probe)), 3000)
        .unwrap();
    let (active, listener) = counter();
    let _reg = tracker.add_active_listener(listener);

    scheduler.advance(ms(3000));
    assert!(!tracker.is_active());

    assert!(probe.signal());
    assert_eq!(active.load(Ordering::SeqCst), 1);
    assert!(tracker.is_active());

    assert!(probe.signal());
    assert_eq!(active.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.transitions(TransitionKind::Active), 1);
}

#[test]
fn raising_the_timeout_while_idle_waits_for_the_next_signal() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 3000).unwrap();
    let (active, on_active) = counter();
    let (inactive, on_inactive) = counter();
    let _a = tracker.add_active_listener(on_active);
    let _i = tracker.add_inactive_listener(on_inactive);

    scheduler.advance(ms(3000));
    assert_eq!(inactive.load(Ordering::SeqCst), 1);

    tracker.set_timeout_ms(60_000);
    assert_eq!(tracker.timeout_ms(), 60_000);
    assert_eq!(scheduler.pending(), 0);
    scheduler.advance(ms(120_000));
    assert_eq!(tracker.state(), ActivityState::Idle);
    assert_eq!(active.load(Ordering::SeqCst), 0);

    tracker.signal();
    assert_eq!(active.load(Ordering::SeqCst), 1);
    scheduler.advance(ms(59_999));
    assert!(tracker.is_active());
    scheduler.advance(ms(1));
    assert_eq!(inactive.load(Ordering::SeqCst), 2);
}

#[test]
fn shortening_the_timeout_expires_against_the_last_signal() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 10_000).unwrap();
    let (inactive, listener) = counter();
    let _reg = tracker.add_inactive_listener(listener);

    scheduler.advance(ms(4000));
    tracker.set_timeout_ms(3000);
    scheduler.run_due();

    assert_eq!(inactive.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.state(), ActivityState::Idle);
}

#[test]
fn negative_timeout_is_clamped_and_idles_on_next_tick() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, -250).unwrap();
    assert_eq!(tracker.timeout_ms(), 0);
    assert!(tracker.is_active());

    assert_eq!(scheduler.run_due(), 1);
    assert_eq!(tracker.state(), ActivityState::Idle);
}

#[test]
fn tracking_twice_is_rejected_until_untracked() {
    let (_scheduler, registry) = setup();
    let session = Arc::new(Session);
    let first = registry.track(&session, ManualSource).unwrap();

    let err = registry.track(&session, ManualSource).unwrap_err();
    assert!(err.is_already_tracked());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains(&first.id().to_string()));
    assert_eq!(registry.get(&session).unwrap().id(), first.id());

    assert!(registry.untrack(&session));
    assert!(!first.is_tracking());
    let second = registry.track(&session, ManualSource).unwrap();
    assert_ne!(first.id(), second.id());
}

#[test]
fn untrack_is_idempotent_and_tolerates_unknown_subjects() {
    let (_scheduler, registry) = setup();
    let tracked = Arc::new(Session);
    let stranger = Arc::new(Session);
    registry.track(&tracked, ManualSource).unwrap();

    assert!(!registry.untrack(&stranger));
    assert!(registry.get(&stranger).is_none());
    assert!(registry.untrack(&tracked));
    assert!(!registry.untrack(&tracked));
    assert!(registry.is_empty());
}

#[test]
fn observers_follow_first_and_last_listener_of_each_kind() {
    let (_scheduler, registry) = setup();
    let probe = Arc::new(Probe::default());
    let session = Arc::new(Session);
    let tracker = registry.track(&session, ProbeSource(Arc::clone(&probe))).unwrap();
    assert_eq!(probe.calls(), vec!["attach"]);

    let a = tracker.add_inactive_listener(|_: &TransitionEvent| {});
    let b = tracker.add_inactive_listener(|_: &TransitionEvent| {});
    assert!(tracker.is_observing(TransitionKind::Inactive));
    assert!(!tracker.is_observing(TransitionKind::Active));

    assert!(a.remove());
    assert!(!a.remove());
    assert!(tracker.is_observing(TransitionKind::Inactive));
    drop(b);
    assert!(!tracker.is_observing(TransitionKind::Inactive));

    let c = tracker.add_active_listener(|_: &TransitionEvent| {});
    registry.untrack(&session);
    assert!(!c.remove());

    assert_eq!(
        probe.calls(),
        vec![
            "attach",
            "observe:user-inactive",
            "unobserve:user-inactive",
            "observe:user-active",
            "unobserve:user-active",
            "detach",
        ]
    );
}

#[test]
fn untrack_cancels_timer_and_drops_listeners() {
    let (scheduler, registry) = setup();
    let probe = Arc::new(Probe::default());
    let session = Arc::new(Session);
    let tracker = registry
        .track_with_timeout(&session, ProbeSource(Arc::clone(&probe)), 1000)
        .unwrap();
    let (inactive, listener) = counter();
    let reg = tracker.add_inactive_listener(listener);
    assert_eq!(scheduler.pending(), 1);

    assert!(registry.untrack(&session));
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(tracker.listener_count(TransitionKind::Inactive), 0);

    scheduler.advance(ms(5000));
    assert_eq!(inactive.load(Ordering::SeqCst), 0);
    assert!(!probe.signal());
    assert!(!reg.remove());
}

#[test]
fn presentation_flag_mirrors_transitions_when_synced() {
    let (scheduler, registry) = setup();
    let root = Arc::new(RecordingRoot::default());
    let session = Arc::new(Session);
    let tracker = registry
        .track_with(
            &session,
            ManualSource,
            TrackOptions::new()
                .timeout_ms(500)
                .sync_presentation(true)
                .presentation(root.clone()),
        )
        .unwrap();
    assert!(tracker.is_update_sync());
    assert_eq!(root.current(), Some(PresentationFlag::UserActive));

    scheduler.advance(ms(500));
    assert_eq!(root.current(), Some(PresentationFlag::UserInactive));
    tracker.signal();
    assert_eq!(root.current(), Some(PresentationFlag::UserActive));

    tracker.set_update_sync(false);
    assert_eq!(root.current(), None);
    assert_eq!(root.clears.load(Ordering::SeqCst), 1);
    scheduler.advance(ms(500));
    assert_eq!(root.current(), None);

    tracker.set_update_sync(true);
    assert_eq!(root.current(), Some(PresentationFlag::UserInactive));
}

#[test]
fn presentation_is_untouched_by_default() {
    let (scheduler, registry) = setup();
    let root = Arc::new(RecordingRoot::default());
    let session = Arc::new(Session);
    let tracker = registry
        .track_with(&session, ManualSource, TrackOptions::new().presentation(root.clone()))
        .unwrap();
    assert!(!tracker.is_update_sync());
    assert!(tracker.has_presentation());

    scheduler.advance(ms(idlewatch::DEFAULT_TIMEOUT_MS));
    assert_eq!(tracker.state(), ActivityState::Idle);
    assert_eq!(root.current(), None);
}

#[test]
fn registry_config_supplies_defaults() {
    let scheduler = Arc::new(ManualScheduler::new());
    let json = r#"{ "timeout_ms": 750, "sync_presentation": true }"#;
    let config = TrackerConfig::from_json(json).unwrap();
    let registry: TrackerRegistry<Session> = TrackerRegistry::with_config(scheduler, config);
    let session = Arc::new(Session);

    let tracker = registry.track(&session, ManualSource).unwrap();
    assert_eq!(tracker.timeout_ms(), 750);
    assert!(tracker.is_update_sync());
}

#[test]
fn dropped_subject_is_reaped_and_released() {
    let (scheduler, registry) = setup();
    let probe = Arc::new(Probe::default());
    let session = Arc::new(Session);
    let tracker = registry.track(&session, ProbeSource(Arc::clone(&probe))).unwrap();

    drop(session);
    assert_eq!(registry.reap(), 1);
    assert_eq!(registry.reap(), 0);
    assert!(!tracker.is_tracking());
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(probe.calls().last().map(String::as_str), Some("detach"));
}

#[test]
fn any_registry_query_releases_trackers_of_dropped_subjects() {
    let (scheduler, registry) = setup();
    let probes: Vec<Arc<Probe>> = (0..3).map(|_| Arc::new(Probe::default())).collect();
    let sessions: Vec<Arc<Session>> = (0..3).map(|_| Arc::new(Session)).collect();
    let trackers: Vec<_> = sessions
        .iter()
        .zip(&probes)
        .map(|(session, probe)| registry.track(session, ProbeSource(Arc::clone(probe))).unwrap())
        .collect();
    let stranger = Arc::new(Session);
    let mut sessions = sessions.into_iter();

    drop(sessions.next());
    assert_eq!(registry.len(), 2);
    assert!(!trackers[0].is_tracking());
    assert_eq!(probes[0].calls().last().map(String::as_str), Some("detach"));

    drop(sessions.next());
    assert_eq!(registry.trackers().len(), 1);
    assert!(!trackers[1].is_tracking());

    drop(sessions.next());
    assert!(!registry.untrack(&stranger));
    assert!(!trackers[2].is_tracking());
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(registry.reap(), 0);
}

/// Presentation root that untracks its own subject the first time a flag is
/// set, which happens while `track_with` is still starting the tracker.
struct UntrackOnFirstFlag {
    registry: Mutex<Option<Arc<TrackerRegistry<Session>>>>,
    subject: Arc<Session>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl PresentationSink for UntrackOnFirstFlag {
    fn set_flag(&self, flag: PresentationFlag) {
        self.calls.lock().unwrap().push(format!("set:{flag}"));
        let registry = self.registry.lock().unwrap().take();
        if let Some(registry) = registry {
            let removed = registry.untrack(&self.subject);
            self.calls.lock().unwrap().push(format!("untrack={removed}"));
        }
    }

    fn clear(&self) {
        self.calls.lock().unwrap().push("clear".to_string());
    }
}

struct RecordingSource(Arc<Mutex<Vec<String>>>);

impl SignalSource for RecordingSource {
    fn attach(&self, _sink: SignalSink) {
        self.0.lock().unwrap().push("attach".to_string());
    }

    fn detach(&self) {
        self.0.lock().unwrap().push("detach".to_string());
    }
}

#[test]
fn untrack_during_start_leaves_nothing_attached() {
    let scheduler = Arc::new(ManualScheduler::new());
    let registry: Arc<TrackerRegistry<Session>> = Arc::new(TrackerRegistry::new(scheduler.clone()));
    let session = Arc::new(Session);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let root = Arc::new(UntrackOnFirstFlag {
        registry: Mutex::new(Some(Arc::clone(&registry))),
        subject: Arc::clone(&session),
        calls: Arc::clone(&calls),
    });

    let tracker = registry
        .track_with(
            &session,
            RecordingSource(Arc::clone(&calls)),
            TrackOptions::new().sync_presentation(true).presentation(root),
        )
        .unwrap();

    assert!(!tracker.is_tracking());
    assert!(registry.get(&session).is_none());
    assert_eq!(scheduler.pending(), 0);
    assert!(!tracker.signal());

    let calls = calls.lock().unwrap().clone();
    let attach = calls.iter().position(|c| c == "attach").unwrap();
    let detach = calls.iter().position(|c| c == "detach").unwrap();
    assert_eq!(calls.iter().filter(|c| *c == "attach").count(), 1);
    assert!(attach < detach);
    assert!(calls.contains(&"untrack=true".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("clear"));
}

#[test]
fn listener_removing_itself_does_not_disturb_the_pass() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 100).unwrap();

    let slot: Arc<Mutex<Option<ListenerRegistration>>> = Arc::new(Mutex::new(None));
    let once = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&slot);
    let calls = Arc::clone(&once);
    let reg = tracker.add_inactive_listener(move |_: &TransitionEvent| {
        calls.fetch_add(1, Ordering::SeqCst);
        let reg = handle.lock().unwrap().take();
        drop(reg);
    });
    *slot.lock().unwrap() = Some(reg);
    let (always, listener) = counter();
    let _after = tracker.add_inactive_listener(listener);

    scheduler.advance(ms(100));
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert_eq!(always.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.listener_count(TransitionKind::Inactive), 1);

    tracker.signal();
    scheduler.advance(ms(100));
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert_eq!(always.load(Ordering::SeqCst), 2);
}

#[test]
fn listener_added_during_fanout_joins_the_next_pass() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 100).unwrap();
    let (late, late_listener) = counter();
    let late_listener = Arc::new(late_listener);
    let added = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&added);
    let _reg = tracker.add_inactive_listener(move |event: &TransitionEvent| {
        if flag.fetch_add(1, Ordering::SeqCst) == 0 {
            let listener = Arc::clone(&late_listener);
            event
                .tracker()
                .add_inactive_listener(move |e: &TransitionEvent| (*listener)(e))
                .forget();
        }
    });

    scheduler.advance(ms(100));
    assert_eq!(late.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.listener_count(TransitionKind::Inactive), 2);

    tracker.signal();
    scheduler.advance(ms(100));
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn listeners_run_in_registration_order() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 10).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let regs: Vec<ListenerRegistration> = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            tracker.add_inactive_listener(move |_: &TransitionEvent| order.lock().unwrap().push(i))
        })
        .collect();

    scheduler.advance(ms(10));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    drop(regs);
}

#[test]
fn stream_sees_both_kinds_in_order() {
    let (scheduler, registry) = setup();
    let session = Arc::new(Session);
    let tracker = registry.track_with_timeout(&session, ManualSource, 200).unwrap();
    let stream = tracker.subscribe();

    scheduler.advance(ms(200));
    tracker.signal();

    let events = stream.drain();
    let kinds: Vec<TransitionKind> = events.iter().map(TransitionEvent::kind).collect();
    assert_eq!(kinds, vec![TransitionKind::Inactive, TransitionKind::Active]);
    assert!(events.iter().all(|e| e.tracker_id() == tracker.id()));

    stream.unsubscribe();
    assert_eq!(tracker.listener_count(TransitionKind::Active), 0);
    assert!(stream.try_recv().unwrap_err().is_stream());
}

#[test]
fn trackers_are_independent() {
    let (scheduler, registry) = setup();
    let a = Arc::new(Session);
    let b = Arc::new(Session);
    let fast = registry.track_with_timeout(&a, ManualSource, 100).unwrap();
    let slow = registry.track_with_timeout(&b, ManualSource, 1000).unwrap();
    assert_eq!(registry.len(), 2);

    scheduler.advance(ms(100));
    assert!(!fast.is_active());
    assert!(slow.is_active());

    assert_eq!(registry.untrack_all(), 2);
    assert!(registry.is_empty());
    assert_eq!(scheduler.pending(), 0);
}
