//! # idlewatch - user activity and idle detection
//!
//! idlewatch decides whether the user of an interactive session is *active*
//! or *idle* from a stream of raw input signals and a debounce timeout, and
//! delivers the transitions to listeners and, optionally, to a presentation
//! flag.
//!
//! ## Core Concepts
//!
//! - **ActivityMonitor**: sans-IO two-state machine (`Active`/`Idle`) that
//!   owns the debounce timer logic
//! - **Scheduler**: clock plus one pending timer per tracker, backed by a
//!   worker thread or by virtual time
//! - **Tracker**: one monitor bound to a signal source, listeners and an
//!   optional presentation sink
//! - **TrackerRegistry**: at most one tracker per live subject, without
//!   keeping subjects alive
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use idlewatch::{ManualScheduler, ManualSource, TrackerRegistry, TransitionEvent};
//!
//! struct Session;
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let registry = TrackerRegistry::new(scheduler.clone());
//! let session = Arc::new(Session);
//!
//! let tracker = registry.track_with_timeout(&session, ManualSource, 3000)?;
//! let _idle = tracker.add_inactive_listener(|event: &TransitionEvent| {
//!     println!("{} went idle", event.tracker_id());
//! });
//!
//! scheduler.advance(Duration::from_millis(3000));
//! assert!(!tracker.is_active());
//!
//! tracker.signal();
//! assert!(tracker.is_active());
//! # Ok::<(), idlewatch::IdleError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activity;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod tracker;

pub use activity::{
    ActivityMonitor, ActivityState, PresentationFlag, Step, TimerCommand, Transition,
    TransitionKind,
};
pub use config::{TrackerConfig, DEFAULT_STREAM_CAPACITY, DEFAULT_TIMEOUT_MS};
pub use error::{ConfigError, IdleError, IdleResult, StreamError, TrackingError};
pub use registry::{TrackOptions, TrackerRegistry};
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TimerEntry};
pub use signal::{ManualSource, PresentationSink, SignalSink, SignalSource};
pub use tracker::{
    ListenerId, ListenerRegistration, Tracker, TrackerId, TransitionEvent, TransitionListener,
    TransitionStream,
};
