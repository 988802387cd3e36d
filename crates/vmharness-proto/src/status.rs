//! Status events and the observer bus.
//!
//! The orchestration pipeline runs on a worker task; the presentation layer
//! must never block on it. Progress flows one way through `StatusBus`: the
//! worker publishes, registered observers (GUI, log sinks, tests) receive
//! each event synchronously on the publishing thread and are expected to
//! hand it off cheaply.

use crate::run::{RunId, RunPhase};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Type alias for the observer callback function.
type Observer = Box<dyn Fn(&StatusEvent) + Send + 'static>;

/// One progress notification from an in-flight run.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// The run this event belongs to.
    pub run: RunId,
    /// What happened.
    pub detail: StatusDetail,
}

/// The payload of a status event.
#[derive(Debug, Clone)]
pub enum StatusDetail {
    /// The run moved to a new phase.
    Phase(RunPhase),
    /// Free-form progress line.
    Message(String),
    /// An action is about to execute.
    ActionStarted {
        index: usize,
        total: usize,
        kind: String,
    },
    /// An action finished successfully.
    ActionCompleted { index: usize, kind: String },
    /// An action failed after its retry budget.
    ActionFailed {
        index: usize,
        kind: String,
        error: String,
    },
    /// An unrecognized action kind was routed to the generic fallback.
    FallbackUsed { index: usize, kind: String },
    /// A transient failure is being retried.
    Retry {
        operation: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Evaluation finished with a verdict.
    Verdict { passed: bool },
}

impl fmt::Display for StatusDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase(phase) => write!(f, "phase: {phase}"),
            Self::Message(msg) => f.write_str(msg),
            Self::ActionStarted { index, total, kind } => {
                write!(f, "action {}/{total} ({kind}) started", index + 1)
            }
            Self::ActionCompleted { index, kind } => {
                write!(f, "action {} ({kind}) completed", index + 1)
            }
            Self::ActionFailed { index, kind, error } => {
                write!(f, "action {} ({kind}) failed: {error}", index + 1)
            }
            Self::FallbackUsed { index, kind } => {
                write!(f, "action {} ({kind}) ran via generic fallback", index + 1)
            }
            Self::Retry {
                operation,
                attempt,
                delay_ms,
            } => write!(f, "{operation}: retry attempt {attempt} in {delay_ms}ms"),
            Self::Verdict { passed } => {
                write!(f, "verdict: {}", if *passed { "PASSED" } else { "FAILED" })
            }
        }
    }
}

/// Fan-out hub for run status events.
///
/// Observers are invoked in registration order on the publisher's thread.
/// Publishing takes `&self` so the bus can be shared between the worker and
/// the presentation layer behind an `Arc`.
#[derive(Default)]
pub struct StatusBus {
    observers: Mutex<Vec<Observer>>,
}

impl StatusBus {
    /// Creates a bus with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer that receives every published event.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + 'static,
    {
        self.observers
            .lock()
            .expect("status observer list poisoned")
            .push(Box::new(observer));
    }

    /// Publishes an event to all observers.
    pub fn publish(&self, event: &StatusEvent) {
        let observers = self.observers.lock().expect("status observer list poisoned");
        for observer in observers.iter() {
            observer(event);
        }
    }
}

/// A bus handle bound to one run.
///
/// Pipeline components publish through this instead of carrying the bus and
/// run id separately. `detached()` gives components constructed outside a run
/// (unit tests, ad-hoc tooling) somewhere to publish into.
#[derive(Clone)]
pub struct StatusPublisher {
    bus: Arc<StatusBus>,
    run: RunId,
}

impl StatusPublisher {
    /// Binds a bus to a run.
    pub fn new(bus: Arc<StatusBus>, run: RunId) -> Self {
        Self { bus, run }
    }

    /// A publisher wired to a private bus with no observers.
    pub fn detached() -> Self {
        Self::new(Arc::new(StatusBus::new()), RunId::from_raw("detached"))
    }

    /// The run this publisher reports for.
    pub fn run(&self) -> &RunId {
        &self.run
    }

    /// Publishes a structured event.
    pub fn publish(&self, detail: StatusDetail) {
        self.bus.publish(&StatusEvent {
            run: self.run.clone(),
            detail,
        });
    }

    /// Publishes a free-form progress line.
    pub fn message(&self, text: impl Into<String>) {
        self.publish(StatusDetail::Message(text.into()));
    }
}

impl fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_observers_receive_all_events() {
        let bus = StatusBus::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        bus.add_observer(move |event| {
            seen_clone.lock().unwrap().push(event.detail.to_string());
        });

        let run = RunId::from_raw("20260101_120000_t1");
        bus.publish(&StatusEvent {
            run: run.clone(),
            detail: StatusDetail::Phase(RunPhase::Preparing),
        });
        bus.publish(&StatusEvent {
            run,
            detail: StatusDetail::Message("reverting".to_string()),
        });

        let captured = seen.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0], "phase: preparing");
        assert_eq!(captured[1], "reverting");
    }

    #[test]
    fn test_multiple_observers() {
        let bus = StatusBus::new();
        let count = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.add_observer(move |_| *count.lock().unwrap() += 1);
        }

        bus.publish(&StatusEvent {
            run: RunId::from_raw("r"),
            detail: StatusDetail::Verdict { passed: true },
        });
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn test_publisher_stamps_run_id() {
        let bus = Arc::new(StatusBus::new());
        let seen: Arc<Mutex<Vec<RunId>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        bus.add_observer(move |event| {
            seen_clone.lock().unwrap().push(event.run.clone());
        });

        let publisher = StatusPublisher::new(bus, RunId::from_raw("20260101_120000_t1"));
        publisher.message("reverting");
        publisher.publish(StatusDetail::Verdict { passed: false });

        let captured = seen.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert!(captured.iter().all(|r| r.as_str() == "20260101_120000_t1"));
    }

    #[test]
    fn test_detail_formatting() {
        let detail = StatusDetail::ActionStarted {
            index: 0,
            total: 3,
            kind: "launch".to_string(),
        };
        assert_eq!(detail.to_string(), "action 1/3 (launch) started");

        let detail = StatusDetail::Retry {
            operation: "revertSnapshot".to_string(),
            attempt: 2,
            delay_ms: 750,
        };
        assert_eq!(detail.to_string(), "revertSnapshot: retry attempt 2 in 750ms");
    }
}
