//! The failer — a shared recorder for the outcome of the currently-running
//! node body. `fail`/`skip`/`abort` record here and unwind with a sentinel
//! panic; the node boundary drains the recorded outcome after the body
//! returns. Background threads reach it through [`RecoverHandle`].

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::node::CodeLocation;
use crate::report::{Failure, SpecState};

/// Panic payload used by the skip/fail/abort primitives. The node boundary
/// recognizes it and does not treat the unwind as a real panic.
pub(crate) struct FailurePanic;

#[derive(Debug)]
pub(crate) struct Failer {
    inner: Mutex<FailerState>,
}

#[derive(Debug)]
struct FailerState {
    state: SpecState,
    failure: Failure,
}

impl Failer {
    pub(crate) fn new() -> Self {
        Failer {
            inner: Mutex::new(FailerState {
                state: SpecState::Passed,
                failure: Failure::default(),
            }),
        }
    }

    /// First non-passing outcome wins; later calls within the same node are
    /// ignored so the original failure is what gets reported.
    fn record(&self, state: SpecState, failure: Failure) {
        let mut inner = self.inner.lock().expect("failer mutex poisoned");
        if inner.state == SpecState::Passed {
            inner.state = state;
            inner.failure = failure;
        }
    }

    pub(crate) fn fail(&self, message: impl Into<String>, location: CodeLocation) {
        self.record(
            SpecState::Failed,
            Failure {
                message: message.into(),
                location,
                ..Failure::default()
            },
        );
    }

    pub(crate) fn skip(&self, reason: impl Into<String>, location: CodeLocation) {
        self.record(
            SpecState::Skipped,
            Failure {
                message: reason.into(),
                location,
                ..Failure::default()
            },
        );
    }

    pub(crate) fn abort_suite(&self, message: impl Into<String>, location: CodeLocation) {
        self.record(
            SpecState::Aborted,
            Failure {
                message: message.into(),
                location,
                ..Failure::default()
            },
        );
    }

    pub(crate) fn panicked(&self, location: CodeLocation, forwarded_panic: String) {
        self.record(
            SpecState::Panicked,
            Failure {
                message: "node panicked".to_string(),
                location,
                forwarded_panic: Some(forwarded_panic),
                ..Failure::default()
            },
        );
    }

    /// Returns the recorded outcome and resets for the next node.
    pub(crate) fn drain(&self) -> (SpecState, Failure) {
        let mut inner = self.inner.lock().expect("failer mutex poisoned");
        let state = inner.state;
        let failure = std::mem::take(&mut inner.failure);
        inner.state = SpecState::Passed;
        (state, failure)
    }
}

/// Renders a panic payload the way the suite reports it.
pub(crate) fn panic_payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A cloneable, `Send` handle for routing background-thread panics back to
/// the currently-running node. Obtain one on the spec thread with
/// [`crate::recover_handle`], move it into the thread, and hold its guard for
/// the thread's lifetime.
#[derive(Clone)]
pub struct RecoverHandle {
    pub(crate) failer: Arc<Failer>,
    pub(crate) location: CodeLocation,
}

impl RecoverHandle {
    pub fn guard(&self) -> RecoverGuard {
        RecoverGuard {
            failer: Arc::clone(&self.failer),
            location: self.location.clone(),
        }
    }
}

/// Records a panic into the failer when the holding thread unwinds.
pub struct RecoverGuard {
    failer: Arc<Failer>,
    location: CodeLocation,
}

impl Drop for RecoverGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.failer
                .panicked(self.location.clone(), "panic in background thread".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_resets_to_passed() {
        let failer = Failer::new();
        failer.fail("boom", CodeLocation::default());
        let (state, failure) = failer.drain();
        assert_eq!(state, SpecState::Failed);
        assert_eq!(failure.message, "boom");
        let (state, _) = failer.drain();
        assert_eq!(state, SpecState::Passed);
    }

    #[test]
    fn first_outcome_wins() {
        let failer = Failer::new();
        failer.skip("first", CodeLocation::default());
        failer.fail("second", CodeLocation::default());
        let (state, failure) = failer.drain();
        assert_eq!(state, SpecState::Skipped);
        assert_eq!(failure.message, "first");
    }

    #[test]
    fn recover_guard_records_background_panics() {
        let failer = Arc::new(Failer::new());
        let handle = RecoverHandle {
            failer: Arc::clone(&failer),
            location: CodeLocation::default(),
        };
        let join = std::thread::spawn(move || {
            let _guard = handle.guard();
            panic!("background boom");
        });
        assert!(join.join().is_err());
        let (state, failure) = failer.drain();
        assert_eq!(state, SpecState::Panicked);
        assert!(failure.forwarded_panic.is_some());
    }
}
