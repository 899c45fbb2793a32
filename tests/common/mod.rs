//! Shared helpers for integration tests: signal capture and polling.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use keycard_host::{SessionManager, SessionState, SignalBus};

/// Captures every signal emitted on a bus as parsed JSON envelopes.
#[derive(Clone)]
pub struct SignalCapture {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl SignalCapture {
    pub fn install(bus: &SignalBus) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.set_handler(Box::new(move |raw| {
            let value: Value = serde_json::from_str(raw).expect("signals are valid JSON");
            sink.lock().unwrap().push(value);
        }));
        Self { seen }
    }

    pub fn all(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn of_type(&self, type_tag: &str) -> Vec<Value> {
        self.all()
            .into_iter()
            .filter(|signal| signal["type"] == type_tag)
            .collect()
    }

    /// Block until a signal of the given type shows up, returning its
    /// event payload.
    pub fn wait_for(&self, type_tag: &str, timeout: Duration) -> Value {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(signal) = self.of_type(type_tag).into_iter().next() {
                return signal["event"].clone();
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for signal {type_tag:?}; saw {:?}",
                self.all()
                    .iter()
                    .map(|s| s["type"].clone())
                    .collect::<Vec<_>>()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Like `wait_for`, but skips the first `skip` matches of the type.
    pub fn wait_for_nth(&self, type_tag: &str, skip: usize, timeout: Duration) -> Value {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(signal) = self.of_type(type_tag).into_iter().nth(skip) {
                return signal["event"].clone();
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for signal #{skip} of type {type_tag:?}"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Poll the session until it reaches the wanted state.
pub fn wait_for_state(manager: &SessionManager, wanted: SessionState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let state = manager.state();
        if state == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for session state {wanted:?}; currently {state:?}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Poll until the predicate holds.
pub fn wait_until(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
