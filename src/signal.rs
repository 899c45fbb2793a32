//! Process-wide signal fan-out to the outer application.
//!
//! The sink is a single callback receiving one UTF-8 JSON string per
//! event: `{"type": "<kebab-case tag>", "event": {...}}`. A null handler
//! is legal and drops events without error.

use std::sync::RwLock;

use serde_json::{json, Value};
use tracing::trace;

/// Callback receiving serialized signal envelopes.
pub type SignalHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Fan-out of structured events to the outer application.
#[derive(Default)]
pub struct SignalBus {
    handler: RwLock<Option<SignalHandler>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the sink callback, replacing any previous one.
    pub fn set_handler(&self, handler: SignalHandler) {
        *self.handler.write().unwrap() = Some(handler);
    }

    /// Remove the sink; subsequent events are dropped.
    pub fn clear_handler(&self) {
        *self.handler.write().unwrap() = None;
    }

    /// Emit one signal with the given type tag and payload object.
    pub fn emit(&self, type_tag: &str, payload: Value) {
        trace!(signal = type_tag, "emitting signal");
        let envelope = json!({
            "type": type_tag,
            "event": payload,
        });
        let serialized = envelope.to_string();

        let handler = self.handler.read().unwrap();
        if let Some(handler) = handler.as_ref() {
            handler(&serialized);
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed = self.handler.read().unwrap().is_some();
        f.debug_struct("SignalBus")
            .field("handler", &installed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn emits_envelope_to_handler() {
        let bus = SignalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.set_handler(Box::new(move |s| sink.lock().unwrap().push(s.to_string())));

        bus.emit("flow-result", json!({"error": "ok"}));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let parsed: Value = serde_json::from_str(&seen[0]).unwrap();
        assert_eq!(parsed["type"], "flow-result");
        assert_eq!(parsed["event"]["error"], "ok");
    }

    #[test]
    fn null_handler_drops_events() {
        let bus = SignalBus::new();
        bus.emit("status-changed", json!({}));
        bus.clear_handler();
        bus.emit("status-changed", json!({}));
    }
}
