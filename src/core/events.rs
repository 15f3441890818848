//! Structured event envelope for observability.
//!
//! Every machine-readable event the engine emits is a single-line JSON
//! object:
//!
//!   {"kind": "peershare.event", "version": 1,
//!    "event": "...", "timestamp": <ms>, "payload": {...}}
//!
//! The parser also accepts the legacy flat shape
//! `{event, timestamp, ...siblings}` by folding siblings into `payload`.
//! Tests and the baseline harness depend on this envelope; do not log
//! metrics outside it.

use crate::utils::clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Envelope discriminator value.
pub const EVENT_KIND: &str = "peershare.event";

/// Current envelope version.
pub const EVENT_VERSION: u32 = 1;

/// Default capacity of the in-memory event ring.
const MAX_BUFFERED_EVENTS: usize = 2_000;

/// Initialize tracing for a host application: env-filterable, line-based
/// output so the structured envelopes under `peershare::event` stay
/// machine-parseable. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter_layer = tracing_subscriber::EnvFilter::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// One observability event in its canonical wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub kind: String,
    pub version: u32,
    pub event: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event: &str, timestamp: u64, payload: Value) -> Self {
        Self {
            kind: EVENT_KIND.to_string(),
            version: EVENT_VERSION,
            event: event.to_string(),
            timestamp,
            payload,
        }
    }

    /// Parse a JSON line into an envelope.
    ///
    /// Accepts the canonical shape and the legacy flat shape. Returns
    /// `None` for anything that is not an event (no `event` field, wrong
    /// `kind`, or malformed JSON).
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let obj = value.as_object()?;

        match obj.get("kind").and_then(Value::as_str) {
            Some(EVENT_KIND) => serde_json::from_value(value.clone()).ok(),
            Some(_) => None,
            // Legacy shape: {event, timestamp, ...siblings}.
            None => {
                let event = obj.get("event")?.as_str()?.to_string();
                let timestamp = obj.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
                let mut payload = serde_json::Map::new();
                for (key, val) in obj {
                    if key != "event" && key != "timestamp" {
                        payload.insert(key.clone(), val.clone());
                    }
                }
                Some(Self::new(&event, timestamp, Value::Object(payload)))
            }
        }
    }

    /// Serialize to the single-line canonical form.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Event buffer ─────────────────────────────────────────────────────────────

/// Bounded in-memory ring of emitted envelopes.
///
/// Post-mortem reports and tests read from here instead of parsing log
/// text. Clones share the same ring.
#[derive(Clone)]
pub struct EventBuffer {
    entries: Arc<Mutex<VecDeque<EventEnvelope>>>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFFERED_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    pub fn push(&self, envelope: EventEnvelope) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(envelope);
    }

    /// Snapshot of all buffered envelopes, oldest first.
    pub fn entries(&self) -> Vec<EventEnvelope> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// All buffered envelopes with the given event name.
    pub fn named(&self, event: &str) -> Vec<EventEnvelope> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Event log ────────────────────────────────────────────────────────────────

/// Emitter that stamps, buffers, and traces envelopes.
#[derive(Clone)]
pub struct EventLog {
    buffer: EventBuffer,
    clock: Arc<dyn Clock>,
}

impl EventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buffer: EventBuffer::new(),
            clock,
        }
    }

    pub fn with_buffer(clock: Arc<dyn Clock>, buffer: EventBuffer) -> Self {
        Self { buffer, clock }
    }

    /// Emit one event: buffered for tests/reports and traced as a single
    /// JSON line under the `peershare::event` target.
    pub fn emit(&self, event: &str, payload: Value) {
        let envelope = EventEnvelope::new(event, self.clock.now_ms(), payload);
        info!(
            target: "peershare::event",
            event = %envelope.event,
            envelope = %envelope.to_line(),
        );
        self.buffer.push(envelope);
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use serde_json::json;

    #[test]
    fn canonical_round_trip() {
        let envelope = EventEnvelope::new(
            "transfer_send_complete",
            1_234,
            json!({"fileSizeBytes": 104857600}),
        );
        let parsed = EventEnvelope::parse(&envelope.to_line()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn legacy_shape_folds_siblings_into_payload() {
        let parsed = EventEnvelope::parse(
            r#"{"event":"backpressure_mode_active","timestamp":42,"mode":"event","waits":3}"#,
        )
        .unwrap();
        assert_eq!(parsed.event, "backpressure_mode_active");
        assert_eq!(parsed.timestamp, 42);
        assert_eq!(parsed.payload["mode"], "event");
        assert_eq!(parsed.payload["waits"], 3);
    }

    #[test]
    fn rejects_non_events() {
        assert!(EventEnvelope::parse("not json").is_none());
        assert!(EventEnvelope::parse(r#"{"message":"plain log"}"#).is_none());
        assert!(EventEnvelope::parse(r#"{"kind":"other.thing","event":"x"}"#).is_none());
    }

    #[test]
    fn buffer_is_bounded() {
        let buffer = EventBuffer::with_capacity(2);
        for i in 0..5 {
            buffer.push(EventEnvelope::new("e", i, Value::Null));
        }
        let entries = buffer.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, 3);
        assert_eq!(entries[1].timestamp, 4);
    }

    #[test]
    fn event_log_stamps_with_clock() {
        let clock = ManualClock::new(777);
        let log = EventLog::new(clock.clone());
        log.emit("transfer_resume_negotiated", json!({"startChunk": 12}));

        let events = log.buffer().named("transfer_resume_negotiated");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 777);
        assert_eq!(events[0].payload["startChunk"], 12);
    }
}
