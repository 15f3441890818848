//! Centralized configuration constants for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (frame tags, protocol version)
//! stay in the transfer module.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (64 KiB).
///
/// The planner adapts downward from here based on measured RTT and the
/// transport's maximum message size; it never goes below
/// [`MIN_CHUNK_SIZE`] and always stays on a [`CHUNK_SIZE_STEP`] boundary.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Hard floor for the chunk size (16 KiB).
pub const MIN_CHUNK_SIZE: u32 = 16 * 1024;

/// Chunk sizes are rounded down to a multiple of this step (4 KiB).
pub const CHUNK_SIZE_STEP: u32 = 4 * 1024;

/// Bytes reserved for per-message protocol overhead when clamping the chunk
/// size against the transport's maximum message size.
pub const CHUNK_MESSAGE_OVERHEAD: u32 = 1024;

/// How long a sampled RTT stays valid before the planner re-reads transport
/// statistics. Avoids a stats call per chunk on the hot path.
pub const RUNTIME_RTT_CACHE_MS: u64 = 3_000;

/// Files at or above this size trigger a memory-guard warning event on the
/// receive side (256 MiB). Chunks themselves are never accumulated in
/// memory when a persistent store is configured.
pub const MEMORY_GUARD_THRESHOLD_BYTES: u64 = 256 * 1024 * 1024;

// ── Backpressure ─────────────────────────────────────────────────────────────

/// High water mark for the data channel's outbound buffer (12 MiB). The
/// sender pauses chunk transmission while `buffered_amount` exceeds this.
pub const MAX_BUFFERED_AMOUNT: usize = 12 * 1024 * 1024;

/// Low-buffer threshold handed to the transport for event-driven waits
/// (12 MiB).
pub const LOW_BUFFER_THRESHOLD: usize = 12 * 1024 * 1024;

/// Watchdog on a single event-driven backpressure wait. Firing it latches a
/// permanent downgrade to polling for the rest of the connection.
pub const BACKPRESSURE_EVENT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Sleep between `buffered_amount` reads in polling mode.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper cap applied to override-supplied buffer thresholds (64 MiB).
pub const MAX_OVERRIDE_BUFFER_BYTES: usize = 64 * 1024 * 1024;

// ── Transfer timeouts / resume ───────────────────────────────────────────────

/// How long the sender waits for `receiver-ready` after a `file-offer`.
pub const RECEIVER_READY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Deadline for the sender's outer auto-resume loop. Interruptions past
/// this point surface `AUTO_RESUME_TIMEOUT`.
pub const AUTO_RESUME_MAX_WAIT: Duration = Duration::from_millis(120_000);

/// Poll interval while waiting for the data channel to reopen between
/// auto-resume attempts.
pub const AUTO_RESUME_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Persisted sessions older than this are pruned (24 h).
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

// ── Recovery ─────────────────────────────────────────────────────────────────

/// Grace window after an ICE disconnect before active recovery starts, and
/// the watchdog on a single ICE-restart attempt.
pub const GRACE_PERIOD: Duration = Duration::from_millis(8_000);

/// ICE restart attempts before falling through to a full rebuild.
pub const MAX_RESTART_ICE_ATTEMPTS: u32 = 2;

/// Full peer-connection rebuild attempts before giving up.
pub const MAX_REBUILD_ATTEMPTS: u32 = 3;

/// Base delay for rebuild backoff: `min(base * 2^(attempt-1), cap)`.
pub const BACKOFF_BASE: Duration = Duration::from_millis(2_000);

/// Cap for rebuild backoff.
pub const MAX_BACKOFF: Duration = Duration::from_millis(15_000);

/// How long the connection must stay up after a mediated recovery before
/// the attempt counters reset.
pub const RECOVERY_GRACE_PERIOD: Duration = Duration::from_millis(5_000);

/// Race-probe sampling interval while connected.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(5_000);

/// Selected-pair RTT at or above this is considered pathologically slow.
pub const HIGH_RTT_MS: f64 = 800.0;

/// Minimum RTT improvement over the best observed pair required to trigger
/// a race probe.
pub const IMPROVEMENT_THRESHOLD_MS: f64 = 120.0;

/// Race probes per connection lifetime.
pub const MAX_PROBE_ATTEMPTS: u32 = 1;

// ── Receive path ─────────────────────────────────────────────────────────────

/// Depth of the per-file serialized write queue. Wire order is preserved;
/// the bound only limits how far the network can run ahead of the store.
pub const WRITE_QUEUE_DEPTH: usize = 64;

// ── Backpressure mode ────────────────────────────────────────────────────────

/// How the backpressure arbiter waits for the outbound buffer to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// One-shot low-buffer event with a watchdog.
    Event,
    /// Tight sleep-and-read loop.
    Polling,
    /// Event-driven until the first failure, then polling for good.
    Auto,
}

impl BackpressureMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "event" => Some(Self::Event),
            "polling" => Some(Self::Polling),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

// ── Runtime overrides ────────────────────────────────────────────────────────

/// Tuning overrides for the backpressure arbiter and chunk planner.
///
/// The browser build reads these from URL query parameters; here they are
/// an explicit struct, with [`RuntimeOverrides::from_query`] kept for
/// parity so harness URLs can be applied verbatim. They exist solely to
/// make the adaptive and backpressure paths deterministically testable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    /// `psBackpressureMode`: event | polling | auto.
    pub backpressure_mode: Option<BackpressureMode>,
    /// `psMaxBufferedAmount`: positive, capped at 64 MiB.
    pub max_buffered_amount: Option<usize>,
    /// `psLowThreshold`: positive, capped at 64 MiB.
    pub low_threshold: Option<usize>,
    /// `psForceMaxMessageSize`: positive, floored at 16 KiB.
    pub force_max_message_size: Option<usize>,
    /// `psForceRttMs`: positive.
    pub force_rtt_ms: Option<u64>,
}

impl RuntimeOverrides {
    /// Parse overrides from a URL query string (with or without a leading
    /// `?`). Unknown keys and out-of-range values are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut overrides = Self::default();
        for pair in query.trim_start_matches('?').split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "psBackpressureMode" => {
                    overrides.backpressure_mode = BackpressureMode::parse(value);
                }
                "psMaxBufferedAmount" => {
                    overrides.max_buffered_amount =
                        parse_positive(value).map(|v| v.min(MAX_OVERRIDE_BUFFER_BYTES));
                }
                "psLowThreshold" => {
                    overrides.low_threshold =
                        parse_positive(value).map(|v| v.min(MAX_OVERRIDE_BUFFER_BYTES));
                }
                "psForceMaxMessageSize" => {
                    overrides.force_max_message_size =
                        parse_positive(value).map(|v| v.max(MIN_CHUNK_SIZE as usize));
                }
                "psForceRttMs" => {
                    overrides.force_rtt_ms = parse_positive(value).map(|v| v as u64);
                }
                _ => {}
            }
        }
        overrides
    }
}

fn parse_positive(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|v| *v > 0)
}

// ── Engine configuration ─────────────────────────────────────────────────────

/// Resolved engine configuration: defaults with overrides applied.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backpressure_mode: BackpressureMode,
    pub max_buffered_amount: usize,
    pub low_threshold: usize,
    pub base_chunk_size: u32,
    pub force_max_message_size: Option<usize>,
    pub force_rtt_ms: Option<u64>,
    pub session_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backpressure_mode: BackpressureMode::Auto,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            low_threshold: LOW_BUFFER_THRESHOLD,
            base_chunk_size: DEFAULT_CHUNK_SIZE,
            force_max_message_size: None,
            force_rtt_ms: None,
            session_ttl: SESSION_TTL,
        }
    }
}

impl EngineConfig {
    /// Apply runtime overrides on top of the defaults.
    pub fn with_overrides(overrides: &RuntimeOverrides) -> Self {
        let mut config = Self::default();
        if let Some(mode) = overrides.backpressure_mode {
            config.backpressure_mode = mode;
        }
        if let Some(max) = overrides.max_buffered_amount {
            config.max_buffered_amount = max;
        }
        if let Some(low) = overrides.low_threshold {
            config.low_threshold = low;
        }
        config.force_max_message_size = overrides.force_max_message_size;
        config.force_rtt_ms = overrides.force_rtt_ms;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_query() {
        let o = RuntimeOverrides::from_query(
            "?psBackpressureMode=polling&psMaxBufferedAmount=1048576&psLowThreshold=524288&psForceMaxMessageSize=20000&psForceRttMs=400",
        );
        assert_eq!(o.backpressure_mode, Some(BackpressureMode::Polling));
        assert_eq!(o.max_buffered_amount, Some(1_048_576));
        assert_eq!(o.low_threshold, Some(524_288));
        assert_eq!(o.force_max_message_size, Some(20_000));
        assert_eq!(o.force_rtt_ms, Some(400));
    }

    #[test]
    fn ignores_unknown_and_invalid_values() {
        let o = RuntimeOverrides::from_query(
            "psBackpressureMode=bogus&psMaxBufferedAmount=0&psForceRttMs=-3&other=1",
        );
        assert_eq!(o, RuntimeOverrides::default());
    }

    #[test]
    fn caps_buffer_overrides_at_64_mib() {
        let o = RuntimeOverrides::from_query("psMaxBufferedAmount=999999999999");
        assert_eq!(o.max_buffered_amount, Some(MAX_OVERRIDE_BUFFER_BYTES));
    }

    #[test]
    fn floors_forced_message_size_at_16_kib() {
        let o = RuntimeOverrides::from_query("psForceMaxMessageSize=100");
        assert_eq!(o.force_max_message_size, Some(MIN_CHUNK_SIZE as usize));
    }

    #[test]
    fn overrides_apply_to_config() {
        let o = RuntimeOverrides::from_query("psBackpressureMode=event&psLowThreshold=4096");
        let config = EngineConfig::with_overrides(&o);
        assert_eq!(config.backpressure_mode, BackpressureMode::Event);
        assert_eq!(config.low_threshold, 4_096);
        assert_eq!(config.max_buffered_amount, MAX_BUFFERED_AMOUNT);
    }
}
