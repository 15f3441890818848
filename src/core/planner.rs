//! Adaptive chunk planner.
//!
//! Chooses the chunk size for a transfer from two signals: the measured
//! round-trip time of the path (slower paths get smaller chunks so
//! backpressure stays responsive) and the transport's maximum message size
//! (a hard bound; the clamp reserves 1 KiB of framing overhead). The
//! message-limit clamp dominates the reported reason.

use crate::core::config::{
    CHUNK_MESSAGE_OVERHEAD, CHUNK_SIZE_STEP, MIN_CHUNK_SIZE, RUNTIME_RTT_CACHE_MS,
};
use crate::core::integrity::total_chunk_count;
use serde::{Deserialize, Serialize};

// ── RTT policy tiers ─────────────────────────────────────────────────────────

const RTT_KEEP_BASE_MS: f64 = 60.0;
const RTT_CAP_48K_MS: f64 = 140.0;
const RTT_CAP_32K_MS: f64 = 280.0;

// ── Plan ─────────────────────────────────────────────────────────────────────

/// Why the planner picked the size it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    Default,
    RttAdaptive,
    MaxMessageSize,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::Default => "default",
            PlanReason::RttAdaptive => "rtt_adaptive",
            PlanReason::MaxMessageSize => "max_message_size",
        }
    }
}

/// Output of one planning pass for a specific file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub reason: PlanReason,
    /// The RTT sample that informed the plan, if any.
    pub rtt_ms: Option<f64>,
    /// The message limit that informed the plan, if any.
    pub max_message_size: Option<usize>,
}

/// Pick a chunk size for a `size`-byte file.
///
/// `base_chunk_size` is the starting point (a resumed session passes its
/// persisted chunk size so resume offsets stay valid); `max_message_size`
/// comes from the transport when known; `rtt_ms` is the latest sample.
pub fn plan_chunk_size(
    base_chunk_size: u32,
    max_message_size: Option<usize>,
    rtt_ms: Option<f64>,
    size: u64,
) -> ChunkPlan {
    let base = base_chunk_size.max(MIN_CHUNK_SIZE);

    let rtt_cap = rtt_ms.map(|rtt| {
        let cap = if rtt <= RTT_KEEP_BASE_MS {
            base
        } else if rtt <= RTT_CAP_48K_MS {
            48 * 1024
        } else if rtt <= RTT_CAP_32K_MS {
            32 * 1024
        } else {
            16 * 1024
        };
        cap.max(MIN_CHUNK_SIZE)
    });

    let limit_cap = max_message_size.map(|limit| {
        let usable = (limit as u64).saturating_sub(CHUNK_MESSAGE_OVERHEAD as u64) as u32;
        let aligned = (usable / CHUNK_SIZE_STEP) * CHUNK_SIZE_STEP;
        aligned.max(MIN_CHUNK_SIZE)
    });

    let chunk_size = base
        .min(rtt_cap.unwrap_or(base))
        .min(limit_cap.unwrap_or(base));

    // The message-limit clamp dominates the reported reason when both
    // signals land on the same size.
    let reason = if chunk_size < base {
        if limit_cap == Some(chunk_size) {
            PlanReason::MaxMessageSize
        } else {
            PlanReason::RttAdaptive
        }
    } else {
        PlanReason::Default
    };

    ChunkPlan {
        chunk_size,
        total_chunks: total_chunk_count(size, chunk_size),
        reason,
        rtt_ms,
        max_message_size,
    }
}

// ── RTT cache ────────────────────────────────────────────────────────────────

/// Caches the last RTT sample so the planner does not hit transport
/// statistics on every chunk. A forced RTT (runtime override) pins the
/// sample forever.
#[derive(Debug, Default)]
pub struct RttCache {
    sampled_at_ms: Option<u64>,
    rtt_ms: Option<f64>,
    forced: bool,
}

impl RttCache {
    pub fn new(force_rtt_ms: Option<u64>) -> Self {
        match force_rtt_ms {
            Some(forced) => Self {
                sampled_at_ms: Some(0),
                rtt_ms: Some(forced as f64),
                forced: true,
            },
            None => Self::default(),
        }
    }

    /// The cached sample, if still fresh at `now_ms`.
    ///
    /// `Some(None)` means "we asked the transport recently and it had no
    /// RTT", which is still a fresh answer; the caller must not re-sample.
    pub fn fresh(&self, now_ms: u64) -> Option<Option<f64>> {
        if self.forced {
            return Some(self.rtt_ms);
        }
        let sampled_at = self.sampled_at_ms?;
        if now_ms.saturating_sub(sampled_at) <= RUNTIME_RTT_CACHE_MS {
            Some(self.rtt_ms)
        } else {
            None
        }
    }

    /// Record a new sample taken at `now_ms`. No-op when an override pins
    /// the RTT.
    pub fn store(&mut self, now_ms: u64, rtt_ms: Option<f64>) {
        if self.forced {
            return;
        }
        self.sampled_at_ms = Some(now_ms);
        self.rtt_ms = rtt_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 64 * 1024;

    #[test]
    fn keeps_base_on_fast_path() {
        let plan = plan_chunk_size(BASE, None, Some(40.0), 1_000_000);
        assert_eq!(plan.chunk_size, BASE);
        assert_eq!(plan.reason, PlanReason::Default);
    }

    #[test]
    fn rtt_tiers_cap_the_size() {
        assert_eq!(
            plan_chunk_size(BASE, None, Some(100.0), 1).chunk_size,
            48 * 1024
        );
        assert_eq!(
            plan_chunk_size(BASE, None, Some(200.0), 1).chunk_size,
            32 * 1024
        );
        let slow = plan_chunk_size(BASE, None, Some(400.0), 1);
        assert_eq!(slow.chunk_size, 16 * 1024);
        assert_eq!(slow.reason, PlanReason::RttAdaptive);
    }

    #[test]
    fn rtt_never_grows_a_small_base() {
        // A resumed 16 KiB session on a fast path stays at 16 KiB.
        let plan = plan_chunk_size(16 * 1024, None, Some(10.0), 1_000_000);
        assert_eq!(plan.chunk_size, 16 * 1024);
        assert_eq!(plan.reason, PlanReason::Default);
    }

    #[test]
    fn message_limit_clamps_and_dominates() {
        // 20 000 − 1024 = 18 976, aligned down to 16 384.
        let plan = plan_chunk_size(BASE, Some(20_000), Some(400.0), 5 * 1024 * 1024);
        assert_eq!(plan.chunk_size, 16 * 1024);
        assert_eq!(plan.reason, PlanReason::MaxMessageSize);
    }

    #[test]
    fn tiny_message_limit_floors_at_min() {
        let plan = plan_chunk_size(BASE, Some(2_000), None, 1);
        assert_eq!(plan.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(plan.reason, PlanReason::MaxMessageSize);
    }

    #[test]
    fn generous_limit_leaves_base_untouched() {
        let plan = plan_chunk_size(BASE, Some(1024 * 1024), None, 1);
        assert_eq!(plan.chunk_size, BASE);
        assert_eq!(plan.reason, PlanReason::Default);
    }

    #[test]
    fn total_chunks_follow_plan() {
        let plan = plan_chunk_size(BASE, None, None, 0);
        assert_eq!(plan.total_chunks, 0);
        let plan = plan_chunk_size(BASE, None, None, BASE as u64 * 3);
        assert_eq!(plan.total_chunks, 3);
    }

    #[test]
    fn rtt_cache_expires() {
        let mut cache = RttCache::new(None);
        assert_eq!(cache.fresh(0), None);
        cache.store(1_000, Some(55.0));
        assert_eq!(cache.fresh(2_000), Some(Some(55.0)));
        assert_eq!(cache.fresh(1_000 + RUNTIME_RTT_CACHE_MS), Some(Some(55.0)));
        assert_eq!(cache.fresh(1_000 + RUNTIME_RTT_CACHE_MS + 1), None);
    }

    #[test]
    fn rtt_cache_caches_absent_samples() {
        let mut cache = RttCache::new(None);
        cache.store(500, None);
        assert_eq!(cache.fresh(600), Some(None));
    }

    #[test]
    fn forced_rtt_pins_the_sample() {
        let mut cache = RttCache::new(Some(400));
        assert_eq!(cache.fresh(u64::MAX), Some(Some(400.0)));
        cache.store(10, Some(5.0));
        assert_eq!(cache.fresh(20), Some(Some(400.0)));
    }
}
