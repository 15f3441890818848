//! Backpressure arbiter: suspend the sender until the channel's outbound
//! buffer drains.
//!
//! Two disciplines:
//! - event: one-shot low-buffer notification with a watchdog. A timeout or
//!   registration failure latches a fallback and downgrades the connection
//!   to polling permanently.
//! - polling: tight sleep-and-read loop on `buffered_amount`.
//!
//! `auto` starts event-driven and keeps whatever the latch decides. The
//! first successful event wait emits a single `backpressure_mode_active`
//! event so harness runs can verify which path was exercised.

use crate::core::config::{
    BackpressureMode, EngineConfig, BACKPRESSURE_EVENT_TIMEOUT, BACKPRESSURE_POLL_INTERVAL,
};
use crate::core::events::EventLog;
use crate::core::transfer::{ErrorCode, TransferError};
use crate::transport::{ChannelState, DataChannel};
use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

// ── Wait accounting ──────────────────────────────────────────────────────────

/// Cumulative wait timing, split by discipline. Feeds the
/// `transfer_send_complete` metric payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackpressureTotals {
    pub event_waits: u64,
    pub event_wait_ms: u64,
    pub polling_waits: u64,
    pub polling_wait_ms: u64,
}

impl BackpressureTotals {
    pub fn total_waits(&self) -> u64 {
        self.event_waits + self.polling_waits
    }
}

// ── Arbiter ──────────────────────────────────────────────────────────────────

/// Per-connection backpressure state. Build one per data channel; the
/// fallback latch is deliberately not resettable within a connection.
pub struct BackpressureArbiter {
    mode: BackpressureMode,
    max_buffered_amount: usize,
    low_threshold: usize,
    event_timeout: Duration,
    poll_interval: Duration,

    /// Permanent downgrade latch for this connection.
    event_fallback: AtomicBool,
    /// Whether the one-time `backpressure_mode_active` event fired.
    event_mode_announced: AtomicBool,

    event_waits: AtomicU64,
    event_wait_ms: AtomicU64,
    polling_waits: AtomicU64,
    polling_wait_ms: AtomicU64,

    events: EventLog,
}

impl BackpressureArbiter {
    pub fn new(config: &EngineConfig, events: EventLog) -> Self {
        Self {
            mode: config.backpressure_mode,
            max_buffered_amount: config.max_buffered_amount,
            low_threshold: config.low_threshold,
            event_timeout: BACKPRESSURE_EVENT_TIMEOUT,
            poll_interval: BACKPRESSURE_POLL_INTERVAL,
            event_fallback: AtomicBool::new(false),
            event_mode_announced: AtomicBool::new(false),
            event_waits: AtomicU64::new(0),
            event_wait_ms: AtomicU64::new(0),
            polling_waits: AtomicU64::new(0),
            polling_wait_ms: AtomicU64::new(0),
            events,
        }
    }

    /// The discipline currently in force, after any latched fallback.
    pub fn effective_mode(&self) -> BackpressureMode {
        match self.mode {
            BackpressureMode::Polling => BackpressureMode::Polling,
            BackpressureMode::Event | BackpressureMode::Auto => {
                if self.event_fallback.load(Ordering::Acquire) {
                    BackpressureMode::Polling
                } else {
                    BackpressureMode::Event
                }
            }
        }
    }

    /// The sender only calls [`Self::wait_for_backpressure`] when
    /// `buffered_amount` exceeds this.
    pub fn wait_threshold(&self) -> usize {
        match self.effective_mode() {
            BackpressureMode::Polling => self.max_buffered_amount,
            _ => self.max_buffered_amount.max(self.low_threshold),
        }
    }

    /// Snapshot of cumulative wait totals.
    pub fn totals(&self) -> BackpressureTotals {
        BackpressureTotals {
            event_waits: self.event_waits.load(Ordering::Relaxed),
            event_wait_ms: self.event_wait_ms.load(Ordering::Relaxed),
            polling_waits: self.polling_waits.load(Ordering::Relaxed),
            polling_wait_ms: self.polling_wait_ms.load(Ordering::Relaxed),
        }
    }

    /// Suspend until `buffered_amount <= max_buffered_amount`.
    ///
    /// Fails with a recoverable `DATA_CHANNEL_NOT_READY` if the channel
    /// closes during the wait.
    pub async fn wait_for_backpressure(&self, channel: &dyn DataChannel) -> Result<()> {
        if channel.buffered_amount().await <= self.max_buffered_amount {
            return Ok(());
        }

        match self.effective_mode() {
            BackpressureMode::Polling => self.wait_polling(channel).await,
            _ => self.wait_event(channel).await,
        }
    }

    async fn wait_polling(&self, channel: &dyn DataChannel) -> Result<()> {
        let started = Instant::now();
        loop {
            assert_channel_open(channel)?;
            if channel.buffered_amount().await <= self.max_buffered_amount {
                self.polling_waits.fetch_add(1, Ordering::Relaxed);
                self.polling_wait_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_event(&self, channel: &dyn DataChannel) -> Result<()> {
        let started = Instant::now();
        channel.set_low_threshold(self.low_threshold);
        let notify = channel.low_notify();

        loop {
            assert_channel_open(channel)?;

            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before the re-check, so a drain landing
            // between the read and the wait cannot be missed.
            notified.as_mut().enable();

            if channel.buffered_amount().await <= self.max_buffered_amount {
                break;
            }

            match tokio::time::timeout(self.event_timeout, notified).await {
                Ok(()) => {
                    if channel.buffered_amount().await <= self.max_buffered_amount {
                        break;
                    }
                    // Spurious or partial drain: keep waiting.
                }
                Err(_) => {
                    self.latch_fallback("event_timeout");
                    return self.wait_polling(channel).await;
                }
            }
        }

        self.event_waits.fetch_add(1, Ordering::Relaxed);
        self.event_wait_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        if !self.event_mode_announced.swap(true, Ordering::AcqRel) {
            self.events.emit(
                "backpressure_mode_active",
                json!({ "mode": "event", "lowThreshold": self.low_threshold }),
            );
        }
        Ok(())
    }

    fn latch_fallback(&self, reason: &str) {
        if !self.event_fallback.swap(true, Ordering::AcqRel) {
            warn!(
                event = "backpressure_event_fallback",
                reason,
                "Low-buffer event path failed; downgrading to polling for this connection"
            );
            self.events
                .emit("backpressure_event_fallback", json!({ "reason": reason }));
        }
    }
}

fn assert_channel_open(channel: &dyn DataChannel) -> Result<()> {
    match channel.state() {
        ChannelState::Open => Ok(()),
        state => Err(TransferError::new(
            ErrorCode::DataChannelNotReady,
            format!(
                "data channel '{}' left open state during backpressure wait: {state:?}",
                channel.label()
            ),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::error_code;
    use crate::transport::memory::MemoryChannel;
    use crate::utils::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn arbiter(mode: BackpressureMode, max: usize) -> BackpressureArbiter {
        let mut config = EngineConfig::default();
        config.backpressure_mode = mode;
        config.max_buffered_amount = max;
        config.low_threshold = max;
        BackpressureArbiter::new(&config, EventLog::new(ManualClock::new(0)))
    }

    #[tokio::test]
    async fn returns_immediately_under_threshold() {
        let (a, _b) = MemoryChannel::pair("data");
        let arbiter = arbiter(BackpressureMode::Polling, 1024);
        arbiter.wait_for_backpressure(a.channel.as_ref()).await.unwrap();
        assert_eq!(arbiter.totals().total_waits(), 0);
    }

    #[tokio::test]
    async fn polling_waits_for_manual_drain() {
        let (a, _b) = MemoryChannel::pair("data");
        a.raw.set_manual_drain(true);
        a.channel.send_binary(&[0u8; 2048]).await.unwrap();

        let arbiter = Arc::new(arbiter(BackpressureMode::Polling, 1024));
        let channel = Arc::clone(&a.channel);
        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move { arbiter.wait_for_backpressure(channel.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        a.raw.drain(2048);
        waiter.await.unwrap().unwrap();
        assert_eq!(arbiter.totals().polling_waits, 1);
        assert_eq!(arbiter.totals().event_waits, 0);
    }

    #[tokio::test]
    async fn event_mode_resolves_on_low_notify() {
        let (a, _b) = MemoryChannel::pair("data");
        a.raw.set_manual_drain(true);
        a.channel.send_binary(&[0u8; 2048]).await.unwrap();

        let arbiter = Arc::new(arbiter(BackpressureMode::Event, 1024));
        let channel = Arc::clone(&a.channel);
        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move { arbiter.wait_for_backpressure(channel.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.raw.drain(2048);
        waiter.await.unwrap().unwrap();

        let totals = arbiter.totals();
        assert_eq!(totals.event_waits, 1);
        assert_eq!(totals.polling_waits, 0);
        // One-time mode announcement.
        assert_eq!(
            arbiter.events.buffer().named("backpressure_mode_active").len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn event_timeout_latches_permanent_polling_fallback() {
        let (a, _b) = MemoryChannel::pair("data");
        a.raw.set_manual_drain(true);
        a.raw.suppress_low_notify(true);
        a.channel.send_binary(&[0u8; 2048]).await.unwrap();

        let arbiter = Arc::new(arbiter(BackpressureMode::Auto, 1024));
        assert_eq!(arbiter.effective_mode(), BackpressureMode::Event);

        let channel = Arc::clone(&a.channel);
        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move { arbiter.wait_for_backpressure(channel.as_ref()).await })
        };

        // Let the watchdog fire, then drain so the polling path completes.
        tokio::time::sleep(BACKPRESSURE_EVENT_TIMEOUT + Duration::from_millis(50)).await;
        a.raw.drain(2048);
        waiter.await.unwrap().unwrap();

        assert_eq!(arbiter.effective_mode(), BackpressureMode::Polling);
        assert_eq!(arbiter.totals().polling_waits, 1);
        assert_eq!(
            arbiter.events.buffer().named("backpressure_event_fallback").len(),
            1
        );
        // Threshold shrinks with the downgrade.
        assert_eq!(arbiter.wait_threshold(), 1024);
    }

    #[tokio::test]
    async fn closing_channel_fails_recoverably() {
        let (a, _b) = MemoryChannel::pair("data");
        a.raw.set_manual_drain(true);
        a.channel.send_binary(&[0u8; 2048]).await.unwrap();
        a.channel.close().await;

        let arbiter = arbiter(BackpressureMode::Polling, 1024);
        let err = arbiter
            .wait_for_backpressure(a.channel.as_ref())
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::DataChannelNotReady));
    }
}
