//! Reconnect recovery: grace window, ICE restart, rebuild with backoff,
//! and the race probe for pathologically slow selected paths.
//!
//! The controller owns every recovery timer and never performs signalling
//! itself: it calls the transport's restart primitive directly and emits
//! [`RecoveryCommand`]s that the session driver executes (renegotiation
//! offers, full rebuilds, terminal failure). Mutual exclusion between
//! overlapping recovery entries is the phase machine itself: a disconnect
//! observed mid-recovery is absorbed instead of starting a second attempt.
//!
//! State machine per peer connection:
//!
//!   connected ──disconnected──▶ waiting_grace ──timer──▶ restart_ice
//!   restart_ice ──success──▶ connected    ──exhaust──▶ rebuild
//!   rebuild     ──success──▶ connected    ──exhaust──▶ failed (terminal)
//!   connected ──race_probe──▶ restart_ice

use crate::core::config::{
    BACKOFF_BASE, GRACE_PERIOD, HIGH_RTT_MS, IMPROVEMENT_THRESHOLD_MS, MAX_BACKOFF,
    MAX_PROBE_ATTEMPTS, MAX_REBUILD_ATTEMPTS, MAX_RESTART_ICE_ATTEMPTS, MONITOR_INTERVAL,
    RECOVERY_GRACE_PERIOD,
};
use crate::core::events::EventLog;
use crate::transport::{PeerConnectionState, PeerTransport};
use crate::utils::shutdown::Shutdown;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Delay between the restart primitive and the explicit renegotiation
/// offer. This codebase never relies on a renegotiation-needed event.
const RENEGOTIATE_DELAY: Duration = Duration::from_millis(100);

// ── Commands ─────────────────────────────────────────────────────────────────

/// Work the session driver performs on the controller's behalf.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryCommand {
    /// Create and signal a fresh offer (follows an ICE restart).
    Renegotiate,
    /// Tear down and fully re-initialize the peer connection.
    Rebuild,
    /// Recovery exhausted; the connection is gone for good.
    Failed { message: String },
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Counters exposed for metrics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub restart_ice_attempts: u32,
    pub rebuild_attempts: u32,
    pub probe_attempts: u32,
    pub in_progress: bool,
    pub terminal: bool,
}

// ── Phase machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Connected (or not yet connected) with no recovery underway.
    Idle,
    /// Disconnect observed; waiting out the grace window.
    Grace,
    /// ICE restart issued; watchdog running.
    RestartWait,
    /// Backoff delay before the next rebuild command.
    BackoffWait,
    /// Rebuild command issued; watchdog running.
    RebuildWait,
    /// Recovery exhausted.
    Terminal,
}

enum ControllerInput {
    ReplaceTransport(Arc<dyn PeerTransport>),
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Spawned per peer connection; lives until the shutdown token cancels.
pub struct RecoveryController {
    input_tx: mpsc::UnboundedSender<ControllerInput>,
    snapshot: Arc<Mutex<RecoverySnapshot>>,
}

impl RecoveryController {
    /// Start the controller task. The returned receiver yields the
    /// commands the session driver must execute.
    pub fn spawn(
        transport: Arc<dyn PeerTransport>,
        is_initiator: bool,
        events: EventLog,
        shutdown: Shutdown,
    ) -> (Self, mpsc::UnboundedReceiver<RecoveryCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(RecoverySnapshot::default()));

        let task = ControllerTask {
            transport,
            is_initiator,
            events,
            shutdown,
            commands: command_tx,
            inputs: input_rx,
            snapshot: Arc::clone(&snapshot),
            phase: Phase::Idle,
            deadline: None,
            stability_deadline: None,
            was_recovering: false,
            restart_ice_attempts: 0,
            rebuild_attempts: 0,
            probe_attempts: 0,
            best_rtt_ms: None,
        };
        tokio::spawn(task.run());

        (Self { input_tx, snapshot }, command_rx)
    }

    /// Swap in the transport created by a rebuild. Resets the
    /// per-connection race-probe budget; restart/rebuild counters persist
    /// until the connection proves stable.
    pub fn replace_transport(&self, transport: Arc<dyn PeerTransport>) {
        let _ = self
            .input_tx
            .send(ControllerInput::ReplaceTransport(transport));
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        *self.snapshot.lock().unwrap()
    }
}

struct ControllerTask {
    transport: Arc<dyn PeerTransport>,
    is_initiator: bool,
    events: EventLog,
    shutdown: Shutdown,
    commands: mpsc::UnboundedSender<RecoveryCommand>,
    inputs: mpsc::UnboundedReceiver<ControllerInput>,
    snapshot: Arc<Mutex<RecoverySnapshot>>,

    phase: Phase,
    /// Deadline driving the current phase, if any.
    deadline: Option<Instant>,
    /// Counter-reset deadline after a mediated reconnect.
    stability_deadline: Option<Instant>,
    /// Set from the first active recovery step until the next connect.
    was_recovering: bool,

    restart_ice_attempts: u32,
    rebuild_attempts: u32,
    probe_attempts: u32,
    /// Best candidate-pair RTT observed on this connection.
    best_rtt_ms: Option<f64>,
}

impl ControllerTask {
    async fn run(mut self) {
        let mut state_rx = self.transport.state_changes();
        let mut monitor = tokio::time::interval(MONITOR_INTERVAL);
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.publish_snapshot();

            let phase_sleep = sleep_until_opt(self.deadline);
            let stability_sleep = sleep_until_opt(self.stability_deadline);

            tokio::select! {
                _ = self.shutdown.wait() => break,

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        // Transport dropped mid-rebuild; wait for the
                        // replacement to arrive on the input channel.
                        state_rx = pending_watch();
                        continue;
                    }
                    let state = *state_rx.borrow();
                    self.on_state_change(state);
                }

                Some(input) = self.inputs.recv() => match input {
                    ControllerInput::ReplaceTransport(transport) => {
                        self.transport = transport;
                        state_rx = self.transport.state_changes();
                        self.probe_attempts = 0;
                        self.best_rtt_ms = None;
                        let state = *state_rx.borrow();
                        self.on_state_change(state);
                    }
                },

                _ = phase_sleep => {
                    self.deadline = None;
                    self.on_phase_deadline().await;
                }

                _ = stability_sleep => {
                    self.stability_deadline = None;
                    self.on_stability_deadline();
                }

                _ = monitor.tick() => {
                    self.race_probe_tick().await;
                }
            }
        }
        self.publish_snapshot();
    }

    fn on_state_change(&mut self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                if self.was_recovering {
                    info!(
                        event = "ice_connected_after_recovery",
                        restart_ice_attempts = self.restart_ice_attempts,
                        rebuild_attempts = self.rebuild_attempts,
                        "Connection recovered"
                    );
                    self.events.emit(
                        "ice_connected_after_recovery",
                        json!({
                            "restartIceAttempts": self.restart_ice_attempts,
                            "rebuildAttempts": self.rebuild_attempts,
                        }),
                    );
                    // Counters reset only once the connection stays up.
                    self.stability_deadline = Some(Instant::now() + RECOVERY_GRACE_PERIOD);
                } else {
                    self.reset_counters();
                }
                self.was_recovering = false;
                self.phase = Phase::Idle;
                self.deadline = None;
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                // A connection that drops during its stability window never
                // earned the counter reset.
                self.stability_deadline = None;
                if self.phase == Phase::Idle {
                    info!(event = "ice_disconnected_grace_start", "Starting disconnect grace window");
                    self.events.emit("ice_disconnected_grace_start", json!({}));
                    self.phase = Phase::Grace;
                    self.deadline = Some(Instant::now() + GRACE_PERIOD);
                }
                // Any other phase: recovery already in progress, absorb.
            }
            _ => {}
        }
    }

    async fn on_phase_deadline(&mut self) {
        match self.phase {
            Phase::Grace | Phase::RestartWait | Phase::RebuildWait => {
                if self.transport.connection_state() == PeerConnectionState::Connected {
                    self.phase = Phase::Idle;
                    return;
                }
                self.next_recovery_step().await;
            }
            Phase::BackoffWait => {
                info!(
                    event = "connection_rebuild_start",
                    attempt = self.rebuild_attempts,
                    "Issuing full connection rebuild"
                );
                let _ = self.commands.send(RecoveryCommand::Rebuild);
                self.phase = Phase::RebuildWait;
                self.deadline = Some(Instant::now() + GRACE_PERIOD);
            }
            Phase::Idle | Phase::Terminal => {}
        }
    }

    fn on_stability_deadline(&mut self) {
        if self.transport.connection_state() == PeerConnectionState::Connected {
            self.reset_counters();
            self.events.emit("recovery_counters_reset", json!({}));
        }
    }

    /// Escalate: another ICE restart if budget remains, else rebuild.
    async fn next_recovery_step(&mut self) {
        let can_restart = self.is_initiator
            && self.transport.supports_ice_restart()
            && self.transport.connection_state() != PeerConnectionState::Closed
            && self.restart_ice_attempts < MAX_RESTART_ICE_ATTEMPTS;

        if can_restart {
            self.restart_ice_attempts += 1;
            self.was_recovering = true;
            info!(
                event = "ice_restart_attempt",
                attempt = self.restart_ice_attempts,
                "Attempting ICE restart"
            );
            self.events.emit(
                "ice_restart_attempt",
                json!({ "attempt": self.restart_ice_attempts }),
            );

            if let Err(e) = self.transport.restart_ice().await {
                warn!(event = "ice_restart_failed", error = %e, "ICE restart primitive failed");
                self.schedule_rebuild();
                return;
            }
            // Give the ICE agent a beat, then renegotiate explicitly.
            tokio::time::sleep(RENEGOTIATE_DELAY).await;
            let _ = self.commands.send(RecoveryCommand::Renegotiate);

            self.phase = Phase::RestartWait;
            self.deadline = Some(Instant::now() + GRACE_PERIOD);
        } else {
            self.schedule_rebuild();
        }
    }

    fn schedule_rebuild(&mut self) {
        if self.rebuild_attempts >= MAX_REBUILD_ATTEMPTS {
            warn!(
                event = "recovery_exhausted",
                rebuild_attempts = self.rebuild_attempts,
                "Recovery exhausted; giving up on this connection"
            );
            self.events.emit(
                "recovery_exhausted",
                json!({ "rebuildAttempts": self.rebuild_attempts }),
            );
            let _ = self.commands.send(RecoveryCommand::Failed {
                message: "connection recovery exhausted".to_string(),
            });
            self.phase = Phase::Terminal;
            self.deadline = None;
            return;
        }

        self.rebuild_attempts += 1;
        self.was_recovering = true;
        let backoff = BACKOFF_BASE
            .saturating_mul(1u32 << (self.rebuild_attempts - 1).min(16))
            .min(MAX_BACKOFF);
        info!(
            event = "connection_rebuild_scheduled",
            attempt = self.rebuild_attempts,
            backoff_ms = backoff.as_millis() as u64,
            "Scheduling connection rebuild"
        );
        self.events.emit(
            "connection_rebuild_scheduled",
            json!({
                "attempt": self.rebuild_attempts,
                "backoffMs": backoff.as_millis() as u64,
            }),
        );
        self.phase = Phase::BackoffWait;
        self.deadline = Some(Instant::now() + backoff);
    }

    /// Monitor tick: compare the selected pair against the best pair ever
    /// observed; a materially better path triggers one controlled restart.
    async fn race_probe_tick(&mut self) {
        if self.phase != Phase::Idle
            || !self.is_initiator
            || self.transport.connection_state() != PeerConnectionState::Connected
        {
            return;
        }

        let stats = self.transport.stats().await;
        for rtt in [stats.selected_rtt_ms, stats.best_candidate_rtt_ms]
            .into_iter()
            .flatten()
        {
            self.best_rtt_ms = Some(match self.best_rtt_ms {
                Some(best) => best.min(rtt),
                None => rtt,
            });
        }

        let (Some(selected), Some(best)) = (stats.selected_rtt_ms, self.best_rtt_ms) else {
            return;
        };
        if selected >= HIGH_RTT_MS
            && selected - best >= IMPROVEMENT_THRESHOLD_MS
            && self.probe_attempts < MAX_PROBE_ATTEMPTS
        {
            self.probe_attempts += 1;
            info!(
                event = "race_probe_triggered",
                selected_rtt_ms = selected,
                best_rtt_ms = best,
                "Selected path is pathologically slow; probing for a better pair"
            );
            self.events.emit(
                "race_probe_triggered",
                json!({ "selectedRttMs": selected, "bestRttMs": best }),
            );
            self.next_recovery_step().await;
        }
    }

    fn reset_counters(&mut self) {
        self.restart_ice_attempts = 0;
        self.rebuild_attempts = 0;
    }

    fn publish_snapshot(&self) {
        *self.snapshot.lock().unwrap() = RecoverySnapshot {
            restart_ice_attempts: self.restart_ice_attempts,
            rebuild_attempts: self.rebuild_attempts,
            probe_attempts: self.probe_attempts,
            in_progress: !matches!(self.phase, Phase::Idle | Phase::Terminal),
            terminal: self.phase == Phase::Terminal,
        };
    }
}

/// A sleep that never fires when there is no deadline.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// A watch receiver that never yields; stands in while a dropped transport
/// awaits replacement.
fn pending_watch() -> tokio::sync::watch::Receiver<PeerConnectionState> {
    let (tx, rx) = tokio::sync::watch::channel(PeerConnectionState::Closed);
    // Leak the sender so the channel stays open and silent.
    std::mem::forget(tx);
    rx
}
