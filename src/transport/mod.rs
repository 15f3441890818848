//! Peer transport abstraction.
//!
//! The engine never touches webrtc-rs types directly: it talks to
//! [`DataChannel`] (one ordered, reliable, message-oriented channel with an
//! observable outbound buffer) and [`PeerTransport`] (the connection those
//! channels ride on: SDP exchange, ICE restart, statistics). The
//! production implementation wraps webrtc-rs; [`memory`] wires two
//! endpoints together in-process for tests.

pub mod memory;
pub mod webrtc;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

// ── States ───────────────────────────────────────────────────────────────────

/// Data channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Peer connection lifecycle, mirrored from the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Which half of the SDP exchange a remote description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// One incoming message. Control messages are string frames; chunk payloads
/// are binary frames; the receiver dispatches on this distinction alone.
#[derive(Debug, Clone)]
pub enum ChannelFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// A channel plus the stream of frames arriving on it.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub frames: mpsc::UnboundedReceiver<ChannelFrame>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel.label())
            .finish_non_exhaustive()
    }
}

// ── Statistics ───────────────────────────────────────────────────────────────

/// Path statistics sampled from the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// RTT of the currently selected candidate pair, when measured.
    pub selected_rtt_ms: Option<f64>,
    /// Best RTT observed across all candidate pairs.
    pub best_candidate_rtt_ms: Option<f64>,
}

// ── Data channel ─────────────────────────────────────────────────────────────

/// An ordered, reliable, message-oriented channel with observable
/// backpressure.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Threshold below which the low-buffer notification fires.
    fn set_low_threshold(&self, bytes: usize);

    /// Notified each time `buffered_amount` crosses below the low
    /// threshold. Shared: one notify per channel, any number of waiters.
    fn low_notify(&self) -> Arc<Notify>;

    /// The transport's maximum message size, when it advertises one.
    fn max_message_size(&self) -> Option<usize>;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_binary(&self, bytes: &[u8]) -> Result<()>;

    async fn close(&self);
}

// ── Peer transport ───────────────────────────────────────────────────────────

/// The peer connection underneath the data channel.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn connection_state(&self) -> PeerConnectionState;

    /// Watch stream of connection state changes. Each subscriber gets the
    /// current value immediately.
    fn state_changes(&self) -> watch::Receiver<PeerConnectionState>;

    fn supports_ice_restart(&self) -> bool;

    /// Kick the ICE layer into gathering a fresh candidate set. The caller
    /// must follow up with an explicit renegotiation offer. This
    /// transport layer never relies on a renegotiation-needed event.
    async fn restart_ice(&self) -> Result<()>;

    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: String) -> Result<()>;

    /// Stream of locally gathered ICE candidates, taken once by the
    /// session driver and forwarded over signalling.
    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// Create the data channel (initiator side).
    async fn open_data_channel(&self, label: &str) -> Result<ChannelHandle>;

    /// Wait for the remote's data channel (joiner side).
    async fn accept_data_channel(&self) -> Result<ChannelHandle>;

    async fn stats(&self) -> TransportStats;

    async fn close(&self);
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Factory for peer transports. The session driver goes through this for
/// the initial connection and again on every full rebuild.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>>;
}
