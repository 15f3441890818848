//! In-memory transport: two endpoints wired together in-process.
//!
//! Frames are delivered instantly and in order; `buffered_amount` is an
//! accounting simulation that tests can pin (`set_manual_drain`) and drain
//! by hand, which makes the backpressure paths deterministic. The peer
//! transport half lets session-driver and recovery tests script state
//! changes, ICE restarts, and statistics.

use super::{
    ChannelFrame, ChannelHandle, ChannelState, DataChannel, PeerConnectionState, PeerConnector,
    PeerTransport, SdpKind, TransportStats,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch, Notify};

// ── Memory data channel ──────────────────────────────────────────────────────

/// One endpoint of an in-memory channel pair, with test controls exposed.
pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
    outgoing: mpsc::UnboundedSender<ChannelFrame>,
    peer: Mutex<Weak<MemoryChannel>>,

    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low_notify: Arc<Notify>,

    /// Test control: when set, sends accumulate in `buffered` until the
    /// test calls [`MemoryChannel::drain`].
    manual_drain: AtomicBool,
    /// Test control: swallow low-buffer notifications (exercises the event
    /// watchdog).
    suppress_low_notify: AtomicBool,
    /// Advertised maximum message size, when any.
    max_message_size: Mutex<Option<usize>>,
}

/// A [`MemoryChannel`] endpoint packaged for engine consumption.
pub struct MemoryEndpoint {
    pub channel: Arc<dyn DataChannel>,
    pub raw: Arc<MemoryChannel>,
    pub frames: mpsc::UnboundedReceiver<ChannelFrame>,
}

impl MemoryChannel {
    /// Build a connected pair of endpoints sharing one label.
    pub fn pair(label: &str) -> (MemoryEndpoint, MemoryEndpoint) {
        let (tx_a_to_b, rx_at_b) = mpsc::unbounded_channel();
        let (tx_b_to_a, rx_at_a) = mpsc::unbounded_channel();

        let a = Arc::new(Self::new(label, tx_a_to_b));
        let b = Arc::new(Self::new(label, tx_b_to_a));
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);

        (
            MemoryEndpoint {
                channel: Arc::clone(&a) as Arc<dyn DataChannel>,
                raw: a,
                frames: rx_at_a,
            },
            MemoryEndpoint {
                channel: Arc::clone(&b) as Arc<dyn DataChannel>,
                raw: b,
                frames: rx_at_b,
            },
        )
    }

    fn new(label: &str, outgoing: mpsc::UnboundedSender<ChannelFrame>) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Open),
            outgoing,
            peer: Mutex::new(Weak::new()),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            low_notify: Arc::new(Notify::new()),
            manual_drain: AtomicBool::new(false),
            suppress_low_notify: AtomicBool::new(false),
            max_message_size: Mutex::new(None),
        }
    }

    // ── Test controls ────────────────────────────────────────────────────

    pub fn set_manual_drain(&self, manual: bool) {
        self.manual_drain.store(manual, Ordering::SeqCst);
    }

    pub fn suppress_low_notify(&self, suppress: bool) {
        self.suppress_low_notify.store(suppress, Ordering::SeqCst);
    }

    pub fn set_max_message_size(&self, limit: Option<usize>) {
        *self.max_message_size.lock().unwrap() = limit;
    }

    /// Release `bytes` from the simulated outbound buffer, firing the
    /// low-buffer notification when the threshold is crossed.
    pub fn drain(&self, bytes: usize) {
        let mut current = self.buffered.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.buffered.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    current = next;
                    break;
                }
                Err(observed) => current = observed,
            }
        }
        if current <= self.low_threshold.load(Ordering::SeqCst)
            && !self.suppress_low_notify.load(Ordering::SeqCst)
        {
            self.low_notify.notify_waiters();
        }
    }

    fn push(&self, frame: ChannelFrame) -> Result<()> {
        if *self.state.lock().unwrap() != ChannelState::Open {
            return Err(anyhow!("data channel '{}' is not open", self.label));
        }
        let len = match &frame {
            ChannelFrame::Text(text) => text.len(),
            ChannelFrame::Binary(bytes) => bytes.len(),
        };
        self.outgoing
            .send(frame)
            .map_err(|_| anyhow!("data channel '{}' channel closed", self.label))?;
        if self.manual_drain.load(Ordering::SeqCst) {
            self.buffered.fetch_add(len, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_low_threshold(&self, bytes: usize) {
        self.low_threshold.store(bytes, Ordering::SeqCst);
    }

    fn low_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.low_notify)
    }

    fn max_message_size(&self) -> Option<usize> {
        *self.max_message_size.lock().unwrap()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.push(ChannelFrame::Text(text.to_string()))
    }

    async fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.push(ChannelFrame::Binary(bytes.to_vec()))
    }

    async fn close(&self) {
        *self.state.lock().unwrap() = ChannelState::Closed;
        self.low_notify.notify_waiters();
        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            *peer.state.lock().unwrap() = ChannelState::Closed;
            peer.low_notify.notify_waiters();
        }
    }
}

// ── Memory peer transport ────────────────────────────────────────────────────

/// Scriptable [`PeerTransport`] for session-driver and recovery tests.
pub struct MemoryPeerTransport {
    state_tx: watch::Sender<PeerConnectionState>,
    candidates: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    candidate_tx: mpsc::UnboundedSender<String>,
    stats: Mutex<TransportStats>,
    supports_restart: bool,
    pub restart_ice_calls: AtomicU32,
    pub offers_created: AtomicU32,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    remote_candidates: Mutex<Vec<String>>,
    channel_label: Mutex<Option<String>>,
}

impl MemoryPeerTransport {
    pub fn new(supports_restart: bool) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PeerConnectionState::New);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state_tx,
            candidates: Mutex::new(Some(candidate_rx)),
            candidate_tx,
            stats: Mutex::new(TransportStats::default()),
            supports_restart,
            restart_ice_calls: AtomicU32::new(0),
            offers_created: AtomicU32::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            channel_label: Mutex::new(None),
        })
    }

    // ── Test controls ────────────────────────────────────────────────────

    pub fn set_state(&self, state: PeerConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn emit_candidate(&self, candidate: &str) {
        let _ = self.candidate_tx.send(candidate.to_string());
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for MemoryPeerTransport {
    fn connection_state(&self) -> PeerConnectionState {
        *self.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<PeerConnectionState> {
        self.state_tx.subscribe()
    }

    fn supports_ice_restart(&self) -> bool {
        self.supports_restart
    }

    async fn restart_ice(&self) -> Result<()> {
        if !self.supports_restart {
            return Err(anyhow!("transport does not support ICE restart"));
        }
        self.restart_ice_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("offer:{n}:restart={ice_restart}"))
    }

    async fn create_answer(&self) -> Result<String> {
        Ok("answer:1".to_string())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        self.remote_descriptions.lock().unwrap().push((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<()> {
        if self.remote_descriptions.lock().unwrap().is_empty() {
            return Err(anyhow!("remote description not set"));
        }
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.candidates.lock().unwrap().take()
    }

    async fn open_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        *self.channel_label.lock().unwrap() = Some(label.to_string());
        let (endpoint, _remote) = MemoryChannel::pair(label);
        Ok(ChannelHandle {
            channel: endpoint.channel,
            frames: endpoint.frames,
        })
    }

    async fn accept_data_channel(&self) -> Result<ChannelHandle> {
        let (endpoint, _remote) = MemoryChannel::pair("data");
        Ok(ChannelHandle {
            channel: endpoint.channel,
            frames: endpoint.frames,
        })
    }

    async fn stats(&self) -> TransportStats {
        *self.stats.lock().unwrap()
    }

    async fn close(&self) {
        self.state_tx.send_replace(PeerConnectionState::Closed);
    }
}

// ── Memory connector ─────────────────────────────────────────────────────────

/// [`PeerConnector`] handing out scriptable memory transports, recording
/// every transport it creates so tests can drive them.
#[derive(Default)]
pub struct MemoryConnector {
    created: Mutex<Vec<Arc<MemoryPeerTransport>>>,
    /// When set, freshly created transports report Connected immediately.
    auto_connect: AtomicBool,
}

impl MemoryConnector {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            auto_connect: AtomicBool::new(auto_connect),
        })
    }

    pub fn created(&self) -> Vec<Arc<MemoryPeerTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<MemoryPeerTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>> {
        let transport = MemoryPeerTransport::new(true);
        if self.auto_connect.load(Ordering::SeqCst) {
            transport.set_state(PeerConnectionState::Connected);
        }
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn PeerTransport>)
    }
}
