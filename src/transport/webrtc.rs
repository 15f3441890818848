//! webrtc-rs implementations of the transport traits.
//!
//! One peer connection, one ordered+reliable data channel labelled
//! "data". Offers and answers travel as JSON-serialized session
//! descriptions; ICE candidates trickle through the session driver as
//! JSON-serialized candidate inits. The advertised maximum message size is
//! injected into the SDP because not every stack volunteers it.

use super::{
    ChannelFrame, ChannelHandle, ChannelState, DataChannel, PeerConnectionState, PeerConnector,
    PeerTransport, SdpKind, TransportStats,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Maximum SCTP message size advertised in the SDP (1 MiB). Some stacks
/// interpret an absent attribute as a 64 KiB default, which would starve
/// the chunk planner.
const SCTP_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// ── Data channel ─────────────────────────────────────────────────────────────

struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    low_notify: Arc<Notify>,
}

impl WebRtcChannel {
    /// Wrap a native channel: wire frame delivery and the low-buffer
    /// notification, and hand back the engine-facing handle.
    fn wrap(dc: Arc<RTCDataChannel>) -> ChannelHandle {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame_tx = frame_tx.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelFrame::Binary(msg.data.to_vec())
                };
                let _ = frame_tx.send(frame);
            })
        }));

        let low_notify = Arc::new(Notify::new());
        {
            let notify = Arc::clone(&low_notify);
            let dc = Arc::clone(&dc);
            tokio::spawn(async move {
                dc.on_buffered_amount_low(Box::new(move || {
                    let notify = Arc::clone(&notify);
                    Box::pin(async move {
                        notify.notify_waiters();
                    })
                }))
                .await;
            });
        }

        let channel = Arc::new(WebRtcChannel {
            label: dc.label().to_string(),
            dc,
            low_notify,
        });
        ChannelHandle {
            channel,
            frames: frame_rx,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting => ChannelState::Connecting,
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn set_low_threshold(&self, bytes: usize) {
        let dc = Arc::clone(&self.dc);
        tokio::spawn(async move {
            dc.set_buffered_amount_low_threshold(bytes).await;
        });
    }

    fn low_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.low_notify)
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(SCTP_MAX_MESSAGE_SIZE)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("data channel '{}' send failed: {e}", self.label))
    }

    async fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.dc
            .send(&Bytes::copy_from_slice(bytes))
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("data channel '{}' send failed: {e}", self.label))
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

// ── Peer transport ───────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    state_tx: watch::Sender<PeerConnectionState>,
    candidates: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// The remote-created channel, delivered by `on_data_channel`.
    incoming_channel: Mutex<Option<mpsc::UnboundedReceiver<ChannelHandle>>>,
}

impl WebRtcTransport {
    async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let (state_tx, _) = watch::channel(PeerConnectionState::New);
        {
            let state_tx = state_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let state_tx = state_tx.clone();
                Box::pin(async move {
                    state_tx.send_replace(map_state(s));
                })
            }));
        }

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = candidate_tx.send(json);
                        }
                        Err(e) => {
                            warn!(event = "candidate_encode_failure", error = %e, "Dropping local candidate");
                        }
                    },
                    Err(e) => {
                        warn!(event = "candidate_convert_failure", error = %e, "Dropping local candidate");
                    }
                }
            })
        }));

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        pc.on_data_channel(Box::new(move |dc| {
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move {
                debug!(event = "remote_data_channel", label = %dc.label(), "Remote channel arrived");
                let _ = incoming_tx.send(WebRtcChannel::wrap(dc));
            })
        }));

        Ok(Arc::new(Self {
            pc,
            state_tx,
            candidates: Mutex::new(Some(candidate_rx)),
            incoming_channel: Mutex::new(Some(incoming_rx)),
        }))
    }

    /// Inject `a=max-message-size` if the stack did not produce one.
    fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
        if !desc.sdp.contains("a=max-message-size:") {
            desc.sdp
                .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
        }
        desc
    }

    async fn local_description_json(&self) -> Result<String> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description set"))?;
        Ok(serde_json::to_string(&Self::inject_max_message_size(
            desc,
        ))?)
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        _ => PeerConnectionState::Closed,
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn connection_state(&self) -> PeerConnectionState {
        *self.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<PeerConnectionState> {
        self.state_tx.subscribe()
    }

    fn supports_ice_restart(&self) -> bool {
        true
    }

    async fn restart_ice(&self) -> Result<()> {
        // webrtc-rs drives ICE restart through the offer options; the
        // caller must follow with `create_offer(true)` and renegotiate.
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description_json().await
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description_json().await
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_str(&sdp)?;
        match (kind, desc.sdp_type) {
            (SdpKind::Offer, webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Offer)
            | (SdpKind::Answer, webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer) => {}
            (expected, got) => {
                return Err(anyhow!("expected {expected:?} SDP, got {got:?}"));
            }
        }
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.candidates.lock().unwrap().take()
    }

    async fn open_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(WebRtcChannel::wrap(dc))
    }

    async fn accept_data_channel(&self) -> Result<ChannelHandle> {
        let mut rx = self
            .incoming_channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("incoming data channel already taken"))?;
        rx.recv()
            .await
            .ok_or_else(|| anyhow!("peer connection dropped before a channel arrived"))
    }

    async fn stats(&self) -> TransportStats {
        let report = self.pc.get_stats().await;
        let mut selected = None;
        let mut best: Option<f64> = None;

        for entry in report.reports.values() {
            if let StatsReportType::CandidatePair(pair) = entry {
                let rtt_ms = pair.current_round_trip_time * 1_000.0;
                if rtt_ms <= 0.0 {
                    continue;
                }
                if pair.nominated {
                    selected = Some(rtt_ms);
                }
                best = Some(match best {
                    Some(current) => current.min(rtt_ms),
                    None => rtt_ms,
                });
            }
        }

        TransportStats {
            selected_rtt_ms: selected,
            best_candidate_rtt_ms: best,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "peer_close_failure", error = %e, "Peer connection close failed");
        }
        self.state_tx.send_replace(PeerConnectionState::Closed);
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

/// [`PeerConnector`] producing webrtc-rs transports with a configurable
/// ICE server set.
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(stun_urls: Vec<String>) -> Self {
        let ice_servers = if stun_urls.is_empty() {
            Self::default_ice_servers()
        } else {
            vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }

    fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            ..Default::default()
        }]
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(self.ice_servers.clone()).await?;
        Ok(transport as Arc<dyn PeerTransport>)
    }
}
