//! Session driver: role assignment, SDP exchange, candidate handling, and
//! data channel setup over the signalling rendezvous.
//!
//! Rules this driver enforces:
//! - The room creator is the initiator: it sends the first offer, re-offers
//!   after every re-init, and is the only side that drives ICE restarts.
//! - The joiner never offers; it answers and waits for the incoming data
//!   channel.
//! - Remote candidates that arrive before the remote description are
//!   buffered and flushed once `set_remote_description` succeeds.
//!
//! Recovery is delegated to [`RecoveryController`]; this driver executes
//! its commands (renegotiation offers, full rebuilds) because only the
//! driver can reach the signalling link.

use crate::core::events::EventLog;
use crate::core::recovery::{RecoveryCommand, RecoveryController};
use crate::signalling::{SignalKind, SignalLink, SignalMessage};
use crate::transport::{ChannelHandle, PeerConnector, PeerTransport, SdpKind};
use crate::utils::clock::Clock;
use crate::utils::shutdown::Shutdown;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

// ── Events toward the engine ─────────────────────────────────────────────────

/// What the session driver surfaces to the transfer engine and UI shell.
#[derive(Debug)]
pub enum SessionEvent {
    Registered {
        peer_id: String,
        is_initiator: bool,
    },
    PeerJoined {
        remote_peer_id: String,
    },
    PeerLeft {
        remote_peer_id: String,
    },
    /// A fresh data channel (initial connection or after a rebuild). The
    /// engine attaches it and lets auto-resume take over.
    ChannelOpen(ChannelHandle),
    /// Recovery exhausted; the connection is gone.
    ConnectionFailed {
        message: String,
    },
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Spawn the driver task for one room.
pub fn spawn(
    connector: Arc<dyn PeerConnector>,
    link: SignalLink,
    room_id: String,
    clock: Arc<dyn Clock>,
    events: EventLog,
    shutdown: Shutdown,
) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(
        connector, link, room_id, clock, events, shutdown, out_tx,
    ));
    out_rx
}

#[allow(clippy::too_many_arguments)]
async fn run(
    connector: Arc<dyn PeerConnector>,
    mut link: SignalLink,
    room_id: String,
    clock: Arc<dyn Clock>,
    events: EventLog,
    shutdown: Shutdown,
    out_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut peer_id = String::new();
    let mut is_initiator = false;
    let mut remote_peer_id: Option<String> = None;

    let mut transport: Option<Arc<dyn PeerTransport>> = None;
    let mut recovery: Option<RecoveryController> = None;
    let mut recovery_rx: Option<mpsc::UnboundedReceiver<RecoveryCommand>> = None;
    let mut candidate_rx: Option<mpsc::UnboundedReceiver<String>> = None;

    let mut remote_description_set = false;
    let mut buffered_candidates: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                if let Some(t) = transport.take() {
                    t.close().await;
                }
                break;
            }

            message = link.incoming.recv() => {
                let Some(message) = message else { break };
                match message.kind {
                    SignalKind::Register => {
                        peer_id = message
                            .payload
                            .get("peerId")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&message.peer_id)
                            .to_string();
                        is_initiator = message
                            .payload
                            .get("isCreator")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        info!(
                            event = "session_registered",
                            peer_id = %peer_id,
                            is_initiator,
                            "Registered with rendezvous"
                        );
                        let _ = out_tx.send(SessionEvent::Registered {
                            peer_id: peer_id.clone(),
                            is_initiator,
                        });
                    }

                    SignalKind::PeerJoined => {
                        remote_peer_id = Some(message.peer_id.clone());
                        let _ = out_tx.send(SessionEvent::PeerJoined {
                            remote_peer_id: message.peer_id.clone(),
                        });
                        if is_initiator {
                            // A re-join while a connection exists is a
                            // reload on the far side: rebuild from scratch.
                            if let Some(old) = transport.take() {
                                old.close().await;
                            }
                            match connect_as_initiator(
                                &connector,
                                &mut transport,
                                &mut recovery,
                                &mut recovery_rx,
                                &mut candidate_rx,
                                &events,
                                &shutdown,
                                &out_tx,
                            )
                            .await
                            {
                                Ok(offer_sdp) => {
                                    remote_description_set = false;
                                    buffered_candidates.clear();
                                    send_signal(
                                        &link.outgoing,
                                        &clock,
                                        SignalKind::Offer,
                                        &room_id,
                                        &peer_id,
                                        remote_peer_id.clone(),
                                        json!({"sdp": offer_sdp}),
                                    );
                                }
                                Err(e) => {
                                    warn!(event = "session_connect_failure", error = %e, "Failed to start connection");
                                }
                            }
                        }
                    }

                    SignalKind::Offer => {
                        if is_initiator {
                            // Only the joiner answers.
                            continue;
                        }
                        remote_peer_id = Some(message.peer_id.clone());
                        let sdp = message
                            .payload
                            .get("sdp")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let ice_restart = message
                            .payload
                            .get("iceRestart")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        match accept_offer(
                            &connector,
                            &mut transport,
                            &mut recovery,
                            &mut recovery_rx,
                            &mut candidate_rx,
                            &events,
                            &shutdown,
                            &out_tx,
                            sdp,
                            ice_restart,
                            &mut remote_description_set,
                            &mut buffered_candidates,
                        )
                        .await
                        {
                            Ok(answer_sdp) => {
                                send_signal(
                                    &link.outgoing,
                                    &clock,
                                    SignalKind::Answer,
                                    &room_id,
                                    &peer_id,
                                    remote_peer_id.clone(),
                                    json!({"sdp": answer_sdp}),
                                );
                            }
                            Err(e) => {
                                warn!(event = "session_answer_failure", error = %e, "Failed to answer offer");
                            }
                        }
                    }

                    SignalKind::Answer => {
                        let Some(t) = transport.as_ref() else { continue };
                        let sdp = message
                            .payload
                            .get("sdp")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        match t.set_remote_description(SdpKind::Answer, sdp).await {
                            Ok(()) => {
                                remote_description_set = true;
                                flush_candidates(t, &mut buffered_candidates).await;
                            }
                            Err(e) => {
                                warn!(event = "session_set_answer_failure", error = %e, "Failed to apply answer");
                            }
                        }
                    }

                    SignalKind::IceCandidate => {
                        let candidate = message
                            .payload
                            .get("candidate")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if candidate.is_empty() {
                            continue;
                        }
                        match (transport.as_ref(), remote_description_set) {
                            (Some(t), true) => {
                                if let Err(e) = t.add_ice_candidate(candidate).await {
                                    warn!(event = "session_candidate_failure", error = %e, "Failed to add remote candidate");
                                }
                            }
                            // Candidates can outrun the SDP exchange.
                            _ => buffered_candidates.push(candidate),
                        }
                    }

                    SignalKind::PeerLeft => {
                        let _ = out_tx.send(SessionEvent::PeerLeft {
                            remote_peer_id: message.peer_id.clone(),
                        });
                        // The transport notices on its own; recovery owns
                        // the response.
                    }

                    SignalKind::Error => {
                        warn!(
                            event = "signalling_error",
                            payload = %message.payload,
                            "Rendezvous reported an error"
                        );
                    }
                }
            }

            command = recv_or_pending(&mut recovery_rx) => {
                match command {
                    RecoveryCommand::Renegotiate => {
                        let Some(t) = transport.as_ref() else { continue };
                        match t.create_offer(true).await {
                            Ok(offer_sdp) => {
                                remote_description_set = false;
                                send_signal(
                                    &link.outgoing,
                                    &clock,
                                    SignalKind::Offer,
                                    &room_id,
                                    &peer_id,
                                    remote_peer_id.clone(),
                                    json!({"sdp": offer_sdp, "iceRestart": true}),
                                );
                            }
                            Err(e) => {
                                warn!(event = "session_renegotiate_failure", error = %e, "ICE-restart offer failed");
                            }
                        }
                    }

                    RecoveryCommand::Rebuild => {
                        if let Some(old) = transport.take() {
                            old.close().await;
                        }
                        remote_description_set = false;
                        buffered_candidates.clear();
                        if is_initiator {
                            match connect_as_initiator(
                                &connector,
                                &mut transport,
                                &mut recovery,
                                &mut recovery_rx,
                                &mut candidate_rx,
                                &events,
                                &shutdown,
                                &out_tx,
                            )
                            .await
                            {
                                Ok(offer_sdp) => {
                                    send_signal(
                                        &link.outgoing,
                                        &clock,
                                        SignalKind::Offer,
                                        &room_id,
                                        &peer_id,
                                        remote_peer_id.clone(),
                                        json!({"sdp": offer_sdp}),
                                    );
                                }
                                Err(e) => {
                                    warn!(event = "session_rebuild_failure", error = %e, "Rebuild failed");
                                }
                            }
                        }
                        // The joiner waits for the initiator's fresh offer.
                    }

                    RecoveryCommand::Failed { message } => {
                        let _ = out_tx.send(SessionEvent::ConnectionFailed { message });
                    }
                }
            }

            candidate = recv_or_pending(&mut candidate_rx) => {
                send_signal(
                    &link.outgoing,
                    &clock,
                    SignalKind::IceCandidate,
                    &room_id,
                    &peer_id,
                    remote_peer_id.clone(),
                    json!({"candidate": candidate}),
                );
            }
        }
    }
}

// ── Connection setup helpers ─────────────────────────────────────────────────

/// Initiator path: new transport, recovery hookup, data channel, offer SDP.
#[allow(clippy::too_many_arguments)]
async fn connect_as_initiator(
    connector: &Arc<dyn PeerConnector>,
    transport: &mut Option<Arc<dyn PeerTransport>>,
    recovery: &mut Option<RecoveryController>,
    recovery_rx: &mut Option<mpsc::UnboundedReceiver<RecoveryCommand>>,
    candidate_rx: &mut Option<mpsc::UnboundedReceiver<String>>,
    events: &EventLog,
    shutdown: &Shutdown,
    out_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<String> {
    let fresh = connector.create().await?;
    hook_recovery(&fresh, true, recovery, recovery_rx, events, shutdown);
    *candidate_rx = fresh.take_local_candidates();

    let handle = fresh.open_data_channel("data").await?;
    let _ = out_tx.send(SessionEvent::ChannelOpen(handle));

    let offer_sdp = fresh.create_offer(false).await?;
    *transport = Some(fresh);
    Ok(offer_sdp)
}

/// Joiner path: transport on demand, apply the offer, answer SDP, wait for
/// the initiator's channel in the background.
#[allow(clippy::too_many_arguments)]
async fn accept_offer(
    connector: &Arc<dyn PeerConnector>,
    transport: &mut Option<Arc<dyn PeerTransport>>,
    recovery: &mut Option<RecoveryController>,
    recovery_rx: &mut Option<mpsc::UnboundedReceiver<RecoveryCommand>>,
    candidate_rx: &mut Option<mpsc::UnboundedReceiver<String>>,
    events: &EventLog,
    shutdown: &Shutdown,
    out_tx: &mpsc::UnboundedSender<SessionEvent>,
    offer_sdp: String,
    ice_restart: bool,
    remote_description_set: &mut bool,
    buffered_candidates: &mut Vec<String>,
) -> Result<String> {
    // An ICE-restart offer renegotiates the existing transport; any other
    // offer (initial connection, post-rebuild) gets a fresh one.
    let reuse = ice_restart && transport.is_some();
    if !reuse {
        if let Some(old) = transport.take() {
            old.close().await;
        }
        let fresh = connector.create().await?;
        hook_recovery(&fresh, false, recovery, recovery_rx, events, shutdown);
        *candidate_rx = fresh.take_local_candidates();

        let accept = Arc::clone(&fresh);
        let out = out_tx.clone();
        tokio::spawn(async move {
            match accept.accept_data_channel().await {
                Ok(handle) => {
                    let _ = out.send(SessionEvent::ChannelOpen(handle));
                }
                Err(e) => {
                    warn!(event = "session_accept_channel_failure", error = %e, "Incoming data channel never arrived");
                }
            }
        });
        *transport = Some(fresh);
    }

    let Some(t) = transport.as_ref() else {
        return Err(anyhow!("transport missing after offer setup"));
    };
    t.set_remote_description(SdpKind::Offer, offer_sdp).await?;
    *remote_description_set = true;
    flush_candidates(t, buffered_candidates).await;
    t.create_answer().await
}

fn hook_recovery(
    transport: &Arc<dyn PeerTransport>,
    is_initiator: bool,
    recovery: &mut Option<RecoveryController>,
    recovery_rx: &mut Option<mpsc::UnboundedReceiver<RecoveryCommand>>,
    events: &EventLog,
    shutdown: &Shutdown,
) {
    match recovery {
        Some(controller) => controller.replace_transport(Arc::clone(transport)),
        None => {
            let (controller, rx) = RecoveryController::spawn(
                Arc::clone(transport),
                is_initiator,
                events.clone(),
                shutdown.clone(),
            );
            *recovery = Some(controller);
            *recovery_rx = Some(rx);
        }
    }
}

async fn flush_candidates(transport: &Arc<dyn PeerTransport>, buffered: &mut Vec<String>) {
    for candidate in buffered.drain(..) {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!(event = "session_candidate_flush_failure", error = %e, "Buffered candidate rejected");
        }
    }
}

fn send_signal(
    outgoing: &tokio::sync::mpsc::UnboundedSender<SignalMessage>,
    clock: &Arc<dyn Clock>,
    kind: SignalKind,
    room_id: &str,
    peer_id: &str,
    target_id: Option<String>,
    payload: serde_json::Value,
) {
    let mut message = SignalMessage::new(kind, room_id, peer_id, payload, clock.now_ms());
    message.target_id = target_id;
    let _ = outgoing.send(message);
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> T {
    match rx {
        Some(inner) => match inner.recv().await {
            Some(value) => value,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalling::memory::MemoryRendezvous;
    use crate::transport::memory::MemoryConnector;
    use crate::utils::clock::ManualClock;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session driver ended")
    }

    fn spawn_driver(
        hub: &MemoryRendezvous,
        room: &str,
        peer: &str,
        connector: Arc<MemoryConnector>,
        shutdown: &Shutdown,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        let clock = ManualClock::new(0);
        spawn(
            connector as Arc<dyn PeerConnector>,
            hub.connect(room, peer),
            room.to_string(),
            clock,
            EventLog::new(ManualClock::new(0)),
            shutdown.clone(),
        )
    }

    #[tokio::test]
    async fn creator_offers_and_joiner_answers() {
        let hub = MemoryRendezvous::new();
        let shutdown = Shutdown::new();
        let creator_connector = MemoryConnector::new(true);
        let joiner_connector = MemoryConnector::new(true);

        let mut creator_rx = spawn_driver(
            &hub,
            "room-1",
            "peer-a",
            Arc::clone(&creator_connector),
            &shutdown,
        );
        match next_event(&mut creator_rx).await {
            SessionEvent::Registered { is_initiator, .. } => assert!(is_initiator),
            other => panic!("expected Registered, got {other:?}"),
        }

        let mut joiner_rx = spawn_driver(
            &hub,
            "room-1",
            "peer-b",
            Arc::clone(&joiner_connector),
            &shutdown,
        );
        match next_event(&mut joiner_rx).await {
            SessionEvent::Registered { is_initiator, .. } => assert!(!is_initiator),
            other => panic!("expected Registered, got {other:?}"),
        }

        // Creator: peer joined, then its channel opens.
        match next_event(&mut creator_rx).await {
            SessionEvent::PeerJoined { remote_peer_id } => assert_eq!(remote_peer_id, "peer-b"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut creator_rx).await,
            SessionEvent::ChannelOpen(_)
        ));

        // Joiner: learns about the creator, receives the offer, opens its
        // channel, and the creator's transport ends up with the answer.
        match next_event(&mut joiner_rx).await {
            SessionEvent::PeerJoined { remote_peer_id } => assert_eq!(remote_peer_id, "peer-a"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut joiner_rx).await,
            SessionEvent::ChannelOpen(_)
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let joiner_transport = joiner_connector.latest().unwrap();
        let applied = joiner_transport.remote_descriptions();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, SdpKind::Offer);

        let creator_transport = creator_connector.latest().unwrap();
        let applied = creator_transport.remote_descriptions();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, SdpKind::Answer);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn candidates_flow_to_the_remote_transport() {
        let hub = MemoryRendezvous::new();
        let shutdown = Shutdown::new();
        let creator_connector = MemoryConnector::new(true);
        let joiner_connector = MemoryConnector::new(true);

        let mut creator_rx = spawn_driver(
            &hub,
            "room-1",
            "peer-a",
            Arc::clone(&creator_connector),
            &shutdown,
        );
        next_event(&mut creator_rx).await; // Registered

        let mut joiner_rx = spawn_driver(
            &hub,
            "room-1",
            "peer-b",
            Arc::clone(&joiner_connector),
            &shutdown,
        );
        next_event(&mut joiner_rx).await; // Registered

        // Let the offer/answer dance finish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The joiner's transport emits a local candidate; it reaches the
        // creator only after the answer set the remote description, so it
        // must be applied, not dropped.
        joiner_connector.latest().unwrap().emit_candidate("cand-1");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let creator_transport = creator_connector.latest().unwrap();
        assert_eq!(creator_transport.remote_candidates(), vec!["cand-1".to_string()]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn ice_restart_offer_reuses_the_transport() {
        let hub = MemoryRendezvous::new();
        let shutdown = Shutdown::new();
        let joiner_connector = MemoryConnector::new(true);

        // Scripted creator: a raw link standing in for the initiator, so
        // the test controls exactly which offers the joiner sees.
        let creator = hub.connect("room-1", "peer-a");
        let mut joiner_rx = spawn_driver(
            &hub,
            "room-1",
            "peer-b",
            Arc::clone(&joiner_connector),
            &shutdown,
        );
        next_event(&mut joiner_rx).await; // Registered
        next_event(&mut joiner_rx).await; // PeerJoined

        let offer = |payload: serde_json::Value| {
            SignalMessage::new(SignalKind::Offer, "room-1", "peer-a", payload, 0)
        };

        // Initial offer: a fresh transport answers it.
        creator
            .outgoing
            .send(offer(json!({"sdp": "offer-initial"})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(joiner_connector.created().len(), 1);

        // ICE-restart offer: the same transport renegotiates in place.
        creator
            .outgoing
            .send(offer(json!({"sdp": "offer-restarted", "iceRestart": true})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(joiner_connector.created().len(), 1);

        let transport = joiner_connector.latest().unwrap();
        let applied = transport.remote_descriptions();
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|(kind, _)| *kind == SdpKind::Offer));
        assert_eq!(applied[1].1, "offer-restarted");

        // A plain offer after that (post-rebuild shape) replaces the
        // transport instead.
        creator
            .outgoing
            .send(offer(json!({"sdp": "offer-rebuilt"})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(joiner_connector.created().len(), 2);

        shutdown.cancel();
    }
}
