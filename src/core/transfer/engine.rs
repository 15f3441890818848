//! Transfer engine: shared state, frame dispatch, send queue, teardown.
//!
//! One engine per page/peer-connection pair. The session driver hands it
//! data channels (`attach_channel`) as they open, initially and after
//! every recovery rebuild, and the engine routes incoming frames:
//! string frames to the control handlers, binary frames to the per-file
//! write queue of the transfer currently being received.
//!
//! All maps key on `upload_id`; the persistent store remains the source of
//! truth for resume, runtime state is disposable.

use crate::core::backpressure::BackpressureArbiter;
use crate::core::config::EngineConfig;
use crate::core::events::EventLog;
use crate::core::finalizer::{AssembledFile, Finalizer};
use crate::core::planner::RttCache;
use crate::core::queue::{reduce, SendQueueAction, SendQueueState};
use crate::core::store::{SessionStatus, TransferStore};
use crate::core::transfer::receiver::{self, IncomingTransfer, WriteJob};
use crate::core::transfer::sender;
use crate::core::transfer::source::SendFile;
use crate::core::transfer::{
    parse_control, ControlMessage, ErrorCode, FileMetadata, ParsedControl, TransferError,
};
use crate::transport::{ChannelFrame, ChannelHandle, ChannelState, DataChannel, PeerTransport};
use crate::utils::clock::Clock;
use crate::utils::shutdown::Shutdown;
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── App-facing events ────────────────────────────────────────────────────────

/// Everything the engine surfaces to the UI shell.
#[derive(Debug)]
pub enum EngineEvent {
    /// The remote offered a file; receiving starts immediately.
    OfferReceived { metadata: FileMetadata },
    SendProgress {
        upload_id: String,
        name: String,
        sent_bytes: u64,
        total_bytes: u64,
        percent: u8,
    },
    ReceiveProgress {
        upload_id: String,
        name: String,
        received_bytes: u64,
        total_bytes: u64,
        percent: u8,
    },
    /// A file arrived intact.
    FileReceived {
        upload_id: String,
        name: String,
        file: AssembledFile,
        checksum: String,
    },
    /// A transfer died with a machine code.
    TransferFailed {
        upload_id: String,
        code: ErrorCode,
        message: String,
    },
    /// The send queue changed; poll `queue_state()` for the new revision.
    QueueChanged { revision: u64 },
}

// ── Runtime state (send side) ────────────────────────────────────────────────

/// Kept per `upload_id` for as long as the peer connection lives, so a
/// `request-retransmit` can be served without reloading the file.
pub(crate) struct OutgoingRuntimeSession {
    pub file: Arc<SendFile>,
    pub metadata: FileMetadata,
    pub chunk_checksums: Vec<Option<String>>,
    pub file_checksum: Option<String>,
    pub status: SessionStatus,
    pub fingerprint: String,
    pub attempt_count: u32,
    /// Source mtime captured at offer time; completion re-checks it.
    pub offered_last_modified: u64,
}

/// Outcome delivered to a sender waiting on `receiver-ready`.
pub(crate) type ReadySignal = Result<f64, TransferError>;

// ── Shared engine state ──────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn TransferStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventLog,
    pub(crate) finalizer: Arc<Finalizer>,
    pub(crate) shutdown: Shutdown,
    pub(crate) app_tx: mpsc::UnboundedSender<EngineEvent>,

    pub(crate) channel: RwLock<Option<Arc<dyn DataChannel>>>,
    pub(crate) arbiter: RwLock<Option<Arc<BackpressureArbiter>>>,
    pub(crate) transport: RwLock<Option<Arc<dyn PeerTransport>>>,
    pub(crate) rtt_cache: Mutex<RttCache>,
    pub(crate) remote_peer_id: RwLock<Option<String>>,

    /// Active incoming transfers by upload id.
    pub(crate) incoming: Mutex<HashMap<String, IncomingTransfer>>,
    /// Binary frames route to this upload id (set by the latest offer).
    pub(crate) current_receiving: Mutex<Option<String>>,

    /// Senders parked on `receiver-ready`.
    pub(crate) pending_ready: Mutex<HashMap<String, oneshot::Sender<ReadySignal>>>,
    pub(crate) runtime_sessions: Mutex<HashMap<String, OutgoingRuntimeSession>>,

    dispatch_task: Mutex<Option<JoinHandle<()>>>,

    queue: Mutex<SendQueueState>,
    queue_notify: Notify,
    /// Queue item currently being sent, for progress fan-in.
    pub(crate) active_queue_item: Mutex<Option<Uuid>>,
}

impl Shared {
    /// The attached channel, if it is usable.
    pub(crate) fn current_channel(&self) -> Result<Arc<dyn DataChannel>> {
        let guard = self.channel.read().unwrap();
        match guard.as_ref() {
            Some(channel) if channel.state() == ChannelState::Open => Ok(Arc::clone(channel)),
            Some(channel) => Err(TransferError::new(
                ErrorCode::DataChannelNotReady,
                format!("data channel is {:?}", channel.state()),
            )
            .into()),
            None => Err(TransferError::new(
                ErrorCode::DataChannelNotReady,
                "no data channel attached",
            )
            .into()),
        }
    }

    pub(crate) fn current_arbiter(&self) -> Option<Arc<BackpressureArbiter>> {
        self.arbiter.read().unwrap().clone()
    }

    pub(crate) async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let channel = self.current_channel()?;
        let text = serde_json::to_string(message)?;
        channel.send_text(&text).await.map_err(|e| {
            TransferError::new(
                ErrorCode::DataChannelSendFailed,
                format!("control send failed: {e}"),
            )
            .into()
        })
    }

    /// Best-effort `transfer-error` toward the peer.
    pub(crate) async fn send_wire_error(&self, file_id: &str, error: &TransferError) {
        let message = ControlMessage::TransferError {
            file_id: file_id.to_string(),
            error: error.to_wire(),
        };
        if let Err(e) = self.send_control(&message).await {
            debug!(event = "transfer_error_send_failed", error = %e, "Could not notify peer");
        }
    }

    pub(crate) fn emit_app(&self, event: EngineEvent) {
        let _ = self.app_tx.send(event);
    }

    pub(crate) fn fail_transfer(&self, upload_id: &str, code: ErrorCode, message: &str) {
        warn!(
            event = "transfer_failed",
            upload_id = %upload_id,
            code = code.as_str(),
            message,
            "Transfer failed"
        );
        self.events.emit(
            "transfer_failed",
            json!({ "uploadId": upload_id, "code": code.as_str(), "message": message }),
        );
        self.emit_app(EngineEvent::TransferFailed {
            upload_id: upload_id.to_string(),
            code,
            message: message.to_string(),
        });
    }

    // ── Queue plumbing ───────────────────────────────────────────────────

    pub(crate) fn dispatch_queue(&self, action: SendQueueAction) {
        let revision = {
            let mut queue = self.queue.lock().unwrap();
            let next = reduce(&queue, action, self.clock.now_ms());
            let changed = next.revision != queue.revision;
            *queue = next;
            changed.then_some(queue.revision)
        };
        if let Some(revision) = revision {
            self.emit_app(EngineEvent::QueueChanged { revision });
            self.queue_notify.notify_one();
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// The client-side transfer engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TransferEngine {
    pub(crate) shared: Arc<Shared>,
}

impl TransferEngine {
    /// Build an engine and the stream of app events it emits.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TransferStore>,
        clock: Arc<dyn Clock>,
        finalizer: Finalizer,
        events: EventLog,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let rtt_cache = RttCache::new(config.force_rtt_ms);
        let shared = Arc::new(Shared {
            config,
            store,
            clock,
            events,
            finalizer: Arc::new(finalizer),
            shutdown: Shutdown::new(),
            app_tx,
            channel: RwLock::new(None),
            arbiter: RwLock::new(None),
            transport: RwLock::new(None),
            rtt_cache: Mutex::new(rtt_cache),
            remote_peer_id: RwLock::new(None),
            incoming: Mutex::new(HashMap::new()),
            current_receiving: Mutex::new(None),
            pending_ready: Mutex::new(HashMap::new()),
            runtime_sessions: Mutex::new(HashMap::new()),
            dispatch_task: Mutex::new(None),
            queue: Mutex::new(SendQueueState::default()),
            queue_notify: Notify::new(),
            active_queue_item: Mutex::new(None),
        });

        let engine = Self { shared };
        engine.spawn_queue_worker();
        engine.spawn_store_pruning();
        (engine, app_rx)
    }

    /// Read access to the structured event stream (tests, reports).
    pub fn event_log(&self) -> &EventLog {
        &self.shared.events
    }

    /// Record the remote peer's id (from the session driver) for session
    /// affinity in resume matching.
    pub fn set_remote_peer(&self, peer_id: &str) {
        *self.shared.remote_peer_id.write().unwrap() = Some(peer_id.to_string());
    }

    /// Hand the engine the peer transport, for RTT statistics.
    pub fn attach_transport(&self, transport: Arc<dyn PeerTransport>) {
        *self.shared.transport.write().unwrap() = Some(transport);
    }

    /// Attach a fresh data channel (initial connection or post-rebuild).
    /// Replaces any previous channel; the backpressure arbiter restarts
    /// with it, since its fallback latch is per-connection.
    pub fn attach_channel(&self, handle: ChannelHandle) {
        let ChannelHandle { channel, frames } = handle;

        let arbiter = Arc::new(BackpressureArbiter::new(
            &self.shared.config,
            self.shared.events.clone(),
        ));
        channel.set_low_threshold(self.shared.config.low_threshold);

        *self.shared.channel.write().unwrap() = Some(Arc::clone(&channel));
        *self.shared.arbiter.write().unwrap() = Some(arbiter);

        info!(
            event = "data_channel_attached",
            label = %channel.label(),
            "Data channel attached to engine"
        );

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(dispatch_loop(shared, frames));
        if let Some(previous) = self.shared.dispatch_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    // ── Send queue API ───────────────────────────────────────────────────

    /// Queue a file; it is sent when it reaches the head of the queue.
    pub fn enqueue(&self, file: Arc<SendFile>) -> Uuid {
        let id = Uuid::new_v4();
        self.shared
            .dispatch_queue(SendQueueAction::Enqueue { id, file });
        id
    }

    pub fn retry(&self, id: Uuid) {
        self.shared.dispatch_queue(SendQueueAction::Retry { id });
    }

    pub fn remove(&self, id: Uuid) {
        self.shared.dispatch_queue(SendQueueAction::Remove { id });
    }

    pub fn clear_completed(&self) {
        self.shared.dispatch_queue(SendQueueAction::ClearCompleted);
    }

    pub fn queue_state(&self) -> SendQueueState {
        self.shared.queue.lock().unwrap().clone()
    }

    /// Send one file end to end (offer, stream, complete), with
    /// auto-resume across interruptions. Most callers go through
    /// [`TransferEngine::enqueue`]; this is the direct path.
    pub async fn send_file(&self, file: Arc<SendFile>) -> Result<String> {
        sender::send_file(&self.shared, file).await
    }

    /// Tear down runtime state: cancel timers and write queues, close the
    /// channel and transport, clear maps. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.shutdown.cancel();

        if let Some(task) = self.shared.dispatch_task.lock().unwrap().take() {
            task.abort();
        }

        let channel = self.shared.channel.write().unwrap().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        let transport = self.shared.transport.write().unwrap().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        self.shared.arbiter.write().unwrap().take();
        self.shared.pending_ready.lock().unwrap().clear();
        self.shared.runtime_sessions.lock().unwrap().clear();
        self.shared.current_receiving.lock().unwrap().take();

        let incoming: Vec<IncomingTransfer> = {
            let mut map = self.shared.incoming.lock().unwrap();
            map.drain().map(|(_, transfer)| transfer).collect()
        };
        for transfer in incoming {
            transfer.task.abort();
        }

        info!(event = "engine_disconnected", "Engine torn down");
    }

    // ── Background workers ───────────────────────────────────────────────

    fn spawn_queue_worker(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let next = {
                    let queue = shared.queue.lock().unwrap();
                    if queue.sending().is_some() {
                        None
                    } else {
                        queue.next_queued().map(|item| (item.id, Arc::clone(&item.file)))
                    }
                };

                match next {
                    Some((id, file)) => {
                        shared.dispatch_queue(SendQueueAction::MarkSending { id });
                        *shared.active_queue_item.lock().unwrap() = Some(id);

                        let result = sender::send_file(&shared, file).await;

                        *shared.active_queue_item.lock().unwrap() = None;
                        match result {
                            Ok(_) => {
                                shared.dispatch_queue(SendQueueAction::MarkCompleted { id });
                            }
                            Err(e) => {
                                let code = crate::core::transfer::error_code(&e)
                                    .map(|c| c.as_str().to_string())
                                    .unwrap_or_else(|| format!("{e:#}"));
                                shared.dispatch_queue(SendQueueAction::MarkFailed {
                                    id,
                                    error: code,
                                });
                            }
                        }
                    }
                    None => {
                        if shared.shutdown.select(shared.queue_notify.notified()).await.is_none() {
                            break;
                        }
                    }
                }
                if shared.shutdown.cancelled() {
                    break;
                }
            }
        });
    }

    /// One pruning pass per engine lifetime, like a page load would do.
    fn spawn_store_pruning(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let now = shared.clock.now_ms();
            match shared
                .store
                .prune_stale_sessions(now, shared.config.session_ttl.as_millis() as u64)
                .await
            {
                Ok(0) => {}
                Ok(removed) => {
                    info!(event = "stale_sessions_pruned", removed, "Pruned stale sessions");
                }
                Err(e) => {
                    warn!(event = "session_prune_failure", error = %e, "Failed to prune sessions");
                }
            }
        });
    }
}

// ── Frame dispatch ───────────────────────────────────────────────────────────

async fn dispatch_loop(shared: Arc<Shared>, mut frames: mpsc::UnboundedReceiver<ChannelFrame>) {
    loop {
        let frame = match shared.shutdown.select(frames.recv()).await {
            Some(Some(frame)) => frame,
            // Channel gone or engine shutting down.
            _ => break,
        };

        match frame {
            ChannelFrame::Text(text) => handle_control_frame(&shared, &text).await,
            ChannelFrame::Binary(bytes) => handle_chunk_frame(&shared, bytes).await,
        }
    }
    debug!(event = "dispatch_loop_ended", "Frame dispatch ended");
}

async fn handle_control_frame(shared: &Arc<Shared>, text: &str) {
    let message = match parse_control(text) {
        ParsedControl::Message(message) => *message,
        ParsedControl::UnknownType(kind) => {
            shared.events.emit(
                "transfer_control_message_parse_error",
                json!({ "reason": "unknown_type", "type": kind }),
            );
            return;
        }
        ParsedControl::Malformed(detail) => {
            shared.events.emit(
                "transfer_control_message_parse_error",
                json!({ "reason": "malformed", "detail": detail }),
            );
            return;
        }
    };

    match message {
        ControlMessage::FileOffer { metadata } => {
            receiver::handle_file_offer(shared, metadata).await;
        }

        ControlMessage::ReceiverReady {
            upload_id,
            resume_from_chunk,
            ..
        } => {
            let waiter = shared.pending_ready.lock().unwrap().remove(&upload_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(resume_from_chunk));
                }
                None => {
                    debug!(
                        event = "receiver_ready_unmatched",
                        upload_id = %upload_id,
                        "receiver-ready with no waiting offer"
                    );
                }
            }
        }

        ControlMessage::TransferComplete {
            upload_id,
            checksum,
            ..
        } => {
            let write_tx = {
                let map = shared.incoming.lock().unwrap();
                map.get(&upload_id).map(|t| t.write_tx.clone())
            };
            match write_tx {
                Some(tx) => {
                    if tx.send(WriteJob::Complete { checksum }).await.is_err() {
                        warn!(
                            event = "transfer_complete_dropped",
                            upload_id = %upload_id,
                            "Write queue already gone"
                        );
                    }
                }
                None => {
                    shared.fail_transfer(
                        &upload_id,
                        ErrorCode::InvalidFileId,
                        "transfer-complete for unknown upload",
                    );
                }
            }
        }

        ControlMessage::RequestRetransmit {
            upload_id,
            from_chunk,
            reason,
            ..
        } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                sender::serve_retransmit(&shared, &upload_id, from_chunk, &reason).await;
            });
        }

        ControlMessage::TransferError { file_id, error } => {
            warn!(
                event = "transfer_error_received",
                upload_id = %file_id,
                code = %error.code,
                message = %error.message,
                "Peer reported a transfer error"
            );
            // A parked sender gets the failure; otherwise surface it.
            let waiter = shared.pending_ready.lock().unwrap().remove(&file_id);
            let transfer_error = TransferError::new(
                wire_code(&error.code),
                format!("peer: {}", error.message),
            );
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Err(transfer_error));
                }
                None => {
                    shared.fail_transfer(&file_id, transfer_error.code, &transfer_error.message);
                }
            }
        }
    }
}

async fn handle_chunk_frame(shared: &Arc<Shared>, bytes: Vec<u8>) {
    let target = shared.current_receiving.lock().unwrap().clone();
    let Some(upload_id) = target else {
        shared.events.emit(
            "transfer_chunk_without_offer",
            json!({ "bytes": bytes.len() }),
        );
        return;
    };

    let write_tx = {
        let map = shared.incoming.lock().unwrap();
        map.get(&upload_id).map(|t| t.write_tx.clone())
    };
    if let Some(tx) = write_tx {
        // Bounded queue: this await is the receive-side backpressure.
        if tx.send(WriteJob::Chunk(bytes)).await.is_err() {
            debug!(
                event = "chunk_after_writer_end",
                upload_id = %upload_id,
                "Chunk arrived after the write queue closed"
            );
        }
    }
}

fn wire_code(code: &str) -> ErrorCode {
    match code {
        "TRANSFER_TIMEOUT" => ErrorCode::TransferTimeout,
        "RECEIVER_NOT_READY" => ErrorCode::ReceiverNotReady,
        "INVALID_FILE_ID" => ErrorCode::InvalidFileId,
        "INVALID_METADATA" => ErrorCode::InvalidMetadata,
        "INVALID_CHUNK_SEQUENCE" => ErrorCode::InvalidChunkSequence,
        "RECEIVER_BUFFER_EXHAUSTED" => ErrorCode::ReceiverBufferExhausted,
        "CHECKSUM_MISMATCH" => ErrorCode::ChecksumMismatch,
        "CHUNK_PERSIST_FAILED" => ErrorCode::ChunkPersistFailed,
        "MESSAGE_TOO_LARGE" => ErrorCode::MessageTooLarge,
        "RETRANSMIT_NOT_SUPPORTED" => ErrorCode::RetransmitNotSupported,
        "DATA_CHANNEL_NOT_READY" => ErrorCode::DataChannelNotReady,
        "DATA_CHANNEL_SEND_FAILED" => ErrorCode::DataChannelSendFailed,
        "AUTO_RESUME_TIMEOUT" => ErrorCode::AutoResumeTimeout,
        _ => ErrorCode::TransferControlParseError,
    }
}
