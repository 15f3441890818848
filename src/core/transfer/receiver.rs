//! Receive path: offer validation, resume negotiation, serialized chunk
//! persistence, finalization, retransmit requests.
//!
//! Every incoming file gets one writer task consuming a bounded channel of
//! jobs. Chunk persistence order therefore equals wire order, which is
//! what makes the store's contiguous-prefix count meaningful for resume.

use crate::core::config::{
    MEMORY_GUARD_THRESHOLD_BYTES, MIN_CHUNK_SIZE, WRITE_QUEUE_DEPTH,
};
use crate::core::finalizer::FinalizeOutcome;
use crate::core::integrity::{bytes_for_chunk_index, hash_bytes, total_chunk_count};
use crate::core::store::{
    session_key, Direction, PersistedChunk, PersistedSession, SessionStatus,
};
use crate::core::transfer::engine::{EngineEvent, Shared};
use crate::core::transfer::{ControlMessage, ErrorCode, FileMetadata, TransferError};
use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ── Runtime state ────────────────────────────────────────────────────────────

/// Work routed into a file's writer task.
pub(crate) enum WriteJob {
    Chunk(Vec<u8>),
    Complete { checksum: String },
}

/// Engine-side handle to one incoming transfer.
pub(crate) struct IncomingTransfer {
    pub metadata: FileMetadata,
    pub write_tx: mpsc::Sender<WriteJob>,
    /// Set by the writer once the file is delivered; the entry is inert
    /// afterwards and pruned on the next offer.
    pub finished: Arc<AtomicBool>,
    pub task: JoinHandle<()>,
}

// ── Offer handling ───────────────────────────────────────────────────────────

/// React to a `file-offer`: validate, negotiate the resume point, persist
/// the session, start the writer, reply `receiver-ready`.
pub(crate) async fn handle_file_offer(shared: &Arc<Shared>, metadata: FileMetadata) {
    if metadata.id.is_empty() {
        let error = TransferError::new(ErrorCode::InvalidFileId, "offer without a file id");
        shared.send_wire_error(&metadata.id, &error).await;
        return;
    }
    if metadata.chunk_size < MIN_CHUNK_SIZE {
        let error = TransferError::new(
            ErrorCode::InvalidMetadata,
            format!("chunk size {} below minimum", metadata.chunk_size),
        );
        shared.send_wire_error(&metadata.id, &error).await;
        return;
    }

    // Normalize: older senders omit upload_id; total chunks are never
    // trusted from the wire.
    let upload_id = metadata.effective_upload_id().to_string();
    let total_chunks = total_chunk_count(metadata.size, metadata.chunk_size);
    let mut metadata = metadata;
    metadata.upload_id = Some(upload_id.clone());
    metadata.total_chunks = total_chunks;

    if metadata.size >= MEMORY_GUARD_THRESHOLD_BYTES {
        shared.events.emit(
            "receive_memory_guard",
            json!({ "uploadId": upload_id, "fileSizeBytes": metadata.size }),
        );
    }

    let resume_from = match negotiate_resume(shared, &upload_id, &metadata).await {
        Ok(resume_from) => resume_from,
        Err(e) => {
            warn!(event = "offer_resume_probe_failure", error = %e, "Store probe failed; starting fresh");
            0
        }
    };

    let now = shared.clock.now_ms();
    let session = PersistedSession {
        session_key: session_key(Direction::Incoming, &upload_id),
        direction: Direction::Incoming,
        status: SessionStatus::Active,
        upload_id: upload_id.clone(),
        protocol_version: metadata.protocol_version,
        name: metadata.name.clone(),
        size: metadata.size,
        mime: metadata.mime.clone(),
        chunk_size: metadata.chunk_size,
        total_chunks,
        next_chunk_index: resume_from,
        bytes_transferred: bytes_for_chunk_index(resume_from, metadata.chunk_size, metadata.size),
        remote_peer_id: shared.remote_peer_id.read().unwrap().clone(),
        fingerprint: None,
        file_checksum: None,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = shared.store.put_session(session.clone()).await {
        let error = TransferError::new(
            ErrorCode::ChunkPersistFailed,
            format!("session persist failed: {e}"),
        );
        shared.send_wire_error(&metadata.id, &error).await;
        shared.fail_transfer(&upload_id, error.code, &error.message);
        return;
    }

    start_writer(shared, metadata.clone(), session, resume_from);
    *shared.current_receiving.lock().unwrap() = Some(upload_id.clone());

    let ready = ControlMessage::ReceiverReady {
        file_id: metadata.id.clone(),
        upload_id: upload_id.clone(),
        resume_from_chunk: resume_from as f64,
    };
    if let Err(e) = shared.send_control(&ready).await {
        warn!(event = "receiver_ready_send_failure", error = %e, "Could not send receiver-ready");
        return;
    }

    info!(
        event = "transfer_offer_accepted",
        upload_id = %upload_id,
        name = %metadata.name,
        size = metadata.size,
        total_chunks,
        resume_from,
        "Accepted file offer"
    );
    shared.events.emit(
        "transfer_offer_accepted",
        json!({ "uploadId": upload_id, "resumeFromChunk": resume_from, "totalChunks": total_chunks }),
    );
    shared.emit_app(EngineEvent::OfferReceived { metadata });
}

/// Resume point for a (possibly re-)offered upload: the persisted session
/// must match exactly, and the store can only vouch for its gap-free
/// prefix.
async fn negotiate_resume(
    shared: &Arc<Shared>,
    upload_id: &str,
    metadata: &FileMetadata,
) -> Result<u32> {
    let key = session_key(Direction::Incoming, upload_id);
    let Some(existing) = shared.store.get_session(&key).await? else {
        return Ok(0);
    };

    let matches = existing.size == metadata.size
        && existing.chunk_size == metadata.chunk_size
        && existing.total_chunks == metadata.total_chunks
        && existing.status != SessionStatus::Completed;
    if !matches {
        shared.store.delete_upload(upload_id).await?;
        return Ok(0);
    }

    let contiguous = shared
        .store
        .contiguous_chunk_count(upload_id, metadata.total_chunks)
        .await?;
    Ok(existing.next_chunk_index.min(contiguous))
}

fn start_writer(
    shared: &Arc<Shared>,
    metadata: FileMetadata,
    session: PersistedSession,
    resume_from: u32,
) {
    let upload_id = session.upload_id.clone();
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let finished = Arc::new(AtomicBool::new(false));

    let writer = Writer {
        shared: Arc::clone(shared),
        metadata: metadata.clone(),
        session,
        received_chunks: resume_from,
        bytes_received: bytes_for_chunk_index(resume_from, metadata.chunk_size, metadata.size),
        last_percent: -1,
        finished: Arc::clone(&finished),
        failed: false,
    };
    let task = tokio::spawn(writer.run(write_rx));

    let mut map = shared.incoming.lock().unwrap();
    // A re-offer replaces the old writer; finished entries are pruned.
    if let Some(previous) = map.remove(&upload_id) {
        previous.task.abort();
    }
    map.retain(|_, transfer| {
        let done = transfer.finished.load(Ordering::Acquire);
        if done {
            transfer.task.abort();
        }
        !done
    });
    map.insert(
        upload_id,
        IncomingTransfer {
            metadata,
            write_tx,
            finished,
            task,
        },
    );
}

// ── Writer task ──────────────────────────────────────────────────────────────

struct Writer {
    shared: Arc<Shared>,
    metadata: FileMetadata,
    session: PersistedSession,
    /// Next expected chunk index; equals the count of persisted chunks.
    received_chunks: u32,
    bytes_received: u64,
    last_percent: i64,
    finished: Arc<AtomicBool>,
    /// Persistence failed; ignore everything further for this file.
    failed: bool,
}

impl Writer {
    async fn run(mut self, mut jobs: mpsc::Receiver<WriteJob>) {
        loop {
            let job = match self.shared.shutdown.select(jobs.recv()).await {
                Some(Some(job)) => job,
                _ => break,
            };
            if self.failed {
                continue;
            }
            match job {
                WriteJob::Chunk(bytes) => self.on_chunk(bytes).await,
                WriteJob::Complete { checksum } => {
                    if self.on_complete(checksum).await {
                        break;
                    }
                }
            }
        }
    }

    async fn on_chunk(&mut self, bytes: Vec<u8>) {
        // Overflow past the announced chunk count is dropped silently;
        // the transport is ordered, so these are duplicates from a
        // retransmit race, not data.
        if self.received_chunks >= self.metadata.total_chunks {
            return;
        }

        let chunk_index = self.received_chunks;
        let checksum = hash_bytes(&bytes);
        let size = bytes.len() as u32;
        let chunk = PersistedChunk {
            upload_id: self.upload_id().to_string(),
            chunk_index,
            bytes,
            checksum,
            size,
            updated_at: self.shared.clock.now_ms(),
        };

        if let Err(e) = self.shared.store.put_chunk(chunk).await {
            self.failed = true;
            let error = TransferError::new(
                ErrorCode::ChunkPersistFailed,
                format!("chunk {chunk_index} persist failed: {e}"),
            );
            self.shared.send_wire_error(&self.metadata.id, &error).await;
            self.shared
                .fail_transfer(self.upload_id(), error.code, &error.message);
            return;
        }

        self.received_chunks += 1;
        self.bytes_received = bytes_for_chunk_index(
            self.received_chunks,
            self.metadata.chunk_size,
            self.metadata.size,
        );
        self.persist_progress().await;

        let percent = if self.metadata.size == 0 {
            100
        } else {
            ((self.bytes_received * 100) / self.metadata.size) as i64
        };
        let complete = self.received_chunks == self.metadata.total_chunks;
        if percent > self.last_percent || complete {
            self.last_percent = percent;
            self.shared.emit_app(EngineEvent::ReceiveProgress {
                upload_id: self.upload_id().to_string(),
                name: self.metadata.name.clone(),
                received_bytes: self.bytes_received,
                total_bytes: self.metadata.size,
                percent: percent.clamp(0, 100) as u8,
            });
        }
    }

    /// Returns true when the writer is done for good.
    async fn on_complete(&mut self, checksum: String) -> bool {
        let total = self.metadata.total_chunks;

        // Cheap gap probe before streaming the whole store through the
        // finalizer.
        let contiguous = match self
            .shared
            .store
            .contiguous_chunk_count(self.upload_id(), total)
            .await
        {
            Ok(contiguous) => contiguous,
            Err(e) => {
                self.fail_resource(&format!("store probe failed: {e}")).await;
                return true;
            }
        };
        if contiguous < total {
            self.request_retransmit(contiguous, "missing_chunks").await;
            return false;
        }

        let outcome = self
            .shared
            .finalizer
            .finalize(self.shared.store.as_ref(), &self.metadata, Some(&checksum))
            .await;

        match outcome {
            Ok(FinalizeOutcome::Complete {
                file,
                file_checksum,
                storage_mode,
            }) => {
                info!(
                    event = "transfer_receive_complete",
                    upload_id = %self.upload_id(),
                    name = %self.metadata.name,
                    bytes = self.metadata.size,
                    "File received and verified"
                );
                self.shared.events.emit(
                    "transfer_receive_complete",
                    json!({
                        "uploadId": self.upload_id(),
                        "name": self.metadata.name,
                        "fileSizeBytes": self.metadata.size,
                        "totalChunks": total,
                        "fileChecksum": file_checksum,
                        "storageMode": storage_mode,
                    }),
                );
                if let Err(e) = self.shared.store.delete_upload(self.upload_id()).await {
                    warn!(event = "upload_cleanup_failure", error = %e, "Could not clean up store");
                }
                self.shared.emit_app(EngineEvent::FileReceived {
                    upload_id: self.upload_id().to_string(),
                    name: self.metadata.name.clone(),
                    file,
                    checksum: file_checksum,
                });
                self.finished.store(true, Ordering::Release);
                true
            }

            Ok(FinalizeOutcome::MissingChunk { chunk_index }) => {
                self.request_retransmit(chunk_index, "missing_chunks").await;
                false
            }

            Ok(FinalizeOutcome::ChecksumMismatch { computed }) => {
                warn!(
                    event = "transfer_checksum_mismatch",
                    upload_id = %self.upload_id(),
                    expected = %checksum,
                    computed = %computed,
                    "File checksum mismatch; requesting full retransmit"
                );
                self.shared.events.emit(
                    "transfer_checksum_mismatch",
                    json!({ "uploadId": self.upload_id(), "computed": computed }),
                );
                self.request_retransmit(0, "CHECKSUM_MISMATCH").await;
                false
            }

            Err(e) => {
                self.fail_resource(&format!("finalize failed: {e}")).await;
                true
            }
        }
    }

    /// Ask the sender to re-stream from `from_chunk` and roll our own
    /// state back so the resent bytes replace the old ones.
    async fn request_retransmit(&mut self, from_chunk: u32, reason: &str) {
        if let Err(e) = self
            .shared
            .store
            .delete_chunks_from(self.upload_id(), from_chunk)
            .await
        {
            self.fail_resource(&format!("retransmit reset failed: {e}")).await;
            return;
        }
        self.received_chunks = from_chunk;
        self.bytes_received =
            bytes_for_chunk_index(from_chunk, self.metadata.chunk_size, self.metadata.size);
        self.last_percent = -1;
        self.persist_progress().await;

        info!(
            event = "transfer_retransmit_requested",
            upload_id = %self.upload_id(),
            from_chunk,
            reason,
            "Requesting retransmission"
        );
        self.shared.events.emit(
            "transfer_retransmit_requested",
            json!({ "uploadId": self.upload_id(), "fromChunk": from_chunk, "reason": reason }),
        );

        let message = ControlMessage::RequestRetransmit {
            file_id: self.metadata.id.clone(),
            upload_id: self.upload_id().to_string(),
            from_chunk: from_chunk as f64,
            reason: reason.to_string(),
        };
        if let Err(e) = self.shared.send_control(&message).await {
            warn!(event = "retransmit_request_send_failure", error = %e, "Could not request retransmit");
        }
    }

    async fn persist_progress(&mut self) {
        self.session.next_chunk_index = self.received_chunks;
        self.session.bytes_transferred = self.bytes_received;
        self.session.updated_at = self.shared.clock.now_ms();
        if let Err(e) = self.shared.store.put_session(self.session.clone()).await {
            warn!(event = "session_persist_failure", error = %e, "Could not persist session progress");
        }
    }

    async fn fail_resource(&mut self, message: &str) {
        self.failed = true;
        let error = TransferError::new(ErrorCode::ChunkPersistFailed, message);
        self.shared.send_wire_error(&self.metadata.id, &error).await;
        self.shared
            .fail_transfer(self.upload_id(), error.code, &error.message);
    }

    fn upload_id(&self) -> &str {
        &self.session.upload_id
    }
}
