//! Send path: offer, await ready, stream chunks under backpressure,
//! complete, all wrapped in an auto-resume loop that survives transient
//! channel loss. Also hosts the retransmit service for the receive side's
//! integrity recovery.

use crate::core::config::{
    AUTO_RESUME_MAX_WAIT, AUTO_RESUME_POLL_INTERVAL, RECEIVER_READY_TIMEOUT,
};
use crate::core::integrity::{
    bytes_for_chunk_index, derive_file_checksum, hash_bytes, normalize_chunk_index,
};
use crate::core::planner::plan_chunk_size;
use crate::core::queue::SendQueueAction;
use crate::core::store::{session_key, Direction, PersistedSession, SessionStatus};
use crate::core::transfer::engine::{EngineEvent, OutgoingRuntimeSession, Shared};
use crate::core::transfer::source::SendFile;
use crate::core::transfer::{
    error_code, is_recoverable_send_interruption, ControlMessage, ErrorCode, FileMetadata,
    TransferError, PROTOCOL_VERSION,
};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

// ── Entry point ──────────────────────────────────────────────────────────────

/// Send one file, resuming across recoverable interruptions until the
/// transfer completes or the auto-resume deadline passes. Returns the
/// upload id on success.
pub(crate) async fn send_file(shared: &Arc<Shared>, file: Arc<SendFile>) -> Result<String> {
    let deadline = Instant::now() + AUTO_RESUME_MAX_WAIT;
    let fingerprint = file.fingerprint();
    let mut attempt: u32 = 0;
    let mut current_upload: Option<String> = None;

    loop {
        attempt += 1;
        if attempt > 1 {
            shared.events.emit(
                "transfer_auto_resume_attempt",
                json!({ "attempt": attempt, "name": file.name }),
            );
            if let Err(e) = wait_for_data_channel_ready(shared, deadline).await {
                let code = error_code(&e).unwrap_or(ErrorCode::AutoResumeTimeout);
                let fatal = TransferError::new(code, format!("{e:#}"));
                mark_failed(shared, current_upload.as_deref(), &fatal).await;
                return Err(e);
            }
        }

        match attempt_send(shared, &file, &fingerprint, attempt, &mut current_upload).await {
            Ok(upload_id) => return Ok(upload_id),
            Err(e) if is_recoverable_send_interruption(&e) => {
                if Instant::now() >= deadline {
                    let timeout = TransferError::new(
                        ErrorCode::AutoResumeTimeout,
                        format!("gave up resuming '{}' after repeated interruptions", file.name),
                    );
                    mark_failed(shared, current_upload.as_deref(), &timeout).await;
                    return Err(timeout.into());
                }
                warn!(
                    event = "transfer_send_interrupted",
                    name = %file.name,
                    attempt,
                    error = %e,
                    "Send interrupted; will resume"
                );
            }
            Err(e) => {
                let code = error_code(&e).unwrap_or(ErrorCode::DataChannelSendFailed);
                let fatal = TransferError::new(code, format!("{e:#}"));
                mark_failed(shared, current_upload.as_deref(), &fatal).await;
                return Err(e);
            }
        }
    }
}

async fn mark_failed(shared: &Arc<Shared>, upload_id: Option<&str>, error: &TransferError) {
    let Some(upload_id) = upload_id else { return };
    if let Some(session) = shared
        .runtime_sessions
        .lock()
        .unwrap()
        .get_mut(upload_id)
    {
        session.status = SessionStatus::Failed;
    }
    let key = session_key(Direction::Outgoing, upload_id);
    if let Ok(Some(mut session)) = shared.store.get_session(&key).await {
        session.status = SessionStatus::Failed;
        session.updated_at = shared.clock.now_ms();
        let _ = shared.store.put_session(session).await;
    }
    shared.fail_transfer(upload_id, error.code, &error.message);
}

/// Poll until a usable channel is attached, bounded by the auto-resume
/// deadline.
async fn wait_for_data_channel_ready(shared: &Arc<Shared>, deadline: Instant) -> Result<()> {
    loop {
        if shared.current_channel().is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::new(
                ErrorCode::AutoResumeTimeout,
                "data channel did not reopen before the resume deadline",
            )
            .into());
        }
        if shared
            .shutdown
            .select(tokio::time::sleep(AUTO_RESUME_POLL_INTERVAL))
            .await
            .is_none()
        {
            return Err(TransferError::new(
                ErrorCode::DataChannelNotReady,
                "engine shut down while waiting for the channel",
            )
            .into());
        }
    }
}

// ── One attempt ──────────────────────────────────────────────────────────────

async fn attempt_send(
    shared: &Arc<Shared>,
    file: &Arc<SendFile>,
    fingerprint: &str,
    attempt: u32,
    current_upload: &mut Option<String>,
) -> Result<String> {
    let started = Instant::now();
    let remote_peer = shared.remote_peer_id.read().unwrap().clone();

    // 1. Session selection: adopt a prior interrupted session for the same
    //    file so the receiver can be offered the same upload id.
    let prior = shared
        .store
        .find_outgoing_session_by_fingerprint(fingerprint, remote_peer.as_deref())
        .await?;
    let (upload_id, base_chunk_size, mut local_resume) = match prior {
        Some(s) if s.size == file.size && s.status != SessionStatus::Completed => {
            (s.upload_id, s.chunk_size, s.next_chunk_index)
        }
        _ => (
            Uuid::new_v4().to_string(),
            shared.config.base_chunk_size,
            0,
        ),
    };
    *current_upload = Some(upload_id.clone());

    // 2. Chunk plan.
    let channel = shared.current_channel()?;
    let max_message_size = shared
        .config
        .force_max_message_size
        .or_else(|| channel.max_message_size());
    let rtt_ms = sample_rtt(shared).await;
    let plan = plan_chunk_size(base_chunk_size, max_message_size, rtt_ms, file.size);
    // A replanned chunk size invalidates persisted chunk offsets.
    if plan.chunk_size != base_chunk_size {
        local_resume = 0;
    }
    let chunk_size = plan.chunk_size;
    let total_chunks = plan.total_chunks;
    shared.events.emit(
        "transfer_chunk_plan",
        json!({
            "uploadId": upload_id,
            "chunkSize": chunk_size,
            "totalChunks": total_chunks,
            "reason": plan.reason.as_str(),
            "rttMs": rtt_ms,
            "messageLimitBytes": max_message_size,
        }),
    );

    // 3. Register and send the offer.
    let metadata = FileMetadata {
        id: upload_id.clone(),
        upload_id: Some(upload_id.clone()),
        protocol_version: PROTOCOL_VERSION,
        name: file.name.clone(),
        size: file.size,
        mime: file.mime.clone(),
        chunk_size,
        total_chunks,
        file_checksum: None,
        fingerprint: Some(fingerprint.to_string()),
    };

    let now = shared.clock.now_ms();
    let mut session = PersistedSession {
        session_key: session_key(Direction::Outgoing, &upload_id),
        direction: Direction::Outgoing,
        status: SessionStatus::Active,
        upload_id: upload_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        name: file.name.clone(),
        size: file.size,
        mime: file.mime.clone(),
        chunk_size,
        total_chunks,
        next_chunk_index: local_resume,
        bytes_transferred: bytes_for_chunk_index(local_resume, chunk_size, file.size),
        remote_peer_id: remote_peer,
        fingerprint: Some(fingerprint.to_string()),
        file_checksum: None,
        created_at: now,
        updated_at: now,
    };
    shared
        .store
        .put_session(session.clone())
        .await
        .map_err(persist_error)?;

    {
        let mut sessions = shared.runtime_sessions.lock().unwrap();
        let entry = sessions
            .entry(upload_id.clone())
            .or_insert_with(|| OutgoingRuntimeSession {
                file: Arc::clone(file),
                metadata: metadata.clone(),
                chunk_checksums: vec![None; total_chunks as usize],
                file_checksum: None,
                status: SessionStatus::Active,
                fingerprint: fingerprint.to_string(),
                attempt_count: 0,
                offered_last_modified: file.last_modified,
            });
        entry.metadata = metadata.clone();
        entry.status = SessionStatus::Active;
        entry.attempt_count = attempt;
        if entry.chunk_checksums.len() != total_chunks as usize {
            entry.chunk_checksums = vec![None; total_chunks as usize];
        }
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    shared
        .pending_ready
        .lock()
        .unwrap()
        .insert(upload_id.clone(), ready_tx);

    shared
        .send_control(&ControlMessage::FileOffer {
            metadata: metadata.clone(),
        })
        .await?;
    info!(
        event = "transfer_offer_sent",
        upload_id = %upload_id,
        name = %file.name,
        size = file.size,
        chunk_size,
        total_chunks,
        attempt,
        "Sent file offer"
    );

    let remote_resume_raw = match tokio::time::timeout(RECEIVER_READY_TIMEOUT, ready_rx).await {
        Ok(Ok(Ok(resume))) => resume,
        Ok(Ok(Err(peer_error))) => return Err(peer_error.into()),
        Ok(Err(_)) => {
            return Err(TransferError::new(
                ErrorCode::DataChannelNotReady,
                "engine torn down while awaiting receiver-ready",
            )
            .into());
        }
        Err(_) => {
            shared.pending_ready.lock().unwrap().remove(&upload_id);
            return Err(TransferError::new(
                ErrorCode::TransferTimeout,
                "timed out waiting for receiver-ready",
            )
            .into());
        }
    };

    // 4. Negotiate the start chunk.
    let remote_resume = normalize_chunk_index(remote_resume_raw, total_chunks);
    let start_chunk = local_resume.max(remote_resume).min(total_chunks);
    if start_chunk > 0 {
        info!(
            event = "transfer_resume_negotiated",
            upload_id = %upload_id,
            start_chunk,
            local_resume,
            remote_resume,
            "Resuming instead of restarting"
        );
        shared.events.emit(
            "transfer_resume_negotiated",
            json!({
                "uploadId": upload_id,
                "startChunk": start_chunk,
                "localResume": local_resume,
                "remoteResume": remote_resume,
            }),
        );
    }

    // 5. Stream.
    let mut last_percent: i64 = -1;
    for chunk_index in start_chunk..total_chunks {
        let offset = chunk_index as u64 * chunk_size as u64;
        let bytes = file.read_range(offset, offset + chunk_size as u64).await?;

        if let Some(limit) = max_message_size {
            if bytes.len() > limit {
                return Err(TransferError::new(
                    ErrorCode::MessageTooLarge,
                    format!("chunk of {} bytes exceeds message limit {limit}", bytes.len()),
                )
                .into());
            }
        }

        send_chunk(shared, &bytes).await?;

        let checksum = hash_bytes(&bytes);
        if let Some(entry) = shared.runtime_sessions.lock().unwrap().get_mut(&upload_id) {
            entry.chunk_checksums[chunk_index as usize] = Some(checksum);
        }

        session.next_chunk_index = chunk_index + 1;
        session.bytes_transferred =
            bytes_for_chunk_index(chunk_index + 1, chunk_size, file.size);
        session.updated_at = shared.clock.now_ms();
        shared
            .store
            .put_session(session.clone())
            .await
            .map_err(persist_error)?;

        emit_send_progress(
            shared,
            &upload_id,
            &file.name,
            session.bytes_transferred,
            file.size,
            chunk_index + 1 == total_chunks,
            &mut last_percent,
        );
    }

    // 6. Finish.
    let current_modified = file.current_last_modified().await?;
    let offered_modified = shared
        .runtime_sessions
        .lock()
        .unwrap()
        .get(&upload_id)
        .map(|s| s.offered_last_modified)
        .unwrap_or(file.last_modified);
    if current_modified != offered_modified {
        return Err(TransferError::new(
            ErrorCode::ChecksumMismatch,
            "source file changed between offer and completion",
        )
        .into());
    }

    let file_checksum = compute_file_checksum(shared, &upload_id, file, &metadata).await?;
    shared
        .send_control(&ControlMessage::TransferComplete {
            file_id: upload_id.clone(),
            upload_id: upload_id.clone(),
            checksum: file_checksum.clone(),
        })
        .await?;

    if let Some(entry) = shared.runtime_sessions.lock().unwrap().get_mut(&upload_id) {
        entry.status = SessionStatus::Completed;
        entry.file_checksum = Some(file_checksum.clone());
    }
    session.status = SessionStatus::Completed;
    session.file_checksum = Some(file_checksum.clone());
    session.updated_at = shared.clock.now_ms();
    shared
        .store
        .put_session(session)
        .await
        .map_err(persist_error)?;

    if last_percent < 100 {
        emit_send_progress(shared, &upload_id, &file.name, file.size, file.size, true, &mut last_percent);
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let totals = shared
        .current_arbiter()
        .map(|a| a.totals())
        .unwrap_or_default();
    info!(
        event = "transfer_send_complete",
        upload_id = %upload_id,
        name = %file.name,
        bytes = file.size,
        elapsed_ms,
        attempt,
        "File sent"
    );
    shared.events.emit(
        "transfer_send_complete",
        json!({
            "uploadId": upload_id,
            "name": file.name,
            "fileSizeBytes": file.size,
            "chunkSizeUsed": chunk_size,
            "totalChunks": total_chunks,
            "startChunk": start_chunk,
            "attempt": attempt,
            "planReason": plan.reason.as_str(),
            "rttMs": rtt_ms,
            "messageLimitBytes": max_message_size,
            "elapsedMs": elapsed_ms,
            "backpressureWaits": totals.total_waits(),
            "backpressureEvents": totals.event_waits,
            "eventWaitMs": totals.event_wait_ms,
            "pollingIdleWaitMs": totals.polling_wait_ms,
            "fileChecksum": file_checksum,
        }),
    );

    Ok(upload_id)
}

// ── Retransmit service ───────────────────────────────────────────────────────

/// Serve a `request-retransmit`: re-stream `[from_chunk, total)` from the
/// retained runtime session and resend `transfer-complete`.
pub(crate) async fn serve_retransmit(
    shared: &Arc<Shared>,
    upload_id: &str,
    from_chunk_raw: f64,
    reason: &str,
) {
    let retained = {
        let sessions = shared.runtime_sessions.lock().unwrap();
        sessions
            .get(upload_id)
            .map(|s| (Arc::clone(&s.file), s.metadata.clone()))
    };
    let Some((file, metadata)) = retained else {
        warn!(
            event = "retransmit_not_supported",
            upload_id = %upload_id,
            "No runtime session retained for retransmit"
        );
        let error = TransferError::new(
            ErrorCode::RetransmitNotSupported,
            "no runtime session for this upload",
        );
        shared.send_wire_error(upload_id, &error).await;
        return;
    };

    let from_chunk = normalize_chunk_index(from_chunk_raw, metadata.total_chunks);
    info!(
        event = "transfer_retransmit_serving",
        upload_id = %upload_id,
        from_chunk,
        reason,
        "Serving retransmit request"
    );
    shared.events.emit(
        "transfer_retransmit_serving",
        json!({ "uploadId": upload_id, "fromChunk": from_chunk, "reason": reason }),
    );

    if let Err(e) = restream(shared, upload_id, &file, &metadata, from_chunk).await {
        warn!(
            event = "transfer_retransmit_failed",
            upload_id = %upload_id,
            error = %e,
            "Retransmit interrupted; receiver will re-request after resume"
        );
    }
}

async fn restream(
    shared: &Arc<Shared>,
    upload_id: &str,
    file: &Arc<SendFile>,
    metadata: &FileMetadata,
    from_chunk: u32,
) -> Result<()> {
    let chunk_size = metadata.chunk_size;
    for chunk_index in from_chunk..metadata.total_chunks {
        let offset = chunk_index as u64 * chunk_size as u64;
        let bytes = file.read_range(offset, offset + chunk_size as u64).await?;
        send_chunk(shared, &bytes).await?;

        let checksum = hash_bytes(&bytes);
        if let Some(entry) = shared.runtime_sessions.lock().unwrap().get_mut(upload_id) {
            entry.chunk_checksums[chunk_index as usize] = Some(checksum);
        }
    }

    let file_checksum = compute_file_checksum(shared, upload_id, file, metadata).await?;
    shared
        .send_control(&ControlMessage::TransferComplete {
            file_id: upload_id.to_string(),
            upload_id: upload_id.to_string(),
            checksum: file_checksum,
        })
        .await
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// One chunk onto the wire: readiness check, backpressure wait, send.
async fn send_chunk(shared: &Arc<Shared>, bytes: &[u8]) -> Result<()> {
    let channel = shared.current_channel()?;
    let arbiter = shared.current_arbiter().ok_or_else(|| {
        TransferError::new(ErrorCode::DataChannelNotReady, "no backpressure arbiter")
    })?;

    if channel.buffered_amount().await > arbiter.wait_threshold() {
        arbiter.wait_for_backpressure(channel.as_ref()).await?;
    }

    channel.send_binary(bytes).await.map_err(|e| {
        TransferError::new(
            ErrorCode::DataChannelSendFailed,
            format!("chunk send failed: {e}"),
        )
        .into()
    })
}

/// Derive the file checksum from the runtime checksum list, hashing any
/// chunks this attempt never touched (resumed prefixes) from the file.
async fn compute_file_checksum(
    shared: &Arc<Shared>,
    upload_id: &str,
    file: &Arc<SendFile>,
    metadata: &FileMetadata,
) -> Result<String> {
    let known: Vec<Option<String>> = shared
        .runtime_sessions
        .lock()
        .unwrap()
        .get(upload_id)
        .map(|s| s.chunk_checksums.clone())
        .unwrap_or_else(|| vec![None; metadata.total_chunks as usize]);

    let chunk_size = metadata.chunk_size as u64;
    let mut checksums = Vec::with_capacity(metadata.total_chunks as usize);
    for (chunk_index, entry) in known.iter().enumerate() {
        match entry {
            Some(checksum) => checksums.push(checksum.clone()),
            None => {
                let offset = chunk_index as u64 * chunk_size;
                let bytes = file.read_range(offset, offset + chunk_size).await?;
                checksums.push(hash_bytes(&bytes));
            }
        }
    }

    if let Some(entry) = shared.runtime_sessions.lock().unwrap().get_mut(upload_id) {
        for (slot, checksum) in entry.chunk_checksums.iter_mut().zip(checksums.iter()) {
            if slot.is_none() {
                *slot = Some(checksum.clone());
            }
        }
    }
    Ok(derive_file_checksum(&checksums))
}

fn emit_send_progress(
    shared: &Arc<Shared>,
    upload_id: &str,
    name: &str,
    sent_bytes: u64,
    total_bytes: u64,
    is_final: bool,
    last_percent: &mut i64,
) {
    let percent = if total_bytes == 0 {
        100
    } else {
        ((sent_bytes * 100) / total_bytes) as i64
    };
    if percent <= *last_percent && !is_final {
        return;
    }
    *last_percent = percent;

    if let Some(queue_item) = *shared.active_queue_item.lock().unwrap() {
        shared.dispatch_queue(SendQueueAction::UpdateProgress {
            id: queue_item,
            sent_bytes,
        });
    }
    shared.emit_app(EngineEvent::SendProgress {
        upload_id: upload_id.to_string(),
        name: name.to_string(),
        sent_bytes,
        total_bytes,
        percent: percent.clamp(0, 100) as u8,
    });
}

async fn sample_rtt(shared: &Arc<Shared>) -> Option<f64> {
    let now = shared.clock.now_ms();
    if let Some(cached) = shared.rtt_cache.lock().unwrap().fresh(now) {
        return cached;
    }
    let transport = shared.transport.read().unwrap().clone();
    let rtt = match transport {
        Some(transport) => transport.stats().await.selected_rtt_ms,
        None => None,
    };
    shared.rtt_cache.lock().unwrap().store(now, rtt);
    rtt
}

fn persist_error(e: anyhow::Error) -> anyhow::Error {
    TransferError::new(
        ErrorCode::ChunkPersistFailed,
        format!("session persist failed: {e}"),
    )
    .into()
}
