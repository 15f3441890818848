//! End-to-end engine tests over the in-memory transport.
//!
//! Two engines share a channel pair: whatever one sends, the other
//! receives, byte for byte, including across a mid-transfer channel loss
//! with auto-resume. No network, no browser; the store and clock are the
//! in-process implementations.

use peershare::core::config::{EngineConfig, RuntimeOverrides};
use peershare::core::events::EventLog;
use peershare::core::finalizer::{AssembledFile, Finalizer};
use peershare::core::queue::SendItemStatus;
use peershare::core::store::memory::MemoryStore;
use peershare::core::store::TransferStore;
use peershare::core::transfer::engine::{EngineEvent, TransferEngine};
use peershare::core::transfer::source::SendFile;
use peershare::transport::memory::{MemoryChannel, MemoryEndpoint};
use peershare::transport::{ChannelHandle, DataChannel};
use peershare::utils::clock::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn engine(query: &str) -> (TransferEngine, mpsc::UnboundedReceiver<EngineEvent>) {
    let overrides = RuntimeOverrides::from_query(query);
    let config = EngineConfig::with_overrides(&overrides);
    let clock = Arc::new(SystemClock);
    let store: Arc<dyn TransferStore> = Arc::new(MemoryStore::new());
    let events = EventLog::new(clock.clone());
    TransferEngine::new(config, store, clock, Finalizer::in_memory(), events)
}

fn attach(engine: &TransferEngine, endpoint: MemoryEndpoint) -> Arc<MemoryChannel> {
    let raw = Arc::clone(&endpoint.raw);
    engine.attach_channel(ChannelHandle {
        channel: endpoint.channel,
        frames: endpoint.frames,
    });
    raw
}

/// Deterministic but non-repeating payload.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("engine event stream ended")
}

async fn wait_for_file(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> (String, Vec<u8>, String) {
    loop {
        if let EngineEvent::FileReceived {
            name,
            file,
            checksum,
            ..
        } = next_event(rx).await
        {
            let AssembledFile::Memory(bytes) = file else {
                panic!("expected in-memory assembly");
            };
            return (name, bytes, checksum);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_round_trip() {
    let (sender, _sender_events) = engine("");
    let (receiver, mut receiver_events) = engine("");

    let (a, b) = MemoryChannel::pair("data");
    attach(&sender, a);
    attach(&receiver, b);

    let bytes = payload(200 * 1024);
    let file = Arc::new(SendFile::from_bytes("photo.jpg", "image/jpeg", 1_000, bytes.clone()));

    let upload_id = sender.send_file(Arc::clone(&file)).await.expect("send failed");

    let (name, received, checksum) = wait_for_file(&mut receiver_events).await;
    assert_eq!(name, "photo.jpg");
    assert_eq!(received, bytes);

    // Both ends agree on the derived checksum, and both completion events
    // carry it.
    let send_complete = sender.event_log().buffer().named("transfer_send_complete");
    assert_eq!(send_complete.len(), 1);
    assert_eq!(send_complete[0].payload["uploadId"], upload_id.as_str());
    assert_eq!(send_complete[0].payload["fileChecksum"], checksum.as_str());

    let recv_complete = receiver
        .event_log()
        .buffer()
        .named("transfer_receive_complete");
    assert_eq!(recv_complete.len(), 1);
    assert_eq!(recv_complete[0].payload["fileChecksum"], checksum.as_str());

    // The receiver cleaned its spool.
    sender.disconnect().await;
    receiver.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_file_needs_only_offer_and_complete() {
    let (sender, _sender_events) = engine("");
    let (receiver, mut receiver_events) = engine("");

    let (a, b) = MemoryChannel::pair("data");
    attach(&sender, a);
    attach(&receiver, b);

    let file = Arc::new(SendFile::from_bytes("empty.bin", "", 7, Vec::new()));
    sender.send_file(file).await.expect("send failed");

    let (name, received, _checksum) = wait_for_file(&mut receiver_events).await;
    assert_eq!(name, "empty.bin");
    assert!(received.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_message_limit_clamps_chunk_size() {
    let (sender, _sender_events) = engine("psForceMaxMessageSize=20000");
    let (receiver, mut receiver_events) = engine("");

    let (a, b) = MemoryChannel::pair("data");
    attach(&sender, a);
    attach(&receiver, b);

    let bytes = payload(100 * 1024);
    let file = Arc::new(SendFile::from_bytes("clamped.bin", "", 3, bytes.clone()));
    sender.send_file(file).await.expect("send failed");

    let (_, received, _) = wait_for_file(&mut receiver_events).await;
    assert_eq!(received, bytes);

    let complete = sender.event_log().buffer().named("transfer_send_complete");
    assert_eq!(complete[0].payload["chunkSizeUsed"], 16_384);
    assert_eq!(complete[0].payload["messageLimitBytes"], 20_000);
    assert_eq!(complete[0].payload["planReason"], "max_message_size");
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_sends_three_files_in_order() {
    let (sender, mut sender_events) = engine("");
    let (receiver, mut receiver_events) = engine("");

    let (a, b) = MemoryChannel::pair("data");
    attach(&sender, a);
    attach(&receiver, b);

    let names = ["a.bin", "b.bin", "c.bin"];
    for name in names {
        sender.enqueue(Arc::new(SendFile::from_bytes(
            name,
            "",
            1,
            payload(64 * 1024),
        )));
    }

    // Whenever the queue changes, at most one item is in flight.
    let mut received = Vec::new();
    while received.len() < 3 {
        match next_event(&mut receiver_events).await {
            EngineEvent::FileReceived { name, .. } => received.push(name),
            _ => {}
        }
        let snapshot = sender.queue_state();
        let sending = snapshot
            .items
            .iter()
            .filter(|i| i.status == SendItemStatus::Sending)
            .count();
        assert!(sending <= 1, "two items sending at once");
    }
    assert_eq!(received, names);

    // Drain queue bookkeeping: all three end completed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = sender.queue_state();
        if state
            .items
            .iter()
            .all(|i| i.status == SendItemStatus::Completed)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue never settled");
        match tokio::time::timeout(Duration::from_millis(200), sender_events.recv()).await {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => panic!("sender event stream ended"),
        }
    }

    let send_order: Vec<String> = sender
        .event_log()
        .buffer()
        .named("transfer_send_complete")
        .iter()
        .map(|e| e.payload["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(send_order, names);
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_transfer_resumes_without_losing_bytes() {
    // Small buffer + polling keeps the sender honest about backpressure,
    // and manual drain lets the test pace the wire.
    let (sender, _sender_events) =
        engine("psBackpressureMode=polling&psMaxBufferedAmount=65536&psLowThreshold=65536");
    let (receiver, mut receiver_events) = engine("");

    let (a, b) = MemoryChannel::pair("data");
    let sender_raw = attach(&sender, a);
    attach(&receiver, b);

    // Throttle the first connection so the transfer is mid-flight when it
    // breaks.
    sender_raw.set_manual_drain(true);
    {
        let raw = Arc::clone(&sender_raw);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                raw.drain(16 * 1024);
            }
        });
    }

    let bytes = payload(2 * 1024 * 1024);
    let file = Arc::new(SendFile::from_bytes("big.bin", "", 42, bytes.clone()));
    let send_task = {
        let sender = sender.clone();
        let file = Arc::clone(&file);
        tokio::spawn(async move { sender.send_file(file).await })
    };

    // Cut the channel once the receiver has real progress.
    loop {
        match next_event(&mut receiver_events).await {
            EngineEvent::ReceiveProgress { percent, .. } if percent >= 20 => break,
            _ => {}
        }
    }
    sender_raw.close().await;

    // Reconnect: fresh pair, full speed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (a2, b2) = MemoryChannel::pair("data");
    attach(&sender, a2);
    attach(&receiver, b2);

    let upload_id = send_task
        .await
        .expect("send task panicked")
        .expect("send did not survive the interruption");

    let (name, received, checksum) = wait_for_file(&mut receiver_events).await;
    assert_eq!(name, "big.bin");
    assert_eq!(received.len(), bytes.len());
    assert_eq!(received, bytes);

    // The resume was a real resume: the engine retried, and the second
    // offer started from a strictly positive chunk.
    let resume_attempts = sender
        .event_log()
        .buffer()
        .named("transfer_auto_resume_attempt");
    assert!(!resume_attempts.is_empty());

    let negotiated = sender
        .event_log()
        .buffer()
        .named("transfer_resume_negotiated");
    assert!(
        negotiated
            .iter()
            .any(|e| e.payload["startChunk"].as_u64().unwrap_or(0) > 0),
        "expected a positive start chunk, got {negotiated:?}"
    );

    let complete = sender.event_log().buffer().named("transfer_send_complete");
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].payload["uploadId"], upload_id.as_str());
    assert_eq!(complete[0].payload["fileChecksum"], checksum.as_str());
}
