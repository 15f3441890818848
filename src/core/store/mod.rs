//! Persistent transfer state: sessions and chunks.
//!
//! Two tables, both keyed so resume works across restarts:
//! - `sessions`: primary key `session_key` (`"incoming:"|"outgoing:" +
//!   upload_id`), with lookups by fingerprint for outgoing resume matching.
//! - `chunks`: composite key `(upload_id, chunk_index)`, carrying the raw
//!   bytes and their checksum.
//!
//! The store is the source of truth for resume: runtime state references it
//! by `upload_id`, never the other way around. All implementations must be
//! non-blocking from the engine's perspective; the receive path serializes
//! chunk writes per file, so per-upload access is single-writer by
//! construction.

pub mod disk;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── Records ──────────────────────────────────────────────────────────────────

/// Which side of the wire a persisted session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// Lifecycle state of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Durable per-(direction, upload) record.
///
/// Invariants:
/// - `next_chunk_index` never decreases for an `Active` session except on
///   an explicit retransmit reset.
/// - `bytes_transferred == bytes_for_chunk_index(next_chunk_index,
///   chunk_size, size)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSession {
    pub session_key: String,
    pub direction: Direction,
    pub status: SessionStatus,
    pub upload_id: String,
    pub protocol_version: u32,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub next_chunk_index: u32,
    pub bytes_transferred: u64,
    pub remote_peer_id: Option<String>,
    pub fingerprint: Option<String>,
    pub file_checksum: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Compose the primary key for a session.
pub fn session_key(direction: Direction, upload_id: &str) -> String {
    format!("{}:{}", direction.key_prefix(), upload_id)
}

/// Durable chunk record. When present, `bytes` hash to `checksum`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedChunk {
    pub upload_id: String,
    pub chunk_index: u32,
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub size: u32,
    pub updated_at: u64,
}

// ── Store contract ───────────────────────────────────────────────────────────

/// Durable key-value service backing resumable transfers.
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn put_session(&self, session: PersistedSession) -> Result<()>;

    async fn get_session(&self, session_key: &str) -> Result<Option<PersistedSession>>;

    /// Most-recently-updated non-completed outgoing session with this
    /// fingerprint, preferring one bound to the same remote peer.
    async fn find_outgoing_session_by_fingerprint(
        &self,
        fingerprint: &str,
        remote_peer_id: Option<&str>,
    ) -> Result<Option<PersistedSession>>;

    async fn put_chunk(&self, chunk: PersistedChunk) -> Result<()>;

    async fn get_chunk(&self, upload_id: &str, chunk_index: u32)
        -> Result<Option<PersistedChunk>>;

    /// Total persisted chunks for an upload, contiguous or not.
    async fn chunk_count(&self, upload_id: &str) -> Result<u32>;

    /// Length of the gap-free prefix: iterates 0, 1, 2, … until a missing
    /// index, capped at `total_chunks`.
    async fn contiguous_chunk_count(&self, upload_id: &str, total_chunks: u32) -> Result<u32> {
        for index in 0..total_chunks {
            if self.get_chunk(upload_id, index).await?.is_none() {
                return Ok(index);
            }
        }
        Ok(total_chunks)
    }

    /// Delete every persisted chunk with `chunk_index >= from_chunk`.
    async fn delete_chunks_from(&self, upload_id: &str, from_chunk: u32) -> Result<()>;

    /// Delete the upload's sessions (both directions) and all its chunks.
    async fn delete_upload(&self, upload_id: &str) -> Result<()>;

    /// Delete every upload whose session has `updated_at < now - max_age`.
    /// Returns the number of sessions removed.
    async fn prune_stale_sessions(&self, now_ms: u64, max_age_ms: u64) -> Result<u32>;
}

// ── Conformance suite ────────────────────────────────────────────────────────

/// Behavior every store implementation must exhibit; `memory` and `disk`
/// both run these against their own construction.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::core::integrity::hash_bytes;

    fn session(direction: Direction, upload_id: &str, updated_at: u64) -> PersistedSession {
        PersistedSession {
            session_key: session_key(direction, upload_id),
            direction,
            status: SessionStatus::Active,
            upload_id: upload_id.to_string(),
            protocol_version: 2,
            name: "file.bin".into(),
            size: 100_000,
            mime: "application/octet-stream".into(),
            chunk_size: 16_384,
            total_chunks: 7,
            next_chunk_index: 0,
            bytes_transferred: 0,
            remote_peer_id: Some("peer-a".into()),
            fingerprint: Some("file.bin::100000::application/octet-stream::1".into()),
            file_checksum: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn chunk(upload_id: &str, index: u32) -> PersistedChunk {
        let bytes = vec![index as u8; 64];
        PersistedChunk {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            checksum: hash_bytes(&bytes),
            size: bytes.len() as u32,
            bytes,
            updated_at: 1,
        }
    }

    pub async fn session_round_trip(store: &dyn TransferStore) {
        let s = session(Direction::Incoming, "up-1", 10);
        store.put_session(s.clone()).await.unwrap();
        let got = store.get_session(&s.session_key).await.unwrap().unwrap();
        assert_eq!(got, s);
        assert!(store.get_session("incoming:missing").await.unwrap().is_none());
    }

    pub async fn fingerprint_lookup_prefers_peer_and_recency(store: &dyn TransferStore) {
        let fp = "file.bin::100000::application/octet-stream::1";

        let mut old = session(Direction::Outgoing, "up-old", 10);
        old.remote_peer_id = Some("peer-b".into());
        let newer = session(Direction::Outgoing, "up-new", 20);
        let mut done = session(Direction::Outgoing, "up-done", 30);
        done.status = SessionStatus::Completed;
        let incoming = session(Direction::Incoming, "up-in", 40);

        for s in [old, newer, done, incoming] {
            store.put_session(s).await.unwrap();
        }

        // Completed and incoming sessions never match.
        let found = store
            .find_outgoing_session_by_fingerprint(fp, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.upload_id, "up-new");

        // Same-peer match wins over a fresher foreign-peer match.
        let found = store
            .find_outgoing_session_by_fingerprint(fp, Some("peer-b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.upload_id, "up-old");

        assert!(store
            .find_outgoing_session_by_fingerprint("other", None)
            .await
            .unwrap()
            .is_none());
    }

    pub async fn chunk_round_trip_and_contiguity(store: &dyn TransferStore) {
        for index in [0u32, 1, 2, 4] {
            store.put_chunk(chunk("up-1", index)).await.unwrap();
        }

        let got = store.get_chunk("up-1", 2).await.unwrap().unwrap();
        assert_eq!(got.bytes, vec![2u8; 64]);
        assert_eq!(got.checksum, hash_bytes(&got.bytes));
        assert!(store.get_chunk("up-1", 3).await.unwrap().is_none());

        assert_eq!(store.chunk_count("up-1").await.unwrap(), 4);
        // Gap at 3 stops the prefix.
        assert_eq!(store.contiguous_chunk_count("up-1", 7).await.unwrap(), 3);
        assert_eq!(store.contiguous_chunk_count("up-1", 2).await.unwrap(), 2);
        assert_eq!(store.contiguous_chunk_count("none", 7).await.unwrap(), 0);
    }

    pub async fn delete_from_and_delete_upload(store: &dyn TransferStore) {
        store.put_session(session(Direction::Incoming, "up-1", 10)).await.unwrap();
        for index in 0..5 {
            store.put_chunk(chunk("up-1", index)).await.unwrap();
        }

        store.delete_chunks_from("up-1", 2).await.unwrap();
        assert_eq!(store.chunk_count("up-1").await.unwrap(), 2);
        assert!(store.get_chunk("up-1", 2).await.unwrap().is_none());
        assert!(store.get_chunk("up-1", 1).await.unwrap().is_some());

        store.delete_upload("up-1").await.unwrap();
        assert_eq!(store.chunk_count("up-1").await.unwrap(), 0);
        assert!(store
            .get_session(&session_key(Direction::Incoming, "up-1"))
            .await
            .unwrap()
            .is_none());
    }

    pub async fn prune_removes_only_stale(store: &dyn TransferStore) {
        store.put_session(session(Direction::Incoming, "up-old", 1_000)).await.unwrap();
        store.put_chunk(chunk("up-old", 0)).await.unwrap();
        store.put_session(session(Direction::Incoming, "up-new", 9_000)).await.unwrap();

        let removed = store.prune_stale_sessions(10_000, 5_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_session(&session_key(Direction::Incoming, "up-old"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.chunk_count("up-old").await.unwrap(), 0);
        assert!(store
            .get_session(&session_key(Direction::Incoming, "up-new"))
            .await
            .unwrap()
            .is_some());
    }
}
