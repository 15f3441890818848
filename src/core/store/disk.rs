//! Disk-backed store: JSON session records plus a chunk spool.
//!
//! Layout under the root directory:
//!
//!   sessions/<direction>_<upload_id>.json
//!   chunks/<upload_id>/<index>.chunk      raw chunk bytes
//!   chunks/<upload_id>/<index>.json       {checksum, size, updated_at}
//!
//! All writes go through the atomic temp-then-rename helper. The chunk
//! meta file is written after the payload and acts as the commit marker:
//! a payload without meta reads as absent.

use super::{session_key, Direction, PersistedChunk, PersistedSession, TransferStore};
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Serialize, Deserialize)]
struct ChunkMeta {
    checksum: String,
    size: u32,
    updated_at: u64,
}

/// Filesystem-backed [`TransferStore`].
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions"))
            .with_context(|| format!("create store at {}", root.display()))?;
        std::fs::create_dir_all(root.join("chunks"))?;
        Ok(Self { root })
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{}.json", safe_name(key)))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join("chunks").join(safe_name(upload_id))
    }

    fn chunk_paths(&self, upload_id: &str, index: u32) -> (PathBuf, PathBuf) {
        let dir = self.upload_dir(upload_id);
        (
            dir.join(format!("{index}.chunk")),
            dir.join(format!("{index}.json")),
        )
    }

    fn read_session_file(path: &Path) -> Option<PersistedSession> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(
                    event = "session_record_parse_failure",
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable session record"
                );
                None
            }
        }
    }

    fn all_sessions(&self) -> Result<Vec<PersistedSession>> {
        let mut sessions = Vec::new();
        let dir = self.root.join("sessions");
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(session) = Self::read_session_file(&path) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }
}

/// Upload ids arrive from the remote peer; restrict them to a filesystem-
/// safe alphabet before they touch a path. UUIDs pass through unchanged.
fn safe_name(value: &str) -> String {
    let safe: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        .map(|c| if c == ':' { '_' } else { c })
        .collect();
    if safe.is_empty() {
        "upload".to_string()
    } else {
        safe
    }
}

#[async_trait]
impl TransferStore for DiskStore {
    async fn put_session(&self, session: PersistedSession) -> Result<()> {
        let path = self.session_path(&session.session_key);
        let content = serde_json::to_vec_pretty(&session)?;
        atomic_write(&path, &content)
    }

    async fn get_session(&self, key: &str) -> Result<Option<PersistedSession>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Self::read_session_file(&path))
    }

    async fn find_outgoing_session_by_fingerprint(
        &self,
        fingerprint: &str,
        remote_peer_id: Option<&str>,
    ) -> Result<Option<PersistedSession>> {
        let mut best: Option<PersistedSession> = None;
        for session in self.all_sessions()? {
            if session.direction != Direction::Outgoing
                || session.status == super::SessionStatus::Completed
                || session.fingerprint.as_deref() != Some(fingerprint)
            {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    let session_same_peer = remote_peer_id.is_some()
                        && session.remote_peer_id.as_deref() == remote_peer_id;
                    let current_same_peer = remote_peer_id.is_some()
                        && current.remote_peer_id.as_deref() == remote_peer_id;
                    match (session_same_peer, current_same_peer) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => session.updated_at > current.updated_at,
                    }
                }
            };
            if better {
                best = Some(session);
            }
        }
        Ok(best)
    }

    async fn put_chunk(&self, chunk: PersistedChunk) -> Result<()> {
        let (payload_path, meta_path) = self.chunk_paths(&chunk.upload_id, chunk.chunk_index);
        atomic_write(&payload_path, &chunk.bytes)?;
        let meta = ChunkMeta {
            checksum: chunk.checksum,
            size: chunk.size,
            updated_at: chunk.updated_at,
        };
        atomic_write(&meta_path, &serde_json::to_vec(&meta)?)
    }

    async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
    ) -> Result<Option<PersistedChunk>> {
        let (payload_path, meta_path) = self.chunk_paths(upload_id, chunk_index);
        if !meta_path.exists() || !payload_path.exists() {
            return Ok(None);
        }
        let meta: ChunkMeta = serde_json::from_slice(&std::fs::read(&meta_path)?)?;
        let bytes = std::fs::read(&payload_path)?;
        Ok(Some(PersistedChunk {
            upload_id: upload_id.to_string(),
            chunk_index,
            bytes,
            checksum: meta.checksum,
            size: meta.size,
            updated_at: meta.updated_at,
        }))
    }

    async fn chunk_count(&self, upload_id: &str) -> Result<u32> {
        let dir = self.upload_dir(upload_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_chunks_from(&self, upload_id: &str, from_chunk: u32) -> Result<()> {
        let dir = self.upload_dir(upload_id);
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(index) = stem.parse::<u32>() {
                if index >= from_chunk {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    async fn delete_upload(&self, upload_id: &str) -> Result<()> {
        let _ = std::fs::remove_file(self.session_path(&session_key(Direction::Incoming, upload_id)));
        let _ = std::fs::remove_file(self.session_path(&session_key(Direction::Outgoing, upload_id)));
        let dir = self.upload_dir(upload_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn prune_stale_sessions(&self, now_ms: u64, max_age_ms: u64) -> Result<u32> {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let stale: Vec<String> = self
            .all_sessions()?
            .into_iter()
            .filter(|s| s.updated_at < cutoff)
            .map(|s| s.upload_id)
            .collect();
        for upload_id in &stale {
            self.delete_upload(upload_id).await?;
        }
        Ok(stale.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;

    fn store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("spool")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (_dir, store) = store();
        conformance::session_round_trip(&store).await;
    }

    #[tokio::test]
    async fn fingerprint_lookup() {
        let (_dir, store) = store();
        conformance::fingerprint_lookup_prefers_peer_and_recency(&store).await;
    }

    #[tokio::test]
    async fn chunks_and_contiguity() {
        let (_dir, store) = store();
        conformance::chunk_round_trip_and_contiguity(&store).await;
    }

    #[tokio::test]
    async fn deletion() {
        let (_dir, store) = store();
        conformance::delete_from_and_delete_upload(&store).await;
    }

    #[tokio::test]
    async fn pruning() {
        let (_dir, store) = store();
        conformance::prune_removes_only_stale(&store).await;
    }

    #[test]
    fn hostile_upload_ids_stay_inside_the_spool() {
        assert_eq!(safe_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(safe_name("incoming:abc-123"), "incoming_abc-123");
        assert_eq!(safe_name("///"), "upload");
    }

    #[tokio::test]
    async fn payload_without_meta_reads_as_absent() {
        let (_dir, store) = store();
        let (payload_path, _) = store.chunk_paths("up-x", 0);
        std::fs::create_dir_all(payload_path.parent().unwrap()).unwrap();
        std::fs::write(&payload_path, b"orphan").unwrap();
        assert!(store.get_chunk("up-x", 0).await.unwrap().is_none());
        assert_eq!(store.chunk_count("up-x").await.unwrap(), 0);
    }
}
