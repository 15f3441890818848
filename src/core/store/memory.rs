//! In-memory store: the test double, and the fallback when no spool
//! directory is available (private browsing equivalent). State dies with
//! the process, so resume across restarts does not work here; resume
//! within one process lifetime still does.

use super::{session_key, Direction, PersistedChunk, PersistedSession, TransferStore};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, PersistedSession>,
    chunks: HashMap<(String, u32), PersistedChunk>,
}

/// Hash-map backed [`TransferStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn put_session(&self, session: PersistedSession) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.sessions.insert(session.session_key.clone(), session);
        Ok(())
    }

    async fn get_session(&self, key: &str) -> Result<Option<PersistedSession>> {
        Ok(self.tables.lock().unwrap().sessions.get(key).cloned())
    }

    async fn find_outgoing_session_by_fingerprint(
        &self,
        fingerprint: &str,
        remote_peer_id: Option<&str>,
    ) -> Result<Option<PersistedSession>> {
        let tables = self.tables.lock().unwrap();
        let candidates = tables.sessions.values().filter(|s| {
            s.direction == Direction::Outgoing
                && s.status != super::SessionStatus::Completed
                && s.fingerprint.as_deref() == Some(fingerprint)
        });

        let mut best: Option<&PersistedSession> = None;
        for candidate in candidates {
            let better = match best {
                None => true,
                Some(current) => {
                    let candidate_same_peer =
                        remote_peer_id.is_some() && candidate.remote_peer_id.as_deref() == remote_peer_id;
                    let current_same_peer =
                        remote_peer_id.is_some() && current.remote_peer_id.as_deref() == remote_peer_id;
                    match (candidate_same_peer, current_same_peer) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => candidate.updated_at > current.updated_at,
                    }
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        Ok(best.cloned())
    }

    async fn put_chunk(&self, chunk: PersistedChunk) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .chunks
            .insert((chunk.upload_id.clone(), chunk.chunk_index), chunk);
        Ok(())
    }

    async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
    ) -> Result<Option<PersistedChunk>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .chunks
            .get(&(upload_id.to_string(), chunk_index))
            .cloned())
    }

    async fn chunk_count(&self, upload_id: &str) -> Result<u32> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .chunks
            .keys()
            .filter(|(id, _)| id == upload_id)
            .count() as u32)
    }

    async fn delete_chunks_from(&self, upload_id: &str, from_chunk: u32) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .chunks
            .retain(|(id, index), _| id != upload_id || *index < from_chunk);
        Ok(())
    }

    async fn delete_upload(&self, upload_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .sessions
            .remove(&session_key(Direction::Incoming, upload_id));
        tables
            .sessions
            .remove(&session_key(Direction::Outgoing, upload_id));
        tables.chunks.retain(|(id, _), _| id != upload_id);
        Ok(())
    }

    async fn prune_stale_sessions(&self, now_ms: u64, max_age_ms: u64) -> Result<u32> {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let stale: Vec<String> = {
            let tables = self.tables.lock().unwrap();
            tables
                .sessions
                .values()
                .filter(|s| s.updated_at < cutoff)
                .map(|s| s.upload_id.clone())
                .collect()
        };
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

    #[tokio::test]
    async fn session_round_trip() {
        conformance::session_round_trip(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn fingerprint_lookup() {
        conformance::fingerprint_lookup_prefers_peer_and_recency(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn chunks_and_contiguity() {
        conformance::chunk_round_trip_and_contiguity(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn deletion() {
        conformance::delete_from_and_delete_upload(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn pruning() {
        conformance::prune_removes_only_stale(&MemoryStore::new()).await;
    }
}
