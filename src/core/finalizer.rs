//! Streaming finalizer: reassemble persisted chunks into the delivered file.
//!
//! Walks chunk indices in order, feeding bytes into a chunk sink and
//! accumulating the chunk-checksum list; the file checksum derived from
//! that list is compared against the sender's value before the sink
//! commits. Two sinks, chosen once per finalize:
//!
//! - disk sink (preferred when an output directory is configured): writes
//!   incrementally to a temp file, atomic rename at close;
//! - memory sink fallback: concatenates buffers.
//!
//! Both release temp resources on abort and retain nothing after close.

use crate::core::integrity::derive_file_checksum;
use crate::core::store::TransferStore;
use crate::core::transfer::FileMetadata;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Where the reassembled bytes ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Disk,
    Memory,
}

/// The reassembled file.
#[derive(Debug)]
pub enum AssembledFile {
    Disk(PathBuf),
    Memory(Vec<u8>),
}

/// Result of one finalization pass.
#[derive(Debug)]
pub enum FinalizeOutcome {
    Complete {
        file: AssembledFile,
        file_checksum: String,
        storage_mode: StorageMode,
    },
    /// First gap found while walking the store.
    MissingChunk { chunk_index: u32 },
    /// Derived checksum disagreed with the sender's.
    ChecksumMismatch { computed: String },
}

// ── Sinks ────────────────────────────────────────────────────────────────────

enum ChunkSink {
    Disk {
        temp_path: PathBuf,
        final_path: PathBuf,
        file: File,
    },
    Memory(Vec<u8>),
}

impl ChunkSink {
    async fn disk(output_dir: &Path, name: &str, upload_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(output_dir).await?;
        let final_path = output_dir.join(sanitize_file_name(name));
        let temp_path = output_dir.join(format!(".{}.partial", sanitize_file_name(upload_id)));
        let file = File::create(&temp_path).await?;
        Ok(Self::Disk {
            temp_path,
            final_path,
            file,
        })
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            ChunkSink::Disk { file, .. } => {
                file.write_all(bytes).await?;
                Ok(())
            }
            ChunkSink::Memory(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    async fn close(self) -> Result<AssembledFile> {
        match self {
            ChunkSink::Disk {
                temp_path,
                final_path,
                mut file,
            } => {
                file.flush().await?;
                drop(file);
                tokio::fs::rename(&temp_path, &final_path).await.map_err(|e| {
                    anyhow!(
                        "rename {} -> {}: {}",
                        temp_path.display(),
                        final_path.display(),
                        e
                    )
                })?;
                Ok(AssembledFile::Disk(final_path))
            }
            ChunkSink::Memory(buffer) => Ok(AssembledFile::Memory(buffer)),
        }
    }

    async fn abort(self) {
        if let ChunkSink::Disk { temp_path, file, .. } = self {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                warn!(
                    event = "finalize_temp_cleanup_failure",
                    path = %temp_path.display(),
                    error = %e,
                    "Failed to remove partial file after abort"
                );
            }
        }
    }
}

/// Received file names come from the remote peer; keep only the final path
/// component and a safe alphabet.
fn sanitize_file_name(name: &str) -> String {
    let last = name
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .next_back()
        .map(str::to_string)
        .unwrap_or_default();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        safe
    }
}

// ── Finalizer ────────────────────────────────────────────────────────────────

/// Reassembles a completed upload from the persistent store.
pub struct Finalizer {
    /// Destination for the streaming disk sink; `None` forces the memory
    /// sink.
    output_dir: Option<PathBuf>,
}

impl Finalizer {
    pub fn with_output_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(dir.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self { output_dir: None }
    }

    /// Walk chunks `0..total_chunks` for this upload, stream them into the
    /// sink, and verify the derived file checksum when the sender supplied
    /// one.
    pub async fn finalize(
        &self,
        store: &dyn TransferStore,
        metadata: &FileMetadata,
        expected_checksum: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let upload_id = metadata.effective_upload_id();

        let (mut sink, storage_mode) = match &self.output_dir {
            Some(dir) => (
                ChunkSink::disk(dir, &metadata.name, upload_id).await?,
                StorageMode::Disk,
            ),
            None => (
                ChunkSink::Memory(Vec::with_capacity(metadata.size as usize)),
                StorageMode::Memory,
            ),
        };

        let mut chunk_checksums: Vec<String> = Vec::with_capacity(metadata.total_chunks as usize);

        for chunk_index in 0..metadata.total_chunks {
            let Some(chunk) = store.get_chunk(upload_id, chunk_index).await? else {
                sink.abort().await;
                return Ok(FinalizeOutcome::MissingChunk { chunk_index });
            };
            if let Err(e) = sink.write(&chunk.bytes).await {
                sink.abort().await;
                return Err(e);
            }
            chunk_checksums.push(chunk.checksum);
        }

        let file_checksum = derive_file_checksum(&chunk_checksums);
        if let Some(expected) = expected_checksum {
            if file_checksum != expected {
                sink.abort().await;
                return Ok(FinalizeOutcome::ChecksumMismatch {
                    computed: file_checksum,
                });
            }
        }

        let file = sink.close().await?;
        info!(
            event = "finalize_complete",
            upload_id = %upload_id,
            name = %metadata.name,
            bytes = metadata.size,
            mode = ?storage_mode,
            "Reassembled received file"
        );
        Ok(FinalizeOutcome::Complete {
            file,
            file_checksum,
            storage_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::integrity::hash_bytes;
    use crate::core::store::memory::MemoryStore;
    use crate::core::store::PersistedChunk;
    use crate::core::transfer::PROTOCOL_VERSION;

    fn metadata(upload_id: &str, size: u64, chunk_size: u32, total_chunks: u32) -> FileMetadata {
        FileMetadata {
            id: upload_id.into(),
            upload_id: Some(upload_id.into()),
            protocol_version: PROTOCOL_VERSION,
            name: "data.bin".into(),
            size,
            mime: String::new(),
            chunk_size,
            total_chunks,
            file_checksum: None,
            fingerprint: None,
        }
    }

    async fn seed_chunks(store: &MemoryStore, upload_id: &str, payloads: &[&[u8]]) -> Vec<String> {
        let mut checksums = Vec::new();
        for (index, payload) in payloads.iter().enumerate() {
            let checksum = hash_bytes(payload);
            checksums.push(checksum.clone());
            store
                .put_chunk(PersistedChunk {
                    upload_id: upload_id.into(),
                    chunk_index: index as u32,
                    bytes: payload.to_vec(),
                    checksum,
                    size: payload.len() as u32,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }
        checksums
    }

    #[tokio::test]
    async fn memory_sink_reassembles_in_order() {
        let store = MemoryStore::new();
        let checksums = seed_chunks(&store, "up-1", &[b"aaaa", b"bbbb", b"cc"]).await;
        let expected = derive_file_checksum(&checksums);

        let outcome = Finalizer::in_memory()
            .finalize(&store, &metadata("up-1", 10, 4, 3), Some(&expected))
            .await
            .unwrap();

        match outcome {
            FinalizeOutcome::Complete {
                file: AssembledFile::Memory(bytes),
                file_checksum,
                storage_mode,
            } => {
                assert_eq!(bytes, b"aaaabbbbcc");
                assert_eq!(file_checksum, expected);
                assert_eq!(storage_mode, StorageMode::Memory);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disk_sink_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        seed_chunks(&store, "up-1", &[b"hello ", b"world"]).await;

        let outcome = Finalizer::with_output_dir(dir.path())
            .finalize(&store, &metadata("up-1", 11, 6, 2), None)
            .await
            .unwrap();

        match outcome {
            FinalizeOutcome::Complete {
                file: AssembledFile::Disk(path),
                storage_mode,
                ..
            } => {
                assert_eq!(storage_mode, StorageMode::Disk);
                assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
                assert_eq!(path.file_name().unwrap(), "data.bin");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // No partial file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn reports_first_gap() {
        let store = MemoryStore::new();
        seed_chunks(&store, "up-1", &[b"aaaa"]).await;

        let outcome = Finalizer::in_memory()
            .finalize(&store, &metadata("up-1", 12, 4, 3), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FinalizeOutcome::MissingChunk { chunk_index: 1 }
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts_disk_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        seed_chunks(&store, "up-1", &[b"aaaa"]).await;

        let outcome = Finalizer::with_output_dir(dir.path())
            .finalize(&store, &metadata("up-1", 4, 4, 1), Some("not-the-checksum"))
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::ChecksumMismatch { .. }));

        // Neither the final file nor the partial survives.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn zero_chunk_file_completes_empty() {
        let store = MemoryStore::new();
        let expected = derive_file_checksum(&[]);
        let outcome = Finalizer::in_memory()
            .finalize(&store, &metadata("up-1", 0, 65_536, 0), Some(&expected))
            .await
            .unwrap();
        match outcome {
            FinalizeOutcome::Complete {
                file: AssembledFile::Memory(bytes),
                ..
            } => assert!(bytes.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn hostile_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("///"), "file");
        assert_eq!(sanitize_file_name("safe name-1.bin"), "safe name-1.bin");
    }
}
