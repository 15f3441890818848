//! Sendable file sources.
//!
//! The sender slices ranges out of a source on demand; it never loads the
//! whole file. Disk sources seek-and-read per chunk; byte sources exist
//! for tests and for small in-memory payloads (clipboard-style shares).

use crate::core::integrity::fingerprint;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Where the bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

/// One file queued for sending.
#[derive(Debug, Clone)]
pub struct SendFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// Modification time in ms; part of the fingerprint, and checked again
    /// at completion time to catch mid-transfer edits.
    pub last_modified: u64,
    pub source: FileSource,
}

impl SendFile {
    /// Build a source from a disk path, capturing size and mtime.
    pub async fn from_path(path: impl Into<PathBuf>, mime: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?
            .to_string();
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            name,
            mime: mime.into(),
            size: metadata.len(),
            last_modified,
            source: FileSource::Path(path),
        })
    }

    /// Build an in-memory source.
    pub fn from_bytes(
        name: impl Into<String>,
        mime: impl Into<String>,
        last_modified: u64,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            size: bytes.len() as u64,
            last_modified,
            source: FileSource::Bytes(Arc::new(bytes)),
        }
    }

    /// Sender-local identity for resume matching.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.name, self.size, &self.mime, self.last_modified)
    }

    /// Read `[start, end)`, clamped to the file size.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let end = end.min(self.size);
        if start >= end {
            return Ok(Vec::new());
        }
        let len = (end - start) as usize;
        match &self.source {
            FileSource::Bytes(bytes) => Ok(bytes[start as usize..end as usize].to_vec()),
            FileSource::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }

    /// Current modification time of the underlying source, for detecting
    /// edits between offer and completion. Byte sources are immutable.
    pub async fn current_last_modified(&self) -> Result<u64> {
        match &self.source {
            FileSource::Bytes(_) => Ok(self.last_modified),
            FileSource::Path(path) => {
                let metadata = tokio::fs::metadata(path).await?;
                Ok(metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn byte_source_slices_and_clamps() {
        let file = SendFile::from_bytes("a.bin", "", 7, (0u8..100).collect());
        assert_eq!(file.size, 100);
        assert_eq!(file.read_range(10, 20).await.unwrap(), (10u8..20).collect::<Vec<_>>());
        assert_eq!(file.read_range(90, 200).await.unwrap().len(), 10);
        assert!(file.read_range(200, 300).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, (0u8..50).collect::<Vec<_>>()).unwrap();

        let file = SendFile::from_path(&path, "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(file.name, "data.bin");
        assert_eq!(file.size, 50);
        assert_eq!(file.read_range(5, 8).await.unwrap(), vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn fingerprint_uses_capture_time_mtime() {
        let file = SendFile::from_bytes("a.bin", "", 42, vec![1, 2, 3]);
        assert_eq!(file.fingerprint(), "a.bin::3::application/octet-stream::42");
        assert_eq!(file.current_last_modified().await.unwrap(), 42);
    }
}
