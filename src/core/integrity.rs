//! Integrity primitives: chunk/file hashing, fingerprints, chunk math.
//!
//! Both endpoints must run the same hash build or checksums will mismatch;
//! the selection is a build-time constant (SHA-256 by default, 32-bit
//! FNV-1a behind the `fnv-fallback` feature) with no wire negotiation.

/// Hash a byte slice to a lowercase hex string.
#[cfg(not(feature = "fnv-fallback"))]
pub fn hash_bytes(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// FNV-1a fallback for runtimes without SHA-256. Deterministic, 32-bit,
/// non-cryptographic; acceptable only because both peers are built alike.
#[cfg(feature = "fnv-fallback")]
pub fn hash_bytes(bytes: &[u8]) -> String {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:08x}", hash)
}

/// Derive the file-level checksum from the ordered list of chunk checksums.
///
/// Hash of the list joined by `'\n'`: deterministic and order-sensitive,
/// so both ends agree on the file checksum without re-hashing the file.
pub fn derive_file_checksum(chunk_checksums: &[String]) -> String {
    hash_bytes(chunk_checksums.join("\n").as_bytes())
}

/// Sender-local file identity used for resume matching. Never sent on the
/// wire.
pub fn fingerprint(name: &str, size: u64, mime: &str, last_modified: u64) -> String {
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    format!("{}::{}::{}::{}", name, size, mime, last_modified)
}

/// Number of chunks needed to cover `size` bytes. Zero for an empty file.
pub fn total_chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Bytes covered by chunks `0..chunk_index`, saturating at `size`.
pub fn bytes_for_chunk_index(chunk_index: u32, chunk_size: u32, size: u64) -> u64 {
    (chunk_index as u64 * chunk_size as u64).min(size)
}

/// Clamp an untrusted chunk index to `[0, total_chunks]`, flooring
/// non-integers. Wire peers may send arbitrary numbers here.
pub fn normalize_chunk_index(value: f64, total_chunks: u32) -> u32 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    if value.is_infinite() {
        return total_chunks;
    }
    (value.floor() as u64).min(total_chunks as u64) as u32
}
