//! Integrity digests sent with each object PUT.

use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::{HASH_BUFFER_SIZE, TransferError};

/// Computes the integrity digest sent alongside an upload.
///
/// Implementations are synchronous; callers run them on a blocking pool.
pub trait ContentHasher: Send + Sync {
    /// HTTP header the digest travels in.
    fn header_name(&self) -> &'static str;

    /// Hashes the file at `path` and returns the header value.
    fn hash_file(&self, path: &Path) -> Result<String, TransferError>;
}

/// MD5 digest, base64-encoded, for the standard `Content-MD5` header.
///
/// S3-compatible stores verify this on PUT and reject mismatches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl ContentHasher for Md5Hasher {
    fn header_name(&self) -> &'static str {
        "Content-MD5"
    }

    fn hash_file(&self, path: &Path) -> Result<String, TransferError> {
        let digest = stream_digest::<Md5>(path)?;
        Ok(STANDARD.encode(digest))
    }
}

/// SHA-256 digest, hex-encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn header_name(&self) -> &'static str {
        "x-content-sha256"
    }

    fn hash_file(&self, path: &Path) -> Result<String, TransferError> {
        let digest = stream_digest::<Sha256>(path)?;
        Ok(hex::encode(digest))
    }
}

fn stream_digest<D: Digest>(path: &Path) -> Result<Vec<u8>, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
