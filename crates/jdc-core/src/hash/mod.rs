//! Streaming file digests for end-to-end verification.
//!
//! The receiver picks the algorithm from the file size: md5 is fast enough
//! below 50 GiB, blake2b (256-bit) takes over above it. sha256 is recognized
//! on the wire but never auto-selected. Hashing always re-reads the file from
//! offset zero with a bounded buffer, so memory stays flat for terabyte
//! inputs.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use blake2::Blake2b;
use digest::consts::U32;
use digest::Digest;
use md5::Md5;
use sha2::Sha256;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Files at or above this size hash with blake2b instead of md5 (50 GiB).
pub const LARGE_FILE_THRESHOLD: u64 = 50 * 1024 * 1024 * 1024;

/// Read buffer used while streaming a file through a hasher (4 MiB).
pub const HASH_BUFFER_SIZE: usize = 4 * 1024 * 1024;

type Blake2b256 = Blake2b<U32>;

/// Digest algorithms understood by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// MD5, 128-bit digest (32 hex chars)
    Md5,
    /// SHA-256, 256-bit digest (64 hex chars)
    Sha256,
    /// BLAKE2b-256, 256-bit digest (64 hex chars)
    Blake2b,
}

impl HashAlgorithm {
    /// Wire token for this algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Blake2b => "blake2b",
        }
    }

    /// Length of the hex-encoded digest.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 | Self::Blake2b => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake2b" => Ok(Self::Blake2b),
            other => Err(Error::protocol(
                "hash_algorithm",
                format!("unsupported algorithm: {other}"),
            )),
        }
    }
}

/// Pick the verification algorithm for a file of the given size.
#[must_use]
pub fn select_algorithm(file_size: u64) -> HashAlgorithm {
    if file_size < LARGE_FILE_THRESHOLD {
        HashAlgorithm::Md5
    } else {
        HashAlgorithm::Blake2b
    }
}

/// Compute the lowercase hex digest of a file with the given algorithm.
///
/// The file is opened fresh and streamed from offset zero to EOF.
///
/// # Errors
///
/// Returns a filesystem error if the file cannot be opened or read.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    hash_file_with_buffer(path, algorithm, HASH_BUFFER_SIZE).await
}

/// [`hash_file`] with an explicit buffer size (the digest is independent of
/// the buffer size; this exists for tests and tuning).
///
/// # Errors
///
/// Returns a filesystem error if the file cannot be opened or read.
pub async fn hash_file_with_buffer(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => stream_digest::<Md5>(path, buffer_size).await,
        HashAlgorithm::Sha256 => stream_digest::<Sha256>(path, buffer_size).await,
        HashAlgorithm::Blake2b => stream_digest::<Blake2b256>(path, buffer_size).await,
    }
}

async fn stream_digest<D: Digest>(path: &Path, buffer_size: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::filesystem("open_hash", e))?;

    let mut hasher = D::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| Error::filesystem("read_hash", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_select_algorithm_threshold() {
        assert_eq!(select_algorithm(0), HashAlgorithm::Md5);
        assert_eq!(select_algorithm(1024 * 1024), HashAlgorithm::Md5);
        assert_eq!(select_algorithm(49 * GIB), HashAlgorithm::Md5);
        assert_eq!(select_algorithm(50 * GIB - 1), HashAlgorithm::Md5);
        assert_eq!(select_algorithm(50 * GIB), HashAlgorithm::Blake2b);
        assert_eq!(select_algorithm(2048 * GIB), HashAlgorithm::Blake2b);
    }

    #[test]
    fn test_algorithm_round_trip() {
        for algo in [
            HashAlgorithm::Md5,
            HashAlgorithm::Sha256,
            HashAlgorithm::Blake2b,
        ] {
            assert_eq!(algo.as_str().parse::<HashAlgorithm>().unwrap(), algo);
        }
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn test_known_md5_digest() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("known.txt");
        std::fs::write(&path, b"hello world").expect("write");

        let digest = hash_file(&path, HashAlgorithm::Md5).await.expect("hash");
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_digest_lengths_and_hex() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"Hello, World! This is a test file for hash verification.")
            .expect("write");

        for algo in [
            HashAlgorithm::Md5,
            HashAlgorithm::Sha256,
            HashAlgorithm::Blake2b,
        ] {
            let digest = hash_file(&path, algo).await.expect("hash");
            assert_eq!(digest.len(), algo.hex_len(), "length for {algo}");
            assert!(
                digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
                "digest must be lowercase hex: {digest}"
            );
        }
    }

    #[tokio::test]
    async fn test_digest_independent_of_buffer_size() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("buffered.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).expect("write");

        let small = hash_file_with_buffer(&path, HashAlgorithm::Blake2b, 7)
            .await
            .expect("hash small buffer");
        let large = hash_file_with_buffer(&path, HashAlgorithm::Blake2b, 1 << 20)
            .await
            .expect("hash large buffer");
        assert_eq!(small, large);
    }

    #[tokio::test]
    async fn test_digest_stable_across_calls() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("stable.bin");
        std::fs::write(&path, b"Consistency test content for hash verification.").expect("write");

        let first = hash_file(&path, HashAlgorithm::Md5).await.expect("hash");
        let second = hash_file(&path, HashAlgorithm::Md5).await.expect("hash");
        assert_eq!(first, second);
    }
}
