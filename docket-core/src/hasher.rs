//! Content fingerprints.
//!
//! A [`Digest`] is the SHA-256 of a file's full byte content and nothing
//! else: two files with the same bytes always share a digest regardless of
//! name, location or timestamps. The store uses it for deduplication and the
//! debouncer for move matching.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use tokio::task::spawn_blocking;

use crate::error::{DocketError, Result};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Read buffer size used while streaming a file through the hasher.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 256-bit content digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Option<Self> {
        let decoded = hex::decode(raw.trim()).ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

/// Error returned when a string is not a 64-character hex digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest '{0}'")]
pub struct DigestParseError(pub String);

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| DigestParseError(s.to_string()))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Streams files through SHA-256, retrying while the writer still holds
/// them.
#[derive(Clone, Debug, Default)]
pub struct ContentHasher {
    retry: RetryPolicy,
}

impl ContentHasher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Digest of the file at `path`.
    pub async fn hash(&self, path: &Path) -> Result<Digest> {
        self.fingerprint(path).await.map(|(digest, _)| digest)
    }

    /// Digest and byte length of the file at `path`, with bounded retries.
    pub async fn fingerprint(&self, path: &Path) -> Result<(Digest, u64)> {
        retry_with_backoff(
            &self.retry,
            || hash_file(path),
            is_transient,
        )
        .await
        .map_err(|err| DocketError::IoUnavailable {
            path: path.to_path_buf(),
            attempts: err.attempts,
            source: err.last,
        })
    }

    /// Single attempt, no retries. Used on hot paths where a missing file is
    /// an answer rather than a failure.
    pub async fn probe(&self, path: &Path) -> io::Result<(Digest, u64)> {
        hash_file(path).await
    }

    /// Full contents of the file at `path`, with the same retry budget as
    /// hashing.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        retry_with_backoff(
            &self.retry,
            || tokio::fs::read(path),
            is_transient,
        )
        .await
        .map_err(|err| DocketError::IoUnavailable {
            path: path.to_path_buf(),
            attempts: err.attempts,
            source: err.last,
        })
    }

    pub fn hash_bytes(bytes: &[u8]) -> Digest {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(bytes));
        Digest(out)
    }
}

async fn hash_file(path: &Path) -> io::Result<(Digest, u64)> {
    let path = path.to_path_buf();
    match spawn_blocking(move || hash_file_blocking(&path)).await {
        Ok(result) => result,
        Err(join_err) => Err(io::Error::other(join_err)),
    }
}

fn hash_file_blocking(path: &Path) -> io::Result<(Digest, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok((Digest(out), total))
}

fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::IsADirectory
    )
}
