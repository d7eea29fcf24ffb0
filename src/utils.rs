//! Utility functions for hashing and file removal

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Lowercase hex SHA-256 of a file's content, streamed in fixed-size chunks
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether a content hash matches a manifest hash (case-insensitive hex)
pub fn hash_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

/// Remove a file, treating an already-missing file as success.
///
/// Returns `true` when a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether a regular file exists at `path`
pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn file_hash_matches_slice_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        let data = vec![7u8; HASH_BUFFER_SIZE * 2 + 13];
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(sha256_file(&path).await.unwrap(), sha256_hex(&data));
    }

    #[test]
    fn hash_comparison_ignores_case() {
        assert!(hash_matches("abcdef", "ABCDEF"));
        assert!(!hash_matches("abcdef", "abcdee"));
    }

    #[tokio::test]
    async fn removing_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_file_if_exists(&path).await.unwrap());

        tokio::fs::write(&path, b"x").await.unwrap();
        assert!(file_exists(&path).await);
        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!file_exists(&path).await);
    }
}
