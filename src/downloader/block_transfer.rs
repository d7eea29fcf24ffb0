//! Single block download with content hash enforcement.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, VerificationError};
use crate::remote::{BlockDownloader, ProgressSink};
use crate::storage;
use crate::types::{Block, RevisionId, UserId};
use crate::utils::{hash_matches, remove_file_if_exists, sha256_file};

/// Everything needed to fetch one block of one revision
pub(crate) struct BlockTransfer<'a> {
    pub user_id: &'a UserId,
    pub revision_id: &'a RevisionId,
    /// Revision cache folder; the block lands in `<cache_folder>/blocks/<index>`
    pub cache_folder: &'a Path,
    pub transport: &'a dyn BlockDownloader,
    pub cancel: &'a CancellationToken,
}

impl BlockTransfer<'_> {
    /// Download `block` and check its SHA-256 against the manifest.
    ///
    /// On any failure the local block file is removed before the error is
    /// returned, so a failed transfer never leaves a file behind.
    pub(crate) async fn run(&self, block: &Block, progress: &dyn ProgressSink) -> Result<PathBuf> {
        if self.revision_id.is_empty() {
            return Err(Error::InvalidArgument(
                "revision id must not be empty".to_string(),
            ));
        }

        let destination = storage::block_path(self.cache_folder, block.index);
        let result = self.fetch_and_verify(block, &destination, progress).await;

        if let Err(e) = &result {
            tracing::debug!(
                revision_id = %self.revision_id,
                block = block.index,
                error = %e,
                "Block transfer failed"
            );
            if let Err(remove_err) = remove_file_if_exists(&destination).await {
                tracing::warn!(
                    path = %destination.display(),
                    error = %remove_err,
                    "Failed to remove block file after failed transfer"
                );
            }
        }

        result
    }

    async fn fetch_and_verify(
        &self,
        block: &Block,
        destination: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(storage::blocks_dir(self.cache_folder)).await?;

        let path = self
            .transport
            .download_url(self.user_id, &block.url, destination, progress, self.cancel)
            .await?;

        let actual = sha256_file(&path).await?;
        if !hash_matches(&actual, &block.hash_sha256) {
            return Err(Error::Verification(VerificationError::HashMismatch {
                index: block.index,
                expected: block.hash_sha256.clone(),
                actual,
            }));
        }

        tracing::trace!(block = block.index, path = %path.display(), "Block transferred");
        Ok(path)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::test_helpers::{FakeRemote, NullProgress, block_for};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn verified_block_is_kept_at_its_index() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::default();
        let block = block_for(&remote, "r1", 3, b"ciphertext");
        let cancel = CancellationToken::new();
        let transfer = BlockTransfer {
            user_id: &"u1".into(),
            revision_id: &"r1".into(),
            cache_folder: dir.path(),
            transport: &remote,
            cancel: &cancel,
        };

        let path = transfer.run(&block, &NullProgress).await.unwrap();

        assert_eq!(path, storage::block_path(dir.path(), 3));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"ciphertext");
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::default();
        let mut block = block_for(&remote, "r1", 0, b"ciphertext");
        block.hash_sha256 = crate::utils::sha256_hex(b"something else");
        let cancel = CancellationToken::new();
        let transfer = BlockTransfer {
            user_id: &"u1".into(),
            revision_id: &"r1".into(),
            cache_folder: dir.path(),
            transport: &remote,
            cancel: &cancel,
        };

        let err = transfer.run(&block, &NullProgress).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Verification(VerificationError::HashMismatch { index: 0, .. })
        ));
        assert!(!storage::block_path(dir.path(), 0).exists());
    }

    #[tokio::test]
    async fn transport_failure_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::default();
        let block = block_for(&remote, "r1", 1, b"ciphertext");
        remote.fail_url(&block.url);
        let cancel = CancellationToken::new();
        let transfer = BlockTransfer {
            user_id: &"u1".into(),
            revision_id: &"r1".into(),
            cache_folder: dir.path(),
            transport: &remote,
            cancel: &cancel,
        };

        assert!(transfer.run(&block, &NullProgress).await.is_err());
        assert!(!storage::block_path(dir.path(), 1).exists());
    }

    #[tokio::test]
    async fn empty_revision_id_is_rejected_before_any_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::default();
        let block = block_for(&remote, "r1", 0, b"ciphertext");
        let cancel = CancellationToken::new();
        let transfer = BlockTransfer {
            user_id: &"u1".into(),
            revision_id: &"".into(),
            cache_folder: dir.path(),
            transport: &remote,
            cancel: &cancel,
        };

        let err = transfer.run(&block, &NullProgress).await.unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(remote.transfers.load(Ordering::SeqCst), 0);
    }
}
