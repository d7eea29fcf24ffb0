//! Post-download verification: re-hash every block and commit `Downloaded`.

use crate::error::{Error, Result, VerificationError};
use crate::storage;
use crate::types::{Block, DownloadState, FileLink, Revision};
use crate::utils::{file_exists, hash_matches, remove_file_if_exists, sha256_file};

use super::FileDownloader;

impl FileDownloader {
    /// Verify every block of `revision` on disk and commit `Downloaded`.
    ///
    /// Returns `false` after demoting `file` to `NotDownloaded` when a block
    /// file is missing or its content no longer matches the manifest. Block
    /// files with the wrong content are deleted so the next attempt fetches
    /// them again.
    pub(crate) async fn verify_revision_blocks(&self, file: &FileLink, revision: &Revision) -> bool {
        let localized = match self.localize_blocks(file, revision).await {
            Ok(blocks) => blocks,
            Err(e @ Error::MissingBlockFile { .. }) => {
                tracing::error!(
                    file_id = %file.id,
                    error = %e,
                    "Block reported as downloaded has no local file"
                );
                self.demote(file).await;
                return false;
            }
            Err(e) => {
                tracing::warn!(file_id = %file.id, error = %e, "Block verification failed");
                self.demote(file).await;
                return false;
            }
        };

        let block_count = localized.len();
        let state = DownloadState::Downloaded {
            manifest_signature: revision.manifest_signature.clone(),
            signature_address: revision.signature_address.clone(),
            blocks: localized,
        };

        match self.transition(file, state).await {
            Ok(()) => {
                tracing::info!(file_id = %file.id, block_count, "Blocks verified");
                true
            }
            Err(e) => {
                tracing::error!(file_id = %file.id, error = %e, "Failed to commit downloaded state");
                self.demote(file).await;
                false
            }
        }
    }

    /// Verify `file` against a freshly fetched revision.
    ///
    /// A revision fetch failure sets `DownloadState::Error` and is returned.
    pub async fn verify_downloaded_file(&self, file: &FileLink) -> Result<bool> {
        let revision = match self.fetch_revision(file).await {
            Ok(revision) => revision,
            Err(e) => {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to fetch revision for verification");
                if let Err(state_err) = self.transition(file, DownloadState::Error).await {
                    tracing::error!(file_id = %file.id, error = %state_err, "Failed to record error state");
                }
                return Err(e);
            }
        };
        Ok(self.verify_revision_blocks(file, &revision).await)
    }

    /// Hash each block file and replace its url with the local path
    async fn localize_blocks(&self, file: &FileLink, revision: &Revision) -> Result<Vec<Block>> {
        let cache_folder = self.cache_folder(file);
        let mut localized = Vec::with_capacity(revision.blocks.len());

        for block in revision.ordered_blocks() {
            let path = storage::block_path(&cache_folder, block.index);
            if !file_exists(&path).await {
                return Err(Error::MissingBlockFile {
                    index: block.index,
                    path,
                });
            }

            let actual = sha256_file(&path).await?;
            if !hash_matches(&actual, &block.hash_sha256) {
                if let Err(e) = remove_file_if_exists(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete corrupt block file");
                }
                return Err(Error::Verification(VerificationError::HashMismatch {
                    index: block.index,
                    expected: block.hash_sha256,
                    actual,
                }));
            }

            localized.push(Block {
                url: path.to_string_lossy().into_owned(),
                ..block
            });
        }

        Ok(localized)
    }
}
