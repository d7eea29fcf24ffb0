//! Decrypt verified blocks into the plaintext artifact of the selected tier.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::{AssemblyError, Error, Result};
use crate::storage;
use crate::types::{Block, DownloadState, Event, FileLink, Tier};
use crate::utils::{file_exists, remove_file_if_exists};

use super::FileDownloader;

impl FileDownloader {
    /// Decrypt the verified blocks of `file` into its artifact.
    ///
    /// The tier comes from the offline predicate: permanent when the file or
    /// an ancestor is marked offline, cache otherwise. Blocks are decrypted in
    /// index order into a temporary file that is renamed into place, and any
    /// artifact left in the other tier is removed. Block files are deleted
    /// only after the artifact is complete; on failure they stay on disk.
    ///
    /// Calls for the same file run one at a time. A call that finds the
    /// artifact already assembled returns it without touching the blocks.
    pub async fn decrypt_link_content(
        &self,
        file: &FileLink,
        check_signature: bool,
    ) -> Result<(PathBuf, Tier)> {
        let slot = {
            let mut locks = self.assembly_locks.lock().await;
            Arc::clone(locks.entry(file.id.clone()).or_default())
        };

        let result = {
            let _guard = slot.lock().await;
            self.assemble(file, check_signature).await
        };

        let mut locks = self.assembly_locks.lock().await;
        // Nobody else waits on this file: the map and `slot` are the only owners
        if Arc::strong_count(&slot) == 2 {
            locks.remove(&file.id);
        }
        result
    }

    async fn assemble(&self, file: &FileLink, check_signature: bool) -> Result<(PathBuf, Tier)> {
        let tier = self.select_tier(file).await?;
        if let Some(path) = self.existing_artifact(file, tier).await? {
            tracing::debug!(file_id = %file.id, "Artifact assembled by a concurrent request");
            self.emit_ready(file, &path);
            return Ok((path, tier));
        }

        let state = self.ports.states.get_state(&file.id).await?;
        let state_name = state.name();
        let DownloadState::Downloaded {
            manifest_signature,
            signature_address,
            mut blocks,
        } = state
        else {
            return Err(Error::InvalidArgument(format!(
                "file {} is not downloaded ({})",
                file.id, state_name
            )));
        };
        blocks.sort_by_key(|b| b.index);

        let mut missing = 0usize;
        for block in &blocks {
            if !file_exists(Path::new(&block.url)).await {
                missing += 1;
            }
        }
        if missing > 0 {
            return Err(AssemblyError::MissingBlocks { count: missing }.into());
        }

        let folder = self.tier_folder(file, tier);
        tokio::fs::create_dir_all(&folder).await?;

        if check_signature {
            self.ports
                .decryptor
                .verify_manifest_signature(file, &manifest_signature, &signature_address, &blocks)
                .await?;
        }

        let tag = format!("{:08x}", rand::random::<u32>());
        let partial = storage::partial_artifact_path(&folder, &tag);
        if let Err(e) = self.write_plaintext(file, &blocks, &partial).await {
            if let Err(remove_err) = remove_file_if_exists(&partial).await {
                tracing::warn!(path = %partial.display(), error = %remove_err, "Failed to remove partial artifact");
            }
            tracing::warn!(file_id = %file.id, error = %e, "Decryption failed, keeping block files");
            return Err(e);
        }

        let stale = storage::artifact_path(&self.tier_folder(file, tier.other()));
        if let Err(e) = remove_file_if_exists(&stale).await {
            tracing::warn!(path = %stale.display(), error = %e, "Failed to remove artifact from other tier");
        }

        let artifact = storage::artifact_path(&folder);
        storage::move_file(&partial, &artifact).await?;

        self.delete_blocks(&blocks).await;

        tracing::info!(
            file_id = %file.id,
            tier = ?tier,
            path = %artifact.display(),
            "File decrypted"
        );
        self.emit_ready(file, &artifact);

        Ok((artifact, tier))
    }

    pub(crate) fn emit_ready(&self, file: &FileLink, path: &Path) {
        self.emit_event(Event::Ready {
            file_id: file.id.clone(),
            path: path.to_path_buf(),
        });
    }

    async fn write_plaintext(&self, file: &FileLink, blocks: &[Block], partial: &Path) -> Result<()> {
        let mut out = tokio::fs::File::create(partial).await?;
        for block in blocks {
            let ciphertext = tokio::fs::read(&block.url).await?;
            let plaintext = self
                .ports
                .decryptor
                .decrypt_block(file, block, ciphertext)
                .await?;
            out.write_all(&plaintext).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(())
    }

    /// Existing artifact of `file`, moved into `tier` when it sits in the other one
    pub(crate) async fn existing_artifact(&self, file: &FileLink, tier: Tier) -> Result<Option<PathBuf>> {
        let target = storage::artifact_path(&self.tier_folder(file, tier));
        if file_exists(&target).await {
            return Ok(Some(target));
        }

        let other = storage::artifact_path(&self.tier_folder(file, tier.other()));
        if !file_exists(&other).await {
            return Ok(None);
        }

        tracing::debug!(
            file_id = %file.id,
            from = %other.display(),
            to = %target.display(),
            "Moving artifact between tiers"
        );
        storage::move_file(&other, &target).await?;
        Ok(Some(target))
    }
}
