//! Block file removal and subtree eviction.
//!
//! Errors are logged as warnings but never fail the caller: a file that
//! cannot be deleted now is picked up by the next cleanup or self-heal.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage;
use crate::types::{Block, DownloadState, Event, FileLink, Link, LinkId, Tier, VolumeId};
use crate::utils::{file_exists, remove_file_if_exists};

use super::FileDownloader;

impl FileDownloader {
    /// Delete the block files referenced by `blocks` (local urls).
    ///
    /// Already-missing files are fine. Returns the number of files removed.
    pub(crate) async fn delete_blocks(&self, blocks: &[Block]) -> usize {
        let mut deleted = 0;
        let mut dirs = Vec::new();

        for block in blocks {
            let path = Path::new(&block.url);
            match remove_file_if_exists(path).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete block file"),
            }
            if let Some(parent) = path.parent()
                && !dirs.iter().any(|d: &&Path| *d == parent)
            {
                dirs.push(parent);
            }
        }

        // Only succeeds once the directory is empty
        for dir in dirs {
            if dir.file_name().is_some_and(|n| n == storage::BLOCKS_DIR) {
                tokio::fs::remove_dir(dir).await.ok();
            }
        }

        debug!(deleted, total = blocks.len(), "block files removed");
        deleted
    }

    /// Delete every block file referenced by the stored state of `file`
    pub async fn delete_block_files(&self, file: &FileLink) -> usize {
        match self.ports.states.get_state(&file.id).await {
            Ok(state) => self.delete_blocks(state.blocks()).await,
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "failed to read state for block cleanup");
                0
            }
        }
    }

    /// Release a link and everything below it.
    ///
    /// Files lose their download state and block files, and their artifact is
    /// moved back to the cache tier. Folders lose their own state and are
    /// walked recursively. Any link that is itself marked offline, or sits
    /// under an offline ancestor, is left untouched along with its subtree.
    pub async fn cleanup(&self, volume_id: &VolumeId, link_id: &LinkId) -> Result<()> {
        let link = self
            .ports
            .links
            .get_link(volume_id, link_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("link {} in volume {}", link_id, volume_id)))?;

        info!(volume_id = %volume_id, link_id = %link_id, "cleaning up link");
        self.cleanup_link(&link).await;
        Ok(())
    }

    fn cleanup_link<'a>(&'a self, link: &'a Link) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match self
                .ports
                .offline
                .is_link_or_ancestor_marked_offline(link.id())
                .await
            {
                Ok(false) => {}
                Ok(true) => {
                    debug!(link_id = %link.id(), "link is marked offline, skipping");
                    return;
                }
                Err(e) => {
                    warn!(link_id = %link.id(), error = %e, "offline check failed, skipping link");
                    return;
                }
            }

            match link {
                Link::File(file) => self.release_file(file).await,
                Link::Folder(folder) => {
                    if let Err(e) = self.ports.states.remove_state(&folder.id).await {
                        warn!(link_id = %folder.id, error = %e, "failed to remove folder state");
                    }

                    let children = match self.ports.links.get_descendants(folder, false).await {
                        Ok(children) => children,
                        Err(e) => {
                            warn!(link_id = %folder.id, error = %e, "failed to list folder children");
                            return;
                        }
                    };
                    for child in &children {
                        self.cleanup_link(child).await;
                    }
                }
            }
        })
    }

    async fn release_file(&self, file: &FileLink) {
        // A running download could still commit `Downloaded` over the removed state
        self.cancel_and_wait(&file.id).await;

        let state = match self.ports.states.get_state(&file.id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "failed to read download state");
                DownloadState::NotDownloaded
            }
        };

        // Demote before touching files so no reader sees Downloaded without blocks
        if let Err(e) = self.ports.states.remove_state(&file.id).await {
            warn!(file_id = %file.id, error = %e, "failed to remove download state, keeping files");
            return;
        }

        let deleted = self.delete_blocks(state.blocks()).await;

        // Leftovers of interrupted attempts are not referenced by any state
        let leftovers = storage::blocks_dir(&self.cache_folder(file));
        match tokio::fs::remove_dir_all(&leftovers).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %leftovers.display(), error = %e, "failed to remove block folder"),
        }

        let permanent = storage::artifact_path(&self.tier_folder(file, Tier::Permanent));
        if file_exists(&permanent).await {
            let cache = storage::artifact_path(&self.tier_folder(file, Tier::Cache));
            if let Err(e) = storage::move_file(&permanent, &cache).await {
                warn!(file_id = %file.id, error = %e, "failed to move artifact to cache tier");
            }
        }

        debug!(file_id = %file.id, deleted_blocks = deleted, "released file");
        self.emit_event(Event::CleanedUp {
            link_id: file.id.clone(),
        });
    }
}
