//! Local storage layout: cache and permanent tiers, block and artifact paths.
//!
//! Every revision owns one folder per tier. Block files are always written to
//! the cache folder under `blocks/`, named by block index. The decrypted
//! artifact lives in exactly one of the two tier folders.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{RevisionId, Tier, UserId, VolumeId};

/// Name of the sub-folder holding downloaded block files
pub const BLOCKS_DIR: &str = "blocks";

/// File name of the decrypted artifact inside a tier folder
pub const ARTIFACT_FILE_NAME: &str = "content";

/// Suffix of an artifact that is still being written
const PARTIAL_SUFFIX: &str = ".partial";

/// Resolves tier folders for a revision
///
/// Both methods must be deterministic for the same inputs.
pub trait StorageLocator: Send + Sync {
    /// Evictable folder for `(user, volume, revision)`
    fn cache_folder(&self, user_id: &UserId, volume_id: &VolumeId, revision_id: &RevisionId)
    -> PathBuf;

    /// Durable folder for `(user, volume, revision)`
    fn permanent_folder(
        &self,
        user_id: &UserId,
        volume_id: &VolumeId,
        revision_id: &RevisionId,
    ) -> PathBuf;

    /// Folder of the given tier
    fn tier_folder(
        &self,
        tier: Tier,
        user_id: &UserId,
        volume_id: &VolumeId,
        revision_id: &RevisionId,
    ) -> PathBuf {
        match tier {
            Tier::Cache => self.cache_folder(user_id, volume_id, revision_id),
            Tier::Permanent => self.permanent_folder(user_id, volume_id, revision_id),
        }
    }
}

/// `<root>/<user>/<volume>/<revision>` under two configured roots
#[derive(Clone, Debug)]
pub struct DirectoryStorageLocator {
    cache_root: PathBuf,
    permanent_root: PathBuf,
}

impl DirectoryStorageLocator {
    /// Create a locator over the two tier roots
    pub fn new(cache_root: impl Into<PathBuf>, permanent_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            permanent_root: permanent_root.into(),
        }
    }

    fn under(root: &Path, user_id: &UserId, volume_id: &VolumeId, revision_id: &RevisionId) -> PathBuf {
        root.join(user_id.as_str())
            .join(volume_id.as_str())
            .join(revision_id.as_str())
    }
}

impl StorageLocator for DirectoryStorageLocator {
    fn cache_folder(
        &self,
        user_id: &UserId,
        volume_id: &VolumeId,
        revision_id: &RevisionId,
    ) -> PathBuf {
        Self::under(&self.cache_root, user_id, volume_id, revision_id)
    }

    fn permanent_folder(
        &self,
        user_id: &UserId,
        volume_id: &VolumeId,
        revision_id: &RevisionId,
    ) -> PathBuf {
        Self::under(&self.permanent_root, user_id, volume_id, revision_id)
    }
}

/// Folder holding block files inside a revision's cache folder
pub fn blocks_dir(cache_folder: &Path) -> PathBuf {
    cache_folder.join(BLOCKS_DIR)
}

/// Local file of block `index`
pub fn block_path(cache_folder: &Path, index: u32) -> PathBuf {
    blocks_dir(cache_folder).join(index.to_string())
}

/// Decrypted artifact inside a tier folder
pub fn artifact_path(tier_folder: &Path) -> PathBuf {
    tier_folder.join(ARTIFACT_FILE_NAME)
}

/// Temporary artifact written before the final rename.
///
/// `tag` keeps concurrent writers in the same folder apart.
pub fn partial_artifact_path(tier_folder: &Path, tag: &str) -> PathBuf {
    tier_folder.join(format!("{}.{}{}", ARTIFACT_FILE_NAME, tag, PARTIAL_SUFFIX))
}

/// Move a file with a single rename, creating the destination's parent.
///
/// Any file already at `to` is replaced atomically.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(from, to).await?;
    Ok(())
}
