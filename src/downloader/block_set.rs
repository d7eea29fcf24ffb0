//! Resolve which blocks of a revision still need a transfer.

use std::path::Path;

use crate::storage;
use crate::types::Block;
use crate::utils::{file_exists, hash_matches, remove_file_if_exists, sha256_file};

use super::coordinator::TransferState;

/// Split `blocks` into already-valid local files and blocks to download.
///
/// A local file whose content hash matches the manifest is kept and its size
/// credited to `state`. A file with the wrong content is deleted. Returns the
/// blocks that must be transferred, in index order.
pub(crate) async fn resolve_pending_blocks(
    cache_folder: &Path,
    blocks: &[Block],
    state: &TransferState,
) -> Vec<Block> {
    let mut ordered: Vec<&Block> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.index);

    let mut pending = Vec::new();
    let mut reused = 0usize;

    for block in ordered {
        let path = storage::block_path(cache_folder, block.index);
        if !file_exists(&path).await {
            pending.push(block.clone());
            continue;
        }

        match sha256_file(&path).await {
            Ok(actual) if hash_matches(&actual, &block.hash_sha256) => {
                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                state.credit(size).await;
                reused += 1;
            }
            Ok(actual) => {
                tracing::debug!(
                    block = block.index,
                    expected = %block.hash_sha256,
                    actual = %actual,
                    "Discarding stale block file"
                );
                discard(&path).await;
                pending.push(block.clone());
            }
            Err(e) => {
                tracing::warn!(block = block.index, error = %e, "Unreadable block file, re-downloading");
                discard(&path).await;
                pending.push(block.clone());
            }
        }
    }

    tracing::debug!(
        cache_folder = %cache_folder.display(),
        reused,
        pending = pending.len(),
        "Resolved block set"
    );

    pending
}

async fn discard(path: &Path) {
    if let Err(e) = remove_file_if_exists(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to delete invalid block file");
    }
}
