//! Download state transitions and self-healing.
//!
//! Every state write of the pipeline goes through [`FileDownloader::transition`],
//! which rejects moves the lifecycle does not allow:
//!
//! ```text
//! NotDownloaded ──▶ Downloading ──▶ Downloaded
//!       ▲               │    ▲          │
//!       │               ▼    │          │
//!       └────────────── Error ◀─────────┘ (revision fetch failure)
//! ```
//!
//! `NotDownloaded` is reachable from every state (cancel, demotion, cleanup) and
//! every state may restart at `Downloading`.

use crate::error::{Error, Result};
use crate::types::{DownloadState, FileLink, Revision};
use crate::utils::{file_exists, hash_matches};

use super::FileDownloader;

/// Whether the lifecycle allows moving from `from` to `to`
pub(crate) fn can_transition(from: &DownloadState, to: &DownloadState) -> bool {
    use DownloadState::*;
    match (from, to) {
        (_, NotDownloaded) => true,
        (_, Downloading) => true,
        (Downloading | Downloaded { .. }, Downloaded { .. }) => true,
        (Downloading | Downloaded { .. }, Error) => true,
        _ => false,
    }
}

/// Whether a `Downloaded` state was committed for exactly the blocks of `revision`
pub(crate) fn state_matches_revision(state: &DownloadState, revision: &Revision) -> bool {
    let DownloadState::Downloaded { blocks, .. } = state else {
        return false;
    };
    if blocks.len() != revision.blocks.len() {
        return false;
    }
    let mut local: Vec<_> = blocks.iter().collect();
    local.sort_by_key(|b| b.index);
    local
        .iter()
        .zip(revision.ordered_blocks().iter())
        .all(|(l, r)| l.index == r.index && hash_matches(&l.hash_sha256, &r.hash_sha256))
}

impl FileDownloader {
    /// Persist a lifecycle transition for `file`
    pub(crate) async fn transition(&self, file: &FileLink, to: DownloadState) -> Result<()> {
        let from = self.ports.states.get_state(&file.id).await?;
        if !can_transition(&from, &to) {
            return Err(Error::InvalidTransition {
                link_id: file.id.to_string(),
                from: from.name(),
                to: to.name(),
            });
        }

        tracing::debug!(
            file_id = %file.id,
            from = from.name(),
            to = to.name(),
            "Download state transition"
        );
        self.ports
            .states
            .set_state(&file.volume_id, &file.id, &to)
            .await
    }

    /// Demote `file` to `NotDownloaded`, logging instead of failing
    pub(crate) async fn demote(&self, file: &FileLink) {
        if let Err(e) = self.transition(file, DownloadState::NotDownloaded).await {
            tracing::error!(file_id = %file.id, error = %e, "Failed to demote download state");
        }
    }

    /// Current state of `file`, demoted first when a `Downloaded` record
    /// references block files that no longer exist.
    pub async fn self_heal(&self, file: &FileLink) -> Result<DownloadState> {
        let state = self.ports.states.get_state(&file.id).await?;
        let DownloadState::Downloaded { blocks, .. } = &state else {
            return Ok(state);
        };

        let mut missing = 0usize;
        for block in blocks {
            if !file_exists(std::path::Path::new(&block.url)).await {
                missing += 1;
            }
        }
        if missing == 0 {
            return Ok(state);
        }

        tracing::info!(
            file_id = %file.id,
            missing,
            "Downloaded state references missing block files, demoting"
        );
        self.transition(file, DownloadState::NotDownloaded).await?;
        Ok(DownloadState::NotDownloaded)
    }

    /// Whether `file` is `Downloaded` for its current revision with every
    /// block file present
    pub async fn is_downloaded(&self, file: &FileLink) -> Result<bool> {
        let state = self.self_heal(file).await?;
        if !state.is_downloaded() {
            return Ok(false);
        }
        let revision = self.fetch_revision(file).await?;
        Ok(state_matches_revision(&state, &revision))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;

    fn downloaded(blocks: Vec<Block>) -> DownloadState {
        DownloadState::Downloaded {
            manifest_signature: "sig".into(),
            signature_address: "addr".into(),
            blocks,
        }
    }

    fn block(index: u32, hash: &str) -> Block {
        Block {
            index,
            url: format!("/blocks/{index}"),
            hash_sha256: hash.into(),
        }
    }

    #[test]
    fn lifecycle_rejects_skipping_downloading() {
        use DownloadState::*;
        assert!(can_transition(&NotDownloaded, &Downloading));
        assert!(can_transition(&Downloading, &downloaded(vec![])));
        assert!(can_transition(&Downloading, &Error));
        assert!(can_transition(&Error, &Downloading));
        assert!(can_transition(&downloaded(vec![]), &NotDownloaded));
        assert!(!can_transition(&NotDownloaded, &downloaded(vec![])));
        assert!(!can_transition(&Error, &downloaded(vec![])));
        assert!(!can_transition(&NotDownloaded, &Error));
    }

    #[test]
    fn downloaded_state_matches_revision_by_index_and_hash() {
        let revision = Revision {
            id: "r1".into(),
            size: 2,
            blocks: vec![block(1, "bb"), block(0, "aa")],
            manifest_signature: "sig".into(),
            signature_address: "addr".into(),
        };

        assert!(state_matches_revision(
            &downloaded(vec![block(0, "AA"), block(1, "bb")]),
            &revision
        ));
        assert!(!state_matches_revision(&downloaded(vec![block(0, "aa")]), &revision));
        assert!(!state_matches_revision(
            &downloaded(vec![block(0, "aa"), block(1, "cc")]),
            &revision
        ));
        assert!(!state_matches_revision(&DownloadState::Downloading, &revision));
    }
}
