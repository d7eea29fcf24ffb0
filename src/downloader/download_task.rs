//! Download task orchestration: top-level lifecycle for a single file download.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, GetFileError, Result};
use crate::types::{DownloadOutcome, DownloadState, Event, FileLink, Progress, Revision};

use super::FileDownloader;
use super::background_tasks::{ProgressReporterParams, publish_progress, spawn_progress_reporter};
use super::block_set::resolve_pending_blocks;
use super::coordinator::{CoordinatorParams, TransferState, download_blocks};

/// Download and verification rounds before blocks are declared invalid
const VERIFY_ATTEMPTS: u32 = 2;

/// Everything one spawned download operation owns
pub(crate) struct DownloadTaskContext {
    pub downloader: FileDownloader,
    pub file: FileLink,
    pub cancel_token: CancellationToken,
    pub progress_tx: Arc<watch::Sender<Option<Progress>>>,
}

impl DownloadTaskContext {
    /// Record a failure: state `Error`, event, outcome
    async fn fail(&self, error: Error) -> DownloadOutcome {
        tracing::error!(file_id = %self.file.id, error = %error, "Download failed");
        if let Err(e) = self.downloader.transition(&self.file, DownloadState::Error).await {
            tracing::error!(file_id = %self.file.id, error = %e, "Failed to record error state");
        }
        self.downloader.emit_event(Event::DownloadFailed {
            file_id: self.file.id.clone(),
            error: error.to_string(),
        });
        DownloadOutcome::Failed(GetFileError::from(&error))
    }

    /// Record a cancellation; finished block files stay for the next attempt
    async fn cancelled(&self) -> DownloadOutcome {
        tracing::info!(file_id = %self.file.id, "Download cancelled");
        self.downloader.demote(&self.file).await;
        self.downloader.emit_event(Event::DownloadCancelled {
            file_id: self.file.id.clone(),
        });
        DownloadOutcome::Cancelled
    }

    async fn fetch_revision(&self) -> Result<Revision> {
        tokio::select! {
            result = self.downloader.fetch_revision(&self.file) => result,
            _ = self.cancel_token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Resolve the block set and transfer whatever is missing
    async fn transfer_revision(&self, revision: &Revision) -> Result<()> {
        let downloader = &self.downloader;
        let cache_folder = downloader.cache_folder(&self.file);
        let state = Arc::new(TransferState::new(revision.size));

        let pending = resolve_pending_blocks(&cache_folder, &revision.blocks, &state).await;
        publish_progress(
            &self.file.id,
            &self.progress_tx,
            &downloader.event_tx,
            state.progress().await,
        );

        let reporter_token = self.cancel_token.child_token();
        let reporter = spawn_progress_reporter(ProgressReporterParams {
            file_id: self.file.id.clone(),
            state: Arc::clone(&state),
            progress_tx: Arc::clone(&self.progress_tx),
            event_tx: downloader.event_tx.clone(),
            interval: downloader.config.download.progress_interval,
            cancel_token: reporter_token.clone(),
        });

        let result = download_blocks(
            CoordinatorParams {
                user_id: &self.file.user_id,
                revision_id: &self.file.revision_id,
                cache_folder: &cache_folder,
                transport: downloader.ports.blocks.as_ref(),
                parallelism: downloader.config.download.parallelism,
                cancel: &self.cancel_token,
            },
            &state,
            pending,
        )
        .await;

        reporter_token.cancel();
        reporter.await.ok();
        publish_progress(
            &self.file.id,
            &self.progress_tx,
            &downloader.event_tx,
            state.progress().await,
        );

        result
    }
}

/// Core download task: orchestrates one download operation end to end.
///
/// Phases:
/// 1. Self-heal the stored state and transition to `Downloading`
/// 2. Fetch the revision
/// 3. Transfer blocks not already valid on disk, in parallel
/// 4. Verify every block and commit `Downloaded`; on failure re-download once
pub(crate) async fn run_download_task(ctx: DownloadTaskContext) -> DownloadOutcome {
    let file = &ctx.file;
    let downloader = &ctx.downloader;

    if let Err(e) = downloader.self_heal(file).await {
        return ctx.fail(e).await;
    }

    downloader.emit_event(Event::DownloadStarted {
        file_id: file.id.clone(),
        revision_id: file.revision_id.clone(),
    });

    if let Err(e) = downloader.transition(file, DownloadState::Downloading).await {
        return ctx.fail(e).await;
    }

    let revision = match ctx.fetch_revision().await {
        Ok(revision) => revision,
        Err(Error::Cancelled) => return ctx.cancelled().await,
        Err(e) => return ctx.fail(e).await,
    };

    tracing::info!(
        file_id = %file.id,
        revision_id = %revision.id,
        blocks = revision.blocks.len(),
        size = revision.size,
        "Downloading revision"
    );

    for attempt in 1..=VERIFY_ATTEMPTS {
        if attempt > 1
            && let Err(e) = downloader.transition(file, DownloadState::Downloading).await
        {
            return ctx.fail(e).await;
        }

        match ctx.transfer_revision(&revision).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return ctx.cancelled().await,
            Err(e @ Error::Verification(_)) => {
                // The corrupt block file is already gone; the next round fetches it again
                tracing::warn!(
                    file_id = %file.id,
                    attempt,
                    max_attempts = VERIFY_ATTEMPTS,
                    error = %e,
                    "Block failed hash verification during transfer"
                );
                downloader.demote(file).await;
                continue;
            }
            Err(e) => return ctx.fail(e).await,
        }

        if downloader.verify_revision_blocks(file, &revision).await {
            downloader.emit_event(Event::BlocksVerified {
                file_id: file.id.clone(),
                block_count: revision.blocks.len(),
            });
            return DownloadOutcome::Downloaded;
        }

        tracing::warn!(
            file_id = %file.id,
            attempt,
            max_attempts = VERIFY_ATTEMPTS,
            "Block verification failed after download"
        );
    }

    downloader.emit_event(Event::DownloadFailed {
        file_id: file.id.clone(),
        error: GetFileError::InvalidBlocks.to_string(),
    });
    DownloadOutcome::Failed(GetFileError::InvalidBlocks)
}
