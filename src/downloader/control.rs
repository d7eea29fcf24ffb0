//! Download control: start (single-flight), cancel, progress, shutdown.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, GetFileError, Result};
use crate::types::{DownloadOutcome, FileId, FileLink, Progress};

use super::FileDownloader;
use super::download_task::{DownloadTaskContext, run_download_task};

/// Registry entry of one running download operation
pub(crate) struct ActiveDownload {
    cancel_token: CancellationToken,
    progress: watch::Receiver<Option<Progress>>,
    outcome: watch::Receiver<Option<DownloadOutcome>>,
    pinned: bool,
}

impl ActiveDownload {
    fn handle(&self, file_id: &FileId) -> DownloadHandle {
        DownloadHandle {
            file_id: file_id.clone(),
            progress: self.progress.clone(),
            outcome: self.outcome.clone(),
            pinned: self.pinned,
        }
    }
}

/// Caller's view of a download operation.
///
/// Every caller that asks for the same file while an operation is running
/// gets a handle onto that one operation.
#[derive(Clone, Debug)]
pub struct DownloadHandle {
    file_id: FileId,
    progress: watch::Receiver<Option<Progress>>,
    outcome: watch::Receiver<Option<DownloadOutcome>>,
    pinned: bool,
}

impl DownloadHandle {
    /// File being downloaded
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Whether the file was marked offline when the operation started
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Latest published progress; `None` until the revision size is known
    pub fn progress(&self) -> Option<Progress> {
        *self.progress.borrow()
    }

    /// Receiver of progress updates
    pub fn progress_receiver(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.clone()
    }

    /// Wait for the operation to finish
    pub async fn wait(&mut self) -> DownloadOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(DownloadOutcome::Cancelled),
            Err(_) => DownloadOutcome::Failed(GetFileError::Other(
                "download task ended without an outcome".to_string(),
            )),
        }
    }
}

impl FileDownloader {
    /// Start downloading the blocks of `file`, or join the operation already
    /// running for it.
    ///
    /// The operation ends with `Downloaded` state committed, or with `Error` /
    /// `NotDownloaded` on failure and cancellation. Returns immediately; use the
    /// handle to follow progress and wait for the outcome.
    pub async fn download(&self, file: &FileLink) -> Result<DownloadHandle> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if file.revision_id.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "file {} has no revision id",
                file.id
            )));
        }

        let pinned = self
            .ports
            .offline
            .is_link_or_ancestor_marked_offline(&file.id)
            .await?;

        let mut active = self.active.lock().await;
        if let Some(running) = active.get(&file.id) {
            tracing::debug!(file_id = %file.id, "Joining running download");
            return Ok(running.handle(&file.id));
        }

        let cancel_token = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(None);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let entry = ActiveDownload {
            cancel_token: cancel_token.clone(),
            progress: progress_rx,
            outcome: outcome_rx,
            pinned,
        };
        let handle = entry.handle(&file.id);
        active.insert(file.id.clone(), entry);
        drop(active);

        let ctx = DownloadTaskContext {
            downloader: self.clone(),
            file: file.clone(),
            cancel_token,
            progress_tx: Arc::new(progress_tx),
        };
        let registry = Arc::clone(&self.active);
        let file_id = file.id.clone();

        tokio::spawn(async move {
            let outcome = run_download_task(ctx).await;
            // Leave the registry before publishing so a new caller starts fresh
            registry.lock().await.remove(&file_id);
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(handle)
    }

    /// Cancel the running download of `file_id`.
    ///
    /// Workers stop at their next block boundary. Finished block files are
    /// kept. Returns `false` when no download is running.
    pub async fn cancel_download(&self, file_id: &FileId) -> bool {
        let active = self.active.lock().await;
        match active.get(file_id) {
            Some(running) => {
                tracing::info!(file_id = %file_id, "Cancelling download");
                running.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the running download of `file_id` and wait until it has unwound.
    ///
    /// Returns the outcome, or `None` when nothing was running.
    pub(crate) async fn cancel_and_wait(&self, file_id: &FileId) -> Option<DownloadOutcome> {
        let mut handle = {
            let active = self.active.lock().await;
            let running = active.get(file_id)?;
            running.cancel_token.cancel();
            running.handle(file_id)
        };
        let outcome = handle.wait().await;
        tracing::debug!(file_id = %file_id, ?outcome, "Download stopped");
        Some(outcome)
    }

    /// Progress percentages of the running download of `file_id`.
    ///
    /// Yields the current value first, then every change. The stream ends
    /// when the operation finishes. `None` when nothing is running.
    pub async fn get_download_progress(
        &self,
        file_id: &FileId,
    ) -> Option<impl tokio_stream::Stream<Item = f32> + Send + 'static> {
        let active = self.active.lock().await;
        active
            .get(file_id)
            .map(|running| {
                WatchStream::new(running.progress.clone()).filter_map(|p| p.map(|p| p.percent()))
            })
    }

    /// Handles of every running download
    pub async fn active_downloads(&self) -> Vec<DownloadHandle> {
        let active = self.active.lock().await;
        active
            .iter()
            .map(|(file_id, running)| running.handle(file_id))
            .collect()
    }

    /// Stop accepting new downloads, cancel running ones and wait for them
    /// to unwind.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.accepting_new.store(false, Ordering::SeqCst);

        let handles = {
            let active = self.active.lock().await;
            for running in active.values() {
                running.cancel_token.cancel();
            }
            active
                .iter()
                .map(|(file_id, running)| running.handle(file_id))
                .collect::<Vec<_>>()
        };

        for mut handle in handles {
            let outcome = handle.wait().await;
            tracing::debug!(file_id = %handle.file_id, ?outcome, "Download stopped");
        }

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
