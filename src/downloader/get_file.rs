//! State-machine-aware entry point that turns a file into a plaintext artifact.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GetFileError;
use crate::types::{DownloadOutcome, Event, FileLink, GetFileEvent};

use super::FileDownloader;
use super::lifecycle::state_matches_revision;

/// Buffered events per `get_file` stream
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Why a request stopped without a terminal event
enum Abandoned {
    ReceiverGone,
}

impl FileDownloader {
    /// Materialize `file` and stream what happens along the way.
    ///
    /// 1. An artifact already on disk is returned at once (moved to the tier
    ///    the offline predicate selects when needed).
    /// 2. The stored state is self-healed and compared with the current revision.
    /// 3. When not downloaded, blocks are downloaded with `Downloading` progress.
    ///    Without connectivity and `retryable == false` this fails with
    ///    [`GetFileError::NoConnection`].
    /// 4. Verified blocks are decrypted: `Decrypting`, then `Ready`.
    ///
    /// The stream ends after `Ready` or `Error`. Dropping it cancels the
    /// underlying download unless the file is marked offline.
    pub fn get_file(
        &self,
        file: FileLink,
        check_signature: bool,
        retryable: bool,
    ) -> ReceiverStream<GetFileEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let downloader = self.clone();
        tokio::spawn(async move {
            if let Err(Abandoned::ReceiverGone) = downloader
                .run_get_file(&file, check_signature, retryable, &tx)
                .await
            {
                tracing::debug!(file_id = %file.id, "get_file receiver dropped");
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_get_file(
        &self,
        file: &FileLink,
        check_signature: bool,
        retryable: bool,
        tx: &mpsc::Sender<GetFileEvent>,
    ) -> Result<(), Abandoned> {
        let fail = |error: GetFileError| async move {
            tracing::debug!(file_id = %file.id, error = %error, "get_file failed");
            send(tx, GetFileEvent::Error { error }).await
        };

        let tier = match self.select_tier(file).await {
            Ok(tier) => tier,
            Err(e) => return fail(GetFileError::from(&e)).await,
        };

        match self.existing_artifact(file, tier).await {
            Ok(Some(path)) => {
                self.emit_ready(file, &path);
                return send(tx, GetFileEvent::Ready { path, tier }).await;
            }
            Ok(None) => {}
            Err(e) => return fail(GetFileError::from(&e)).await,
        }

        let state = match self.self_heal(file).await {
            Ok(state) => state,
            Err(e) => return fail(GetFileError::from(&e)).await,
        };

        // A concurrent request may have assembled the artifact and released the blocks
        if !state.is_downloaded()
            && let Ok(Some(path)) = self.existing_artifact(file, tier).await
        {
            self.emit_ready(file, &path);
            return send(tx, GetFileEvent::Ready { path, tier }).await;
        }

        let connected = self.ports.connectivity.is_connected_to_network();
        let downloaded = if state.is_downloaded() {
            match self.fetch_revision(file).await {
                Ok(revision) => state_matches_revision(&state, &revision),
                Err(_) if !connected => {
                    // Verified blocks on disk are usable without the catalog
                    true
                }
                Err(e) => return fail(GetFileError::from(&e)).await,
            }
        } else {
            false
        };

        if !downloaded {
            if !connected && !retryable {
                return fail(GetFileError::NoConnection).await;
            }
            match self.follow_download(file, tx).await? {
                DownloadOutcome::Downloaded => {}
                DownloadOutcome::Cancelled => return fail(GetFileError::Cancelled).await,
                DownloadOutcome::Failed(error) => return fail(error).await,
            }
        }

        send(tx, GetFileEvent::Decrypting).await?;
        self.emit_event(Event::Decrypting {
            file_id: file.id.clone(),
        });

        match self.decrypt_link_content(file, check_signature).await {
            Ok((path, tier)) => send(tx, GetFileEvent::Ready { path, tier }).await,
            Err(e) => fail(GetFileError::from(&e)).await,
        }
    }

    /// Start or join the download of `file`, forwarding progress until it ends
    async fn follow_download(
        &self,
        file: &FileLink,
        tx: &mpsc::Sender<GetFileEvent>,
    ) -> Result<DownloadOutcome, Abandoned> {
        let mut handle = match self.download(file).await {
            Ok(handle) => handle,
            Err(e) => return Ok(DownloadOutcome::Failed(GetFileError::from(&e))),
        };

        let mut progress = handle.progress_receiver();
        let mut progress_open = true;
        let mut last_sent: Option<f32> = None;

        loop {
            let current = progress.borrow_and_update().map(|p| p.percent());
            if current.is_some() && current != last_sent {
                last_sent = current;
                let percent = current.unwrap_or_default();
                if send(tx, GetFileEvent::Downloading { percent }).await.is_err() {
                    self.abandon(&handle).await;
                    return Err(Abandoned::ReceiverGone);
                }
            }

            tokio::select! {
                biased;
                changed = progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                    }
                }
                outcome = handle.wait() => {
                    // Final progress is published before the outcome
                    let last = progress.borrow_and_update().map(|p| p.percent());
                    if last.is_some() && last != last_sent {
                        let percent = last.unwrap_or_default();
                        send(tx, GetFileEvent::Downloading { percent }).await?;
                    }
                    return Ok(outcome);
                }
                _ = tx.closed() => {
                    self.abandon(&handle).await;
                    return Err(Abandoned::ReceiverGone);
                }
            }
        }
    }

    /// The caller went away; offline files keep downloading
    async fn abandon(&self, handle: &super::DownloadHandle) {
        if handle.is_pinned() {
            tracing::debug!(file_id = %handle.file_id(), "Caller gone, offline download continues");
            return;
        }
        self.cancel_download(handle.file_id()).await;
    }
}

async fn send(tx: &mpsc::Sender<GetFileEvent>, event: GetFileEvent) -> Result<(), Abandoned> {
    tx.send(event).await.map_err(|_| Abandoned::ReceiverGone)
}
