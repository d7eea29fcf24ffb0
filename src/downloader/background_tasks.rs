//! Background task for progress reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::types::{Event, FileId, Progress};

use super::coordinator::TransferState;

/// Parameters for spawning a progress reporter background task
pub(crate) struct ProgressReporterParams {
    /// File being downloaded
    pub file_id: FileId,
    /// Counter of the running attempt
    pub state: Arc<TransferState>,
    /// Progress channel shared with every attached caller
    pub progress_tx: Arc<watch::Sender<Option<Progress>>>,
    /// Event broadcast sender
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Interval between emissions
    pub interval: Duration,
    /// Stops the reporter
    pub cancel_token: tokio_util::sync::CancellationToken,
}

/// Spawn a background task that periodically reports download progress.
pub(crate) fn spawn_progress_reporter(
    params: ProgressReporterParams,
) -> tokio::task::JoinHandle<()> {
    let ProgressReporterParams {
        file_id,
        state,
        progress_tx,
        event_tx,
        interval,
        cancel_token,
    } = params;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let progress = state.progress().await;
                    publish_progress(&file_id, &progress_tx, &event_tx, progress);
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    })
}

/// Publish `progress` unless it would move the stream backwards.
///
/// The channel holds `None` until the revision size is known. A retried
/// attempt starts a fresh counter; the stream keeps its high-water mark until
/// the new attempt passes it.
pub(crate) fn publish_progress(
    file_id: &FileId,
    progress_tx: &watch::Sender<Option<Progress>>,
    event_tx: &tokio::sync::broadcast::Sender<Event>,
    progress: Progress,
) {
    let changed = progress_tx.send_if_modified(|current| {
        let advanced = match current {
            None => true,
            Some(c) => progress.total != c.total || progress.downloaded > c.downloaded,
        };
        if advanced {
            *current = Some(progress);
        }
        advanced
    });

    if changed {
        event_tx
            .send(Event::Progress {
                file_id: file_id.clone(),
                percent: progress.percent(),
                downloaded_bytes: progress.downloaded,
                total_bytes: progress.total,
            })
            .ok();
    }
}
