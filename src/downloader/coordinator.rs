//! Bounded parallel block transfer with shared progress accounting.
//!
//! One [`TransferState`] exists per download attempt. It holds the queue of
//! blocks still to fetch and the byte counter behind the progress stream,
//! both behind a single mutex. Workers pop one block at a time, so a block is
//! never handed to two workers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::remote::{BlockDownloader, ProgressSink};
use crate::types::{Block, Progress, RevisionId, UserId};

use super::block_transfer::BlockTransfer;

struct Shared {
    pending: Vec<Block>,
    downloaded_bytes: u64,
}

/// Pending block queue and byte counter of one download attempt
pub(crate) struct TransferState {
    total_bytes: u64,
    shared: tokio::sync::Mutex<Shared>,
}

impl TransferState {
    pub(crate) fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            shared: tokio::sync::Mutex::new(Shared {
                pending: Vec::new(),
                downloaded_bytes: 0,
            }),
        }
    }

    /// Count bytes already present locally
    pub(crate) async fn credit(&self, bytes: u64) {
        self.shared.lock().await.downloaded_bytes += bytes;
    }

    /// Snapshot of bytes present versus revision size
    pub(crate) async fn progress(&self) -> Progress {
        Progress {
            downloaded: self.shared.lock().await.downloaded_bytes,
            total: self.total_bytes,
        }
    }

    async fn enqueue(&self, blocks: Vec<Block>) {
        let mut shared = self.shared.lock().await;
        // Workers pop from the back; keep the lowest index there
        shared.pending.extend(blocks.into_iter().rev());
    }

    async fn next_block(&self) -> Option<Block> {
        self.shared.lock().await.pending.pop()
    }

    async fn pending_len(&self) -> usize {
        self.shared.lock().await.pending.len()
    }
}

/// Per-block progress sink feeding the shared counter
struct BlockProgress<'a> {
    state: &'a TransferState,
    transferred: AtomicU64,
}

#[async_trait::async_trait]
impl ProgressSink for BlockProgress<'_> {
    async fn advance(&self, bytes: u64) {
        let mut shared = self.state.shared.lock().await;
        shared.downloaded_bytes += bytes;
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Parameters for transferring the pending blocks of one revision
pub(crate) struct CoordinatorParams<'a> {
    pub user_id: &'a UserId,
    pub revision_id: &'a RevisionId,
    pub cache_folder: &'a Path,
    pub transport: &'a dyn BlockDownloader,
    pub parallelism: usize,
    pub cancel: &'a CancellationToken,
}

/// Transfer every block in `pending` using at most `parallelism` workers.
///
/// The first failing block fails the whole operation; remaining workers stop
/// at their next block boundary and their results are discarded. Returns
/// [`Error::Cancelled`] when `cancel` fires before the queue drains.
pub(crate) async fn download_blocks(
    params: CoordinatorParams<'_>,
    state: &TransferState,
    pending: Vec<Block>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let worker_count = params.parallelism.max(1).min(pending.len());
    state.enqueue(pending).await;

    // Tripped by the first failing worker, or by the caller's cancellation
    let abort = params.cancel.child_token();
    let transfer = BlockTransfer {
        user_id: params.user_id,
        revision_id: params.revision_id,
        cache_folder: params.cache_folder,
        transport: params.transport,
        cancel: &abort,
    };

    tracing::debug!(
        revision_id = %params.revision_id,
        workers = worker_count,
        "Starting block workers"
    );

    let workers = (0..worker_count).map(|worker| run_worker(worker, &transfer, state, &abort));
    let results = futures::future::join_all(workers).await;

    let mut cancelled = false;
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => return Err(e),
        }
    }

    if cancelled || (params.cancel.is_cancelled() && state.pending_len().await > 0) {
        return Err(Error::Cancelled);
    }

    Ok(())
}

async fn run_worker(
    worker: usize,
    transfer: &BlockTransfer<'_>,
    state: &TransferState,
    abort: &CancellationToken,
) -> Result<()> {
    loop {
        if abort.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Some(block) = state.next_block().await else {
            return Ok(());
        };

        let progress = BlockProgress {
            state,
            transferred: AtomicU64::new(0),
        };

        match transfer.run(&block, &progress).await {
            Ok(_) => {
                tracing::trace!(
                    worker,
                    block = block.index,
                    bytes = progress.transferred.load(Ordering::Relaxed),
                    "Block complete"
                );
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(worker, block = block.index, error = %e, "Block failed, aborting download");
                abort.cancel();
                return Err(e);
            }
        }
    }
}
