//! Core downloader implementation split into focused submodules.
//!
//! The `FileDownloader` struct and its methods are organized by pipeline stage:
//! - [`block_transfer`] - Single block download with hash enforcement
//! - [`block_set`] - Skip blocks already valid on disk, queue the rest
//! - [`coordinator`] - Bounded parallel block transfer with shared progress
//! - [`background_tasks`] - Progress reporting
//! - [`verification`] - Re-verify every block and commit `Downloaded`
//! - [`assembly`] - Decrypt verified blocks into the selected storage tier
//! - [`cleanup`] - Block file removal and subtree eviction
//! - [`lifecycle`] - Download state transitions and self-healing
//! - [`download_task`] - One download attempt from `Downloading` to outcome
//! - [`control`] - Single-flight registry, cancel, progress, shutdown
//! - [`get_file`] - State-machine-aware entry point streaming `GetFileEvent`s

mod assembly;
mod background_tasks;
mod block_set;
mod block_transfer;
mod cleanup;
mod control;
mod coordinator;
mod download_task;
mod get_file;
mod lifecycle;
mod verification;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use control::DownloadHandle;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::remote::Collaborators;
use crate::types::{Event, FileId, FileLink, Revision, Tier};

/// Registry of in-flight downloads keyed by file (single-flight)
pub(crate) type ActiveDownloads =
    Arc<tokio::sync::Mutex<HashMap<FileId, control::ActiveDownload>>>;

/// Per-file locks serializing artifact assembly
pub(crate) type AssemblyLocks =
    Arc<tokio::sync::Mutex<HashMap<FileId, Arc<tokio::sync::Mutex<()>>>>>;

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct FileDownloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Collaborator ports
    pub(crate) ports: Collaborators,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// In-flight downloads
    pub(crate) active: ActiveDownloads,
    /// Assembly in progress, one lock per file
    pub(crate) assembly_locks: AssemblyLocks,
    /// Flag to indicate whether new downloads are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl FileDownloader {
    /// Create a new FileDownloader instance
    ///
    /// Validates the configuration and creates both tier roots.
    pub async fn new(config: Config, ports: Collaborators) -> Result<Self> {
        config.validate()?;

        for dir in [&config.download.cache_dir, &config.download.permanent_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create storage directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let (event_tx, _rx) = tokio::sync::broadcast::channel(config.download.event_buffer.max(1));

        tracing::info!(
            parallelism = config.download.parallelism,
            cache_dir = %config.download.cache_dir.display(),
            permanent_dir = %config.download.permanent_dir.display(),
            "File downloader initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            ports,
            event_tx,
            active: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            assembly_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Subscribe to download events
    ///
    /// Each subscriber receives all events independently. A subscriber that
    /// falls more than `event_buffer` events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers; dropped silently when nobody listens
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Tier the artifact of `file` belongs in, from the offline predicate
    pub async fn select_tier(&self, file: &FileLink) -> Result<Tier> {
        let offline = self
            .ports
            .offline
            .is_link_or_ancestor_marked_offline(&file.id)
            .await?;
        Ok(Tier::for_offline(offline))
    }

    /// Revision cache folder of `file` (holds block files)
    pub(crate) fn cache_folder(&self, file: &FileLink) -> std::path::PathBuf {
        self.ports
            .storage
            .cache_folder(&file.user_id, &file.volume_id, &file.revision_id)
    }

    /// Folder of `tier` for `file`'s revision
    pub(crate) fn tier_folder(&self, file: &FileLink, tier: Tier) -> std::path::PathBuf {
        self.ports
            .storage
            .tier_folder(tier, &file.user_id, &file.volume_id, &file.revision_id)
    }

    /// Fetch the revision of `file`, retrying transient failures
    pub(crate) async fn fetch_revision(&self, file: &FileLink) -> Result<Revision> {
        let revisions = Arc::clone(&self.ports.revisions);
        crate::retry::download_with_retry(&self.config.retry, || {
            let revisions = Arc::clone(&revisions);
            async move { revisions.get_revision(&file.id, &file.revision_id).await }
        })
        .await
    }
}
