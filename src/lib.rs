//! # drive-fetch
//!
//! Block-level download pipeline for encrypted remote files.
//!
//! A file revision is stored remotely as an ordered list of encrypted blocks,
//! each with a SHA-256 hash. drive-fetch downloads the blocks in parallel,
//! verifies them, tracks a persisted per-file download state, and turns the
//! verified blocks into one decrypted artifact in either an evictable cache
//! tier or a durable tier for files pinned offline.
//!
//! Everything outside the pipeline (revision catalog, decryption, tree
//! structure, offline marks) is reached through the ports in [`remote`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use drive_fetch::{Collaborators, Config, FileDownloader, GetFileEvent};
//! use tokio_stream::StreamExt;
//!
//! # async fn run(ports: Collaborators, file: drive_fetch::types::FileLink)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = FileDownloader::new(Config::default(), ports).await?;
//!
//! // Subscribe to events
//! let mut events = downloader.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let mut stream = downloader.get_file(file, true, false);
//! while let Some(event) = stream.next().await {
//!     match event {
//!         GetFileEvent::Downloading { percent } => println!("{percent:.0}%"),
//!         GetFileEvent::Decrypting => println!("decrypting"),
//!         GetFileEvent::Ready { path, .. } => println!("ready at {}", path.display()),
//!         GetFileEvent::Error { error } => eprintln!("failed: {error}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Collaborator ports and the HTTP block transport
pub mod remote;
/// Retry logic with exponential backoff
pub mod retry;
/// Tier folders and on-disk layout
pub mod storage;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, PersistenceConfig, RetryConfig};
pub use db::Database;
pub use downloader::{DownloadHandle, FileDownloader};
pub use error::{AssemblyError, Error, GetFileError, Result, VerificationError};
pub use remote::{
    AlwaysConnected, BlockDownloader, Collaborators, ConnectivityProbe, ContentDecryptor,
    DownloadStateStore, HttpBlockDownloader, LinkTree, OfflinePredicate, ProgressSink,
    RevisionRepository,
};
pub use storage::{DirectoryStorageLocator, StorageLocator};
pub use types::{
    Block, DownloadOutcome, DownloadState, Event, FileLink, FolderLink, GetFileEvent, Link,
    Progress, Revision, Tier,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(downloader: FileDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration fails in some sandboxes
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
    }
}
