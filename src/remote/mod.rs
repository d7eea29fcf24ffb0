//! Collaborator ports consumed by the download pipeline.
//!
//! Everything the pipeline needs from the outside world (remote catalog,
//! block transport, decryption, persisted state, tree structure, connectivity)
//! is reached through the narrow traits in this module. [`Collaborators`]
//! bundles one implementation of each for [`FileDownloader`](crate::FileDownloader).

mod http;

pub use http::HttpBlockDownloader;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AssemblyError, Result};
use crate::storage::{DirectoryStorageLocator, StorageLocator};
use crate::types::{
    Block, DownloadState, FileId, FileLink, FolderLink, Link, LinkId, Revision, RevisionId,
    StateUpdate, UserId, VolumeId,
};

/// Remote catalog of file revisions
#[async_trait::async_trait]
pub trait RevisionRepository: Send + Sync {
    /// Fetch a revision and its block manifest.
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when the catalog has no such revision.
    async fn get_revision(&self, file_id: &FileId, revision_id: &RevisionId) -> Result<Revision>;
}

/// Receives byte counts while a block is streamed to disk
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    /// Record `bytes` more bytes written
    async fn advance(&self, bytes: u64);
}

/// Transport that copies one remote block to a local file
#[async_trait::async_trait]
pub trait BlockDownloader: Send + Sync {
    /// Download `url` into `destination`, reporting bytes to `progress`.
    ///
    /// Implementations may poll `cancel` while streaming and return
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    async fn download_url(
        &self,
        user_id: &UserId,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// Answers whether a link or one of its ancestors is marked for offline use
#[async_trait::async_trait]
pub trait OfflinePredicate: Send + Sync {
    /// True when `link_id` or any ancestor folder is pinned offline
    async fn is_link_or_ancestor_marked_offline(&self, link_id: &LinkId) -> Result<bool>;
}

/// Opaque decryption capability
///
/// Reassembly order is owned by the caller: blocks are handed over one at a
/// time in index order.
#[async_trait::async_trait]
pub trait ContentDecryptor: Send + Sync {
    /// Verify the manifest signature over `blocks`
    async fn verify_manifest_signature(
        &self,
        file: &FileLink,
        manifest_signature: &str,
        signature_address: &str,
        blocks: &[Block],
    ) -> std::result::Result<(), AssemblyError>;

    /// Decrypt one verified block
    async fn decrypt_block(
        &self,
        file: &FileLink,
        block: &Block,
        ciphertext: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, AssemblyError>;
}

/// Persisted per-link download state
#[async_trait::async_trait]
pub trait DownloadStateStore: Send + Sync {
    /// Current state; `NotDownloaded` when no record exists
    async fn get_state(&self, link_id: &LinkId) -> Result<DownloadState>;

    /// Replace the state of a link; `NotDownloaded` removes the record
    async fn set_state(
        &self,
        volume_id: &VolumeId,
        link_id: &LinkId,
        state: &DownloadState,
    ) -> Result<()>;

    /// Remove the record of a link
    async fn remove_state(&self, link_id: &LinkId) -> Result<()>;

    /// Stream of committed changes
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateUpdate>;
}

/// Tree structure of a volume
#[async_trait::async_trait]
pub trait LinkTree: Send + Sync {
    /// Look up a single link
    async fn get_link(&self, volume_id: &VolumeId, link_id: &LinkId) -> Result<Option<Link>>;

    /// Direct children of `folder`; `refresh` bypasses any local listing cache
    async fn get_descendants(&self, folder: &FolderLink, refresh: bool) -> Result<Vec<Link>>;
}

/// Network reachability probe
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the device currently has network connectivity
    fn is_connected_to_network(&self) -> bool;
}

/// Probe for environments that are always online (servers, tests)
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysConnected;

impl ConnectivityProbe for AlwaysConnected {
    fn is_connected_to_network(&self) -> bool {
        true
    }
}

/// One implementation of every collaborator port
#[derive(Clone)]
pub struct Collaborators {
    /// Remote revision catalog
    pub revisions: Arc<dyn RevisionRepository>,
    /// Block transport
    pub blocks: Arc<dyn BlockDownloader>,
    /// Cache/permanent folder locator
    pub storage: Arc<dyn StorageLocator>,
    /// Offline pin predicate
    pub offline: Arc<dyn OfflinePredicate>,
    /// Decryption capability
    pub decryptor: Arc<dyn ContentDecryptor>,
    /// Persisted download state
    pub states: Arc<dyn DownloadStateStore>,
    /// Volume tree
    pub links: Arc<dyn LinkTree>,
    /// Connectivity probe
    pub connectivity: Arc<dyn ConnectivityProbe>,
}

impl Collaborators {
    /// Bundle the host's ports with the built-in implementations configured
    /// from `config`.
    ///
    /// Tier folders come from `download.cache_dir` / `download.permanent_dir`,
    /// blocks are fetched over HTTP with `download.http_timeout`, and download
    /// state is stored in the SQLite database at `persistence.database_path`.
    pub async fn from_config(
        config: &Config,
        revisions: Arc<dyn RevisionRepository>,
        offline: Arc<dyn OfflinePredicate>,
        decryptor: Arc<dyn ContentDecryptor>,
        links: Arc<dyn LinkTree>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self> {
        let db = Database::new(&config.persistence.database_path).await?;
        Ok(Self {
            revisions,
            blocks: Arc::new(HttpBlockDownloader::new(config.download.http_timeout)?),
            storage: Arc::new(DirectoryStorageLocator::new(
                &config.download.cache_dir,
                &config.download.permanent_dir,
            )),
            offline,
            decryptor,
            states: Arc::new(db),
            links,
            connectivity,
        })
    }
}
