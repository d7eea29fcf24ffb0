//! Shared test helpers: in-memory collaborators and a ready-to-use FileDownloader.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::downloader::FileDownloader;
use crate::error::{AssemblyError, Error, Result};
use crate::remote::{
    BlockDownloader, Collaborators, ConnectivityProbe, ContentDecryptor, LinkTree,
    OfflinePredicate, ProgressSink, RevisionRepository,
};
use crate::storage::DirectoryStorageLocator;
use crate::types::{
    Block, FileId, FileLink, FolderLink, GetFileEvent, Link, LinkId, Revision, RevisionId, UserId,
    VolumeId,
};
use crate::utils::sha256_hex;

/// Signature accepted by [`XorDecryptor`]
pub(crate) const VALID_SIGNATURE: &str = "valid-signature";

const XOR_KEY: u8 = 0x5a;

/// "Encrypt" test content the way [`XorDecryptor`] expects it
pub(crate) fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    plaintext.iter().map(|b| b ^ XOR_KEY).collect()
}

/// Progress sink that ignores everything
pub(crate) struct NullProgress;

#[async_trait::async_trait]
impl ProgressSink for NullProgress {
    async fn advance(&self, _bytes: u64) {}
}

/// In-memory revision catalog and block server
#[derive(Default)]
pub(crate) struct FakeRemote {
    revisions: Mutex<HashMap<RevisionId, Revision>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    corrupt: Mutex<HashSet<String>>,
    corrupt_once: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    slow: Mutex<HashMap<String, Duration>>,
    catalog_down: AtomicBool,
    /// Calls to `download_url`
    pub transfers: AtomicUsize,
    /// Calls to `get_revision`
    pub revision_fetches: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn serve(&self, url: &str, content: Vec<u8>) {
        self.contents.lock().unwrap().insert(url.to_string(), content);
    }

    pub(crate) fn add_revision(&self, revision: Revision) {
        self.revisions
            .lock()
            .unwrap()
            .insert(revision.id.clone(), revision);
    }

    /// Fail every transfer of `url` after writing half of it
    pub(crate) fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// Serve bytes for `url` that do not match its hash
    pub(crate) fn corrupt_url(&self, url: &str) {
        self.corrupt.lock().unwrap().insert(url.to_string());
    }

    /// Serve bad bytes for the next transfer of `url` only
    pub(crate) fn corrupt_url_once(&self, url: &str) {
        self.corrupt_once.lock().unwrap().insert(url.to_string());
    }

    /// Delay transfers of `url` only (cancellable)
    pub(crate) fn slow_url(&self, url: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(url.to_string(), delay);
    }

    pub(crate) fn heal_url(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
        self.corrupt.lock().unwrap().remove(url);
        self.slow.lock().unwrap().remove(url);
    }

    /// Delay every transfer (cancellable)
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_catalog_down(&self, down: bool) {
        self.catalog_down.store(down, Ordering::SeqCst);
    }
}

/// Register `content` as block `index` of `revision` and return its manifest entry
pub(crate) fn block_for(remote: &FakeRemote, revision: &str, index: u32, content: &[u8]) -> Block {
    let url = format!("https://blocks.test/{revision}/{index}");
    remote.serve(&url, content.to_vec());
    Block {
        index,
        url,
        hash_sha256: sha256_hex(content),
    }
}

#[async_trait::async_trait]
impl RevisionRepository for FakeRemote {
    async fn get_revision(&self, _file_id: &FileId, revision_id: &RevisionId) -> Result<Revision> {
        self.revision_fetches.fetch_add(1, Ordering::SeqCst);
        if self.catalog_down.load(Ordering::SeqCst) {
            return Err(Error::Other("catalog unavailable".to_string()));
        }
        self.revisions
            .lock()
            .unwrap()
            .get(revision_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("revision {revision_id}")))
    }
}

#[async_trait::async_trait]
impl BlockDownloader for FakeRemote {
    async fn download_url(
        &self,
        _user_id: &UserId,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.transfers.fetch_add(1, Ordering::SeqCst);

        let slow = self.slow.lock().unwrap().get(url).copied();
        let delay = slow.or(*self.delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        let content = self.contents.lock().unwrap().get(url).cloned();
        let content = content.ok_or_else(|| Error::Http {
            status: 404,
            url: url.to_string(),
        })?;

        let failing = self.failing.lock().unwrap().contains(url);
        let corrupt = self.corrupt.lock().unwrap().contains(url)
            || self.corrupt_once.lock().unwrap().remove(url);

        if failing {
            let half = &content[..content.len() / 2];
            tokio::fs::write(destination, half).await?;
            progress.advance(half.len() as u64).await;
            return Err(Error::Http {
                status: 503,
                url: url.to_string(),
            });
        }

        let data = if corrupt {
            content.iter().map(|b| !b).collect()
        } else {
            content
        };
        tokio::fs::write(destination, &data).await?;
        progress.advance(data.len() as u64).await;
        Ok(destination.to_path_buf())
    }
}

/// XOR "decryption" with a fixed key; accepts only [`VALID_SIGNATURE`]
#[derive(Default)]
pub(crate) struct XorDecryptor {
    pub fail_decryption: AtomicBool,
}

#[async_trait::async_trait]
impl ContentDecryptor for XorDecryptor {
    async fn verify_manifest_signature(
        &self,
        _file: &FileLink,
        manifest_signature: &str,
        _signature_address: &str,
        _blocks: &[Block],
    ) -> std::result::Result<(), AssemblyError> {
        if manifest_signature == VALID_SIGNATURE {
            Ok(())
        } else {
            Err(AssemblyError::SignatureVerification(format!(
                "unexpected signature {manifest_signature}"
            )))
        }
    }

    async fn decrypt_block(
        &self,
        _file: &FileLink,
        block: &Block,
        ciphertext: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, AssemblyError> {
        if self.fail_decryption.load(Ordering::SeqCst) {
            return Err(AssemblyError::Decryption(format!("block {}", block.index)));
        }
        Ok(encrypt(&ciphertext))
    }
}

/// Offline marks resolved against [`MemoryTree`] ancestry
#[derive(Default)]
pub(crate) struct OfflineSet {
    marked: Mutex<HashSet<LinkId>>,
    parents: Mutex<HashMap<LinkId, LinkId>>,
}

impl OfflineSet {
    pub(crate) fn mark(&self, link_id: &LinkId) {
        self.marked.lock().unwrap().insert(link_id.clone());
    }

    pub(crate) fn unmark(&self, link_id: &LinkId) {
        self.marked.lock().unwrap().remove(link_id);
    }

    fn set_parent(&self, child: &LinkId, parent: &LinkId) {
        self.parents
            .lock()
            .unwrap()
            .insert(child.clone(), parent.clone());
    }
}

#[async_trait::async_trait]
impl OfflinePredicate for OfflineSet {
    async fn is_link_or_ancestor_marked_offline(&self, link_id: &LinkId) -> Result<bool> {
        let marked = self.marked.lock().unwrap();
        let parents = self.parents.lock().unwrap();
        let mut current = Some(link_id);
        while let Some(id) = current {
            if marked.contains(id) {
                return Ok(true);
            }
            current = parents.get(id);
        }
        Ok(false)
    }
}

/// In-memory volume tree
#[derive(Default)]
pub(crate) struct MemoryTree {
    links: Mutex<HashMap<LinkId, Link>>,
}

#[async_trait::async_trait]
impl LinkTree for MemoryTree {
    async fn get_link(&self, _volume_id: &VolumeId, link_id: &LinkId) -> Result<Option<Link>> {
        Ok(self.links.lock().unwrap().get(link_id).cloned())
    }

    async fn get_descendants(&self, folder: &FolderLink, _refresh: bool) -> Result<Vec<Link>> {
        let links = self.links.lock().unwrap();
        let mut children: Vec<Link> = links
            .values()
            .filter(|link| {
                let parent = match link {
                    Link::File(f) => f.parent_id.as_ref(),
                    Link::Folder(f) => f.parent_id.as_ref(),
                };
                parent == Some(&folder.id)
            })
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(children)
    }
}

/// Connectivity probe that tests can switch off
pub(crate) struct ToggleConnectivity(pub AtomicBool);

impl ConnectivityProbe for ToggleConnectivity {
    fn is_connected_to_network(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A FileDownloader wired to in-memory collaborators and a temp directory
pub(crate) struct TestEnv {
    pub downloader: FileDownloader,
    pub remote: Arc<FakeRemote>,
    pub offline: Arc<OfflineSet>,
    pub decryptor: Arc<XorDecryptor>,
    pub tree: Arc<MemoryTree>,
    pub connectivity: Arc<ToggleConnectivity>,
    pub db: Arc<Database>,
    pub _temp_dir: tempfile::TempDir,
}

/// Helper to create a test FileDownloader instance with a persistent database.
pub(crate) async fn create_test_env() -> TestEnv {
    let temp_dir = tempdir().unwrap();

    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("test.db");
    config.download.cache_dir = temp_dir.path().join("cache");
    config.download.permanent_dir = temp_dir.path().join("offline");
    config.download.parallelism = 2;
    config.download.progress_interval = Duration::from_millis(10);
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.jitter = false;

    let db = Arc::new(Database::new(&config.persistence.database_path).await.unwrap());
    let remote = Arc::new(FakeRemote::default());
    let offline = Arc::new(OfflineSet::default());
    let decryptor = Arc::new(XorDecryptor::default());
    let tree = Arc::new(MemoryTree::default());
    let connectivity = Arc::new(ToggleConnectivity(AtomicBool::new(true)));

    let ports = Collaborators {
        revisions: remote.clone(),
        blocks: remote.clone(),
        storage: Arc::new(DirectoryStorageLocator::new(
            &config.download.cache_dir,
            &config.download.permanent_dir,
        )),
        offline: offline.clone(),
        decryptor: decryptor.clone(),
        states: db.clone(),
        links: tree.clone(),
        connectivity: connectivity.clone(),
    };

    let downloader = FileDownloader::new(config, ports).await.unwrap();

    TestEnv {
        downloader,
        remote,
        offline,
        decryptor,
        tree,
        connectivity,
        db,
        _temp_dir: temp_dir,
    }
}

impl TestEnv {
    /// Register a file whose revision consists of `plaintext_blocks`, encrypted
    pub(crate) fn add_file(
        &self,
        id: &str,
        parent: Option<&FolderLink>,
        plaintext_blocks: &[&[u8]],
    ) -> FileLink {
        let revision_id = format!("rev-{id}");
        let blocks: Vec<Block> = plaintext_blocks
            .iter()
            .enumerate()
            .map(|(i, plain)| block_for(&self.remote, &revision_id, i as u32, &encrypt(plain)))
            .collect();
        let size = plaintext_blocks.iter().map(|b| b.len() as u64).sum();

        self.remote.add_revision(Revision {
            id: revision_id.as_str().into(),
            size,
            blocks,
            manifest_signature: VALID_SIGNATURE.to_string(),
            signature_address: "signer@test".to_string(),
        });

        let file = FileLink {
            user_id: "user-1".into(),
            volume_id: "volume-1".into(),
            id: id.into(),
            parent_id: parent.map(|p| p.id.clone()),
            revision_id: revision_id.into(),
            name: format!("{id}.bin"),
        };
        if let Some(parent) = parent {
            self.offline.set_parent(&file.id, &parent.id);
        }
        self.tree
            .links
            .lock()
            .unwrap()
            .insert(file.id.clone(), Link::File(file.clone()));
        file
    }

    pub(crate) fn add_folder(&self, id: &str, parent: Option<&FolderLink>) -> FolderLink {
        let folder = FolderLink {
            user_id: "user-1".into(),
            volume_id: "volume-1".into(),
            id: id.into(),
            parent_id: parent.map(|p| p.id.clone()),
            name: id.to_string(),
        };
        if let Some(parent) = parent {
            self.offline.set_parent(&folder.id, &parent.id);
        }
        self.tree
            .links
            .lock()
            .unwrap()
            .insert(folder.id.clone(), Link::Folder(folder.clone()));
        folder
    }

    /// Run `get_file` to completion and collect every event
    pub(crate) async fn get_file_events(&self, file: &FileLink, retryable: bool) -> Vec<GetFileEvent> {
        self.downloader
            .get_file(file.clone(), true, retryable)
            .collect()
            .await
    }

    /// Block files currently on disk for `file`'s revision
    pub(crate) fn block_files(&self, file: &FileLink) -> Vec<PathBuf> {
        let dir = crate::storage::blocks_dir(&self.downloader.cache_folder(file));
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default();
        files.sort();
        files
    }
}

/// The last event of a finished `get_file` stream
pub(crate) fn last_event(events: &[GetFileEvent]) -> &GetFileEvent {
    events.last().expect("get_file produced no events")
}
