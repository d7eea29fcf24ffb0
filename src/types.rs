//! Core types for drive-fetch

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::GetFileError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of the account that owns a storage volume
    UserId
);
string_id!(
    /// Identifier of a storage volume
    VolumeId
);
string_id!(
    /// Identifier of a file or folder inside a volume
    LinkId
);
string_id!(
    /// Identifier of an immutable file revision
    RevisionId
);

/// Files are keyed by their link identifier.
pub type FileId = LinkId;

/// One encrypted content block of a revision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the revision; governs reassembly order
    pub index: u32,
    /// Remote location, replaced by the local file path once verified
    pub url: String,
    /// Expected lowercase hex SHA-256 of the block content
    pub hash_sha256: String,
}

/// Immutable snapshot of a file's content and its block manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Revision identifier
    pub id: RevisionId,
    /// Total encrypted size in bytes (sum of block sizes)
    pub size: u64,
    /// Blocks in manifest order
    pub blocks: Vec<Block>,
    /// Signature over the block manifest
    pub manifest_signature: String,
    /// Address of the key that produced `manifest_signature`
    pub signature_address: String,
}

impl Revision {
    /// Blocks sorted by index, independent of manifest order
    pub fn ordered_blocks(&self) -> Vec<Block> {
        let mut blocks = self.blocks.clone();
        blocks.sort_by_key(|b| b.index);
        blocks
    }
}

/// Persisted download lifecycle of a single link
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    /// No record exists
    #[default]
    NotDownloaded,
    /// Work in progress
    Downloading,
    /// All blocks verified; `blocks[].url` holds local paths
    Downloaded {
        /// Signature over the block manifest
        manifest_signature: String,
        /// Address of the signing key
        signature_address: String,
        /// Verified blocks with localized urls
        blocks: Vec<Block>,
    },
    /// Terminal failure marker until a new attempt starts
    Error,
}

impl DownloadState {
    /// Convert to the integer code stored in the database
    pub fn to_i32(&self) -> i32 {
        match self {
            DownloadState::NotDownloaded => 0,
            DownloadState::Downloading => 1,
            DownloadState::Downloaded { .. } => 2,
            DownloadState::Error => 3,
        }
    }

    /// Short lowercase name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            DownloadState::NotDownloaded => "not_downloaded",
            DownloadState::Downloading => "downloading",
            DownloadState::Downloaded { .. } => "downloaded",
            DownloadState::Error => "error",
        }
    }

    /// Whether this is the only state considered ready
    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadState::Downloaded { .. })
    }

    /// Local block references carried by a `Downloaded` state
    pub fn blocks(&self) -> &[Block] {
        match self {
            DownloadState::Downloaded { blocks, .. } => blocks,
            _ => &[],
        }
    }
}

/// A file inside a volume, pinned to the revision that should be materialized
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLink {
    /// Owner of the volume
    pub user_id: UserId,
    /// Volume containing the file
    pub volume_id: VolumeId,
    /// File identifier
    pub id: FileId,
    /// Parent folder, if any
    pub parent_id: Option<LinkId>,
    /// Revision to materialize
    pub revision_id: RevisionId,
    /// Display name
    pub name: String,
}

/// A folder inside a volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderLink {
    /// Owner of the volume
    pub user_id: UserId,
    /// Volume containing the folder
    pub volume_id: VolumeId,
    /// Folder identifier
    pub id: LinkId,
    /// Parent folder, if any
    pub parent_id: Option<LinkId>,
    /// Display name
    pub name: String,
}

/// Any node in a volume's tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Link {
    /// Regular file
    File(FileLink),
    /// Folder
    Folder(FolderLink),
}

impl Link {
    /// Identifier of the underlying link
    pub fn id(&self) -> &LinkId {
        match self {
            Link::File(f) => &f.id,
            Link::Folder(f) => &f.id,
        }
    }
}

/// Storage location for a materialized artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Evictable cache, used when the file is not marked offline
    Cache,
    /// Durable storage for files marked offline (directly or via an ancestor)
    Permanent,
}

impl Tier {
    /// Tier for the given offline flag
    pub fn for_offline(offline: bool) -> Self {
        if offline { Tier::Permanent } else { Tier::Cache }
    }

    /// The other tier
    pub fn other(self) -> Self {
        match self {
            Tier::Cache => Tier::Permanent,
            Tier::Permanent => Tier::Cache,
        }
    }
}

/// Byte progress of one download operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes present locally so far
    pub downloaded: u64,
    /// `Revision.size`
    pub total: u64,
}

impl Progress {
    /// Progress as a percentage of `total` (0.0 to 100.0)
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        ((self.downloaded as f64 / self.total as f64) * 100.0).min(100.0) as f32
    }
}

/// Result of a completed download operation, shared with every attached caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// All blocks present and verified, state committed as `Downloaded`
    Downloaded,
    /// Cancelled cooperatively before completion
    Cancelled,
    /// Failed with the given kind
    Failed(GetFileError),
}

/// Events emitted by [`get_file`](crate::FileDownloader::get_file)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GetFileEvent {
    /// Blocks are being transferred
    Downloading {
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
    },
    /// Verified blocks are being decrypted into the artifact
    Decrypting,
    /// The artifact is available at `path`
    Ready {
        /// Location of the plaintext artifact
        path: PathBuf,
        /// Tier holding the artifact
        tier: Tier,
    },
    /// The request failed
    Error {
        /// Failure kind
        error: GetFileError,
    },
}

/// Download-state change published by a [`DownloadStateStore`](crate::remote::DownloadStateStore)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    /// Link whose state changed
    pub link_id: LinkId,
    /// New state (`NotDownloaded` after removal)
    pub state: DownloadState,
}

/// Events broadcast to every subscriber of a [`FileDownloader`](crate::FileDownloader)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A download operation started
    DownloadStarted {
        /// File being downloaded
        file_id: FileId,
        /// Revision being downloaded
        revision_id: RevisionId,
    },
    /// Byte progress update
    Progress {
        /// File being downloaded
        file_id: FileId,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Bytes present locally
        downloaded_bytes: u64,
        /// Revision size
        total_bytes: u64,
    },
    /// Every block verified and `Downloaded` committed
    BlocksVerified {
        /// Verified file
        file_id: FileId,
        /// Number of blocks
        block_count: usize,
    },
    /// Download failed
    DownloadFailed {
        /// Failed file
        file_id: FileId,
        /// Failure description
        error: String,
    },
    /// Download cancelled
    DownloadCancelled {
        /// Cancelled file
        file_id: FileId,
    },
    /// Decryption into the target tier started
    Decrypting {
        /// File being decrypted
        file_id: FileId,
    },
    /// Artifact available
    Ready {
        /// Materialized file
        file_id: FileId,
        /// Artifact location
        path: PathBuf,
    },
    /// Download state and local files of a link were released
    CleanedUp {
        /// Released link
        link_id: LinkId,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_matches_byte_ratio() {
        let p = Progress {
            downloaded: 250,
            total: 300,
        };
        assert_eq!(p.percent() as u32, 83);
    }

    #[test]
    fn progress_of_empty_revision_is_complete() {
        assert_eq!(Progress::default().percent(), 100.0);
    }

    #[test]
    fn progress_is_capped_at_one_hundred() {
        let p = Progress {
            downloaded: 400,
            total: 300,
        };
        assert_eq!(p.percent(), 100.0);
    }

    #[test]
    fn ordered_blocks_sorts_by_index() {
        let revision = Revision {
            id: "rev".into(),
            size: 3,
            blocks: vec![
                Block {
                    index: 2,
                    url: "c".into(),
                    hash_sha256: String::new(),
                },
                Block {
                    index: 0,
                    url: "a".into(),
                    hash_sha256: String::new(),
                },
                Block {
                    index: 1,
                    url: "b".into(),
                    hash_sha256: String::new(),
                },
            ],
            manifest_signature: String::new(),
            signature_address: String::new(),
        };
        let urls: Vec<_> = revision.ordered_blocks().into_iter().map(|b| b.url).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn download_state_serializes_with_tag() {
        let state = DownloadState::Downloaded {
            manifest_signature: "sig".into(),
            signature_address: "addr".into(),
            blocks: vec![],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "downloaded");
        let back: DownloadState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn tier_selection_follows_offline_flag() {
        assert_eq!(Tier::for_offline(true), Tier::Permanent);
        assert_eq!(Tier::for_offline(false), Tier::Cache);
        assert_eq!(Tier::Cache.other(), Tier::Permanent);
    }

    #[test]
    fn empty_ids_are_detected() {
        assert!(RevisionId::new("").is_empty());
        assert!(!RevisionId::from("r1").is_empty());
        assert_eq!(LinkId::from("abc").to_string(), "abc");
    }
}
