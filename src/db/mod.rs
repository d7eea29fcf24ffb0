//! Database layer for drive-fetch
//!
//! SQLite persistence for per-link download state. [`Database`] is the
//! concrete [`DownloadStateStore`](crate::remote::DownloadStateStore) shipped
//! with the crate.
//!
//! ## Submodules
//!
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`download_state`] - Download state CRUD and change notifications

use crate::types::{Block, DownloadState, LinkId, StateUpdate, VolumeId};
use sqlx::{FromRow, sqlite::SqlitePool};

mod download_state;
mod migrations;

/// Capacity of the state change broadcast channel
const STATE_CHANNEL_CAPACITY: usize = 256;

/// Download state row as stored in SQLite
#[derive(Debug, Clone, FromRow)]
pub struct DownloadStateRow {
    /// Link the state belongs to
    pub link_id: String,
    /// Volume containing the link
    pub volume_id: String,
    /// State code (see [`DownloadState::to_i32`])
    pub state: i32,
    /// Manifest signature (Downloaded only)
    pub manifest_signature: Option<String>,
    /// Signing key address (Downloaded only)
    pub signature_address: Option<String>,
    /// JSON array of localized blocks (Downloaded only)
    pub blocks: Option<String>,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// A stored state together with the volume it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    /// Link the state belongs to
    pub link_id: LinkId,
    /// Volume containing the link
    pub volume_id: VolumeId,
    /// Decoded state
    pub state: DownloadState,
}

impl DownloadStateRow {
    /// Decode the row into a [`DownloadState`]
    pub fn decode(&self) -> crate::Result<DownloadState> {
        let corrupt = |reason: String| {
            crate::Error::Database(crate::error::DatabaseError::CorruptRecord {
                link_id: self.link_id.clone(),
                reason,
            })
        };

        match self.state {
            0 => Ok(DownloadState::NotDownloaded),
            1 => Ok(DownloadState::Downloading),
            2 => {
                let blocks_json = self
                    .blocks
                    .as_deref()
                    .ok_or_else(|| corrupt("downloaded state without blocks".to_string()))?;
                let blocks: Vec<Block> = serde_json::from_str(blocks_json)
                    .map_err(|e| corrupt(format!("invalid blocks JSON: {}", e)))?;
                Ok(DownloadState::Downloaded {
                    manifest_signature: self.manifest_signature.clone().unwrap_or_default(),
                    signature_address: self.signature_address.clone().unwrap_or_default(),
                    blocks,
                })
            }
            3 => Ok(DownloadState::Error),
            other => Err(corrupt(format!("unknown state code {}", other))),
        }
    }
}

/// Database handle for drive-fetch
pub struct Database {
    pool: SqlitePool,
    updates: tokio::sync::broadcast::Sender<StateUpdate>,
}
