//! Download state CRUD and change notifications.

use crate::error::DatabaseError;
use crate::remote::DownloadStateStore;
use crate::types::{DownloadState, LinkId, StateUpdate, VolumeId};
use crate::{Error, Result};

use super::{Database, DownloadStateRow, StoredState};

const SELECT_STATE_COLUMNS: &str = r#"
    SELECT link_id, volume_id, state, manifest_signature, signature_address, blocks, updated_at
    FROM download_states
"#;

impl Database {
    /// Get the stored state of a link (`NotDownloaded` when absent)
    pub async fn get_state(&self, link_id: &LinkId) -> Result<DownloadState> {
        let row = sqlx::query_as::<_, DownloadStateRow>(&format!(
            "{} WHERE link_id = ?",
            SELECT_STATE_COLUMNS
        ))
        .bind(link_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get download state: {}",
                e
            )))
        })?;

        match row {
            Some(row) => row.decode(),
            None => Ok(DownloadState::NotDownloaded),
        }
    }

    /// Upsert the state of a link; `NotDownloaded` deletes the row
    pub async fn set_state(
        &self,
        volume_id: &VolumeId,
        link_id: &LinkId,
        state: &DownloadState,
    ) -> Result<()> {
        if matches!(state, DownloadState::NotDownloaded) {
            return self.remove_state(link_id).await;
        }

        let (manifest_signature, signature_address, blocks) = match state {
            DownloadState::Downloaded {
                manifest_signature,
                signature_address,
                blocks,
            } => (
                Some(manifest_signature.as_str()),
                Some(signature_address.as_str()),
                Some(serde_json::to_string(blocks)?),
            ),
            _ => (None, None, None),
        };
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO download_states (
                link_id, volume_id, state, manifest_signature, signature_address, blocks, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(link_id) DO UPDATE SET
                volume_id = excluded.volume_id,
                state = excluded.state,
                manifest_signature = excluded.manifest_signature,
                signature_address = excluded.signature_address,
                blocks = excluded.blocks,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(link_id.as_str())
        .bind(volume_id.as_str())
        .bind(state.to_i32())
        .bind(manifest_signature)
        .bind(signature_address)
        .bind(blocks)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set download state: {}",
                e
            )))
        })?;

        self.publish(link_id, state.clone());
        Ok(())
    }

    /// Delete the state row of a link
    pub async fn remove_state(&self, link_id: &LinkId) -> Result<()> {
        let result = sqlx::query("DELETE FROM download_states WHERE link_id = ?")
            .bind(link_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove download state: {}",
                    e
                )))
            })?;

        if result.rows_affected() > 0 {
            self.publish(link_id, DownloadState::NotDownloaded);
        }
        Ok(())
    }

    /// List every stored state of a volume
    pub async fn list_states(&self, volume_id: &VolumeId) -> Result<Vec<StoredState>> {
        let rows = sqlx::query_as::<_, DownloadStateRow>(&format!(
            "{} WHERE volume_id = ? ORDER BY link_id",
            SELECT_STATE_COLUMNS
        ))
        .bind(volume_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list download states: {}",
                e
            )))
        })?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredState {
                    state: row.decode()?,
                    link_id: LinkId::new(row.link_id),
                    volume_id: VolumeId::new(row.volume_id),
                })
            })
            .collect()
    }

    /// Drop `Downloading` rows left behind by an interrupted session.
    ///
    /// Returns the affected links. Block files already on disk are kept and
    /// picked up by the next download attempt.
    pub async fn reset_interrupted(&self) -> Result<Vec<LinkId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM download_states WHERE state = ? RETURNING link_id",
        )
        .bind(DownloadState::Downloading.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset interrupted downloads: {}",
                e
            )))
        })?;

        let ids: Vec<LinkId> = ids.into_iter().map(LinkId::new).collect();
        for id in &ids {
            self.publish(id, DownloadState::NotDownloaded);
        }
        Ok(ids)
    }

    /// Subscribe to committed state changes
    pub fn subscribe_states(&self) -> tokio::sync::broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, link_id: &LinkId, state: DownloadState) {
        // No receivers is fine; the update is simply dropped
        self.updates
            .send(StateUpdate {
                link_id: link_id.clone(),
                state,
            })
            .ok();
    }
}

#[async_trait::async_trait]
impl DownloadStateStore for Database {
    async fn get_state(&self, link_id: &LinkId) -> Result<DownloadState> {
        Database::get_state(self, link_id).await
    }

    async fn set_state(
        &self,
        volume_id: &VolumeId,
        link_id: &LinkId,
        state: &DownloadState,
    ) -> Result<()> {
        Database::set_state(self, volume_id, link_id, state).await
    }

    async fn remove_state(&self, link_id: &LinkId) -> Result<()> {
        Database::remove_state(self, link_id).await
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateUpdate> {
        self.subscribe_states()
    }
}
