//! Checkpoint files on object storage.
//!
//! ```text
//! metadata
//! sources/0
//! offsets/0, offsets/1, ...
//! commits/0, commits/1, ...
//! ```

use super::entries::{CheckpointMetadata, CommitEntry, InitialOffsets, OffsetsEntry};
use crate::{CheckpointError, Error, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

const METADATA_FILE: &str = "metadata";
const INITIAL_OFFSETS_FILE: &str = "sources/0";
const OFFSETS_DIR: &str = "offsets";
const COMMITS_DIR: &str = "commits";

/// Reads and writes the checkpoint of one query.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
}

impl CheckpointStore {
    /// Use `store`, rooted at the checkpoint location.
    pub fn open(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn batch_path(dir: &str, batch_id: i64) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", dir, batch_id))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &ObjectPath) -> Result<Option<T>> {
        let data = match self.store.get(path).await {
            Ok(result) => result.bytes().await.map_err(|e| {
                Error::Checkpoint(CheckpointError::ReadFailed(format!("{}: {}", path, e)))
            })?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(Error::Checkpoint(CheckpointError::ReadFailed(format!(
                    "{}: {}",
                    path, e
                ))))
            }
        };

        serde_json::from_slice(&data).map(Some).map_err(|e| {
            Error::Checkpoint(CheckpointError::Corrupted {
                path: path.to_string(),
                message: e.to_string(),
            })
        })
    }

    async fn write_json<T: Serialize>(
        &self,
        path: &ObjectPath,
        value: &T,
        mode: PutMode,
    ) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let options = PutOptions {
            mode,
            ..Default::default()
        };
        self.store
            .put_opts(path, PutPayload::from_bytes(Bytes::from(body)), options)
            .await
            .map_err(|e| match e {
                object_store::Error::AlreadyExists { .. } => Error::Checkpoint(
                    CheckpointError::WriteFailed(format!("{} already exists", path)),
                ),
                e => Error::Checkpoint(CheckpointError::WriteFailed(format!("{}: {}", path, e))),
            })?;
        Ok(())
    }

    /// Query metadata, if the checkpoint has been initialised.
    pub async fn load_metadata(&self) -> Result<Option<CheckpointMetadata>> {
        self.read_json(&ObjectPath::from(METADATA_FILE)).await
    }

    /// Read the query metadata, creating it with a new query id on first use.
    ///
    /// Fails if the checkpoint belongs to a query reading another topic.
    pub async fn load_or_create_metadata(&self, topic: &str) -> Result<CheckpointMetadata> {
        if let Some(metadata) = self.load_metadata().await? {
            if metadata.topic != topic {
                return Err(Error::Checkpoint(CheckpointError::TopicMismatch {
                    expected: metadata.topic,
                    actual: topic.to_string(),
                }));
            }
            debug!(query_id = %metadata.id, "Loaded checkpoint metadata");
            return Ok(metadata);
        }

        let metadata = CheckpointMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            created_at: chrono::Utc::now(),
        };
        self.write_json(&ObjectPath::from(METADATA_FILE), &metadata, PutMode::Create)
            .await?;

        info!(query_id = %metadata.id, topic = %topic, "Created new checkpoint");
        Ok(metadata)
    }

    /// Positions a fresh query started from, if already resolved.
    pub async fn read_initial_offsets(&self) -> Result<Option<InitialOffsets>> {
        self.read_json(&ObjectPath::from(INITIAL_OFFSETS_FILE))
            .await
    }

    /// Persist the positions a fresh query resolved its starting offsets to.
    ///
    /// Written once. If another writer got there first its entry is returned
    /// and must be used instead of `entry`.
    pub async fn write_initial_offsets(&self, entry: &InitialOffsets) -> Result<InitialOffsets> {
        let path = ObjectPath::from(INITIAL_OFFSETS_FILE);
        if let Err(e) = self.write_json(&path, entry, PutMode::Create).await {
            return match self.read_initial_offsets().await? {
                Some(existing) => Ok(existing),
                None => Err(e),
            };
        }
        info!(positions = ?entry.positions, "Initial offsets written");
        Ok(entry.clone())
    }

    /// Record the planned offsets of a batch. Replaces an abandoned attempt.
    pub async fn write_offsets(&self, entry: &OffsetsEntry) -> Result<()> {
        self.write_json(
            &Self::batch_path(OFFSETS_DIR, entry.batch_id),
            entry,
            PutMode::Overwrite,
        )
        .await?;
        debug!(batch_id = entry.batch_id, "Offsets written");
        Ok(())
    }

    /// Mark a batch as committed to the table.
    pub async fn write_commit(&self, entry: &CommitEntry) -> Result<()> {
        self.write_json(
            &Self::batch_path(COMMITS_DIR, entry.batch_id),
            entry,
            PutMode::Overwrite,
        )
        .await?;
        debug!(batch_id = entry.batch_id, "Commit marker written");
        Ok(())
    }

    /// Offsets entry of one batch.
    pub async fn read_offsets(&self, batch_id: i64) -> Result<Option<OffsetsEntry>> {
        self.read_json(&Self::batch_path(OFFSETS_DIR, batch_id))
            .await
    }

    /// Commit marker of one batch.
    pub async fn read_commit(&self, batch_id: i64) -> Result<Option<CommitEntry>> {
        self.read_json(&Self::batch_path(COMMITS_DIR, batch_id))
            .await
    }

    /// Batch ids present in `dir`, ascending. Non-numeric names are ignored.
    async fn list_batch_ids(&self, dir: &str) -> Result<Vec<i64>> {
        let prefix = ObjectPath::from(dir);
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| Error::Checkpoint(CheckpointError::ReadFailed(e.to_string())))?;

        let mut ids: Vec<i64> = objects
            .iter()
            .filter_map(|meta| meta.location.filename()?.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Offsets entry with the highest batch id.
    pub async fn latest_offsets(&self) -> Result<Option<OffsetsEntry>> {
        match self.list_batch_ids(OFFSETS_DIR).await?.last() {
            Some(&id) => self.read_offsets(id).await,
            None => Ok(None),
        }
    }

    /// Commit marker with the highest batch id.
    pub async fn latest_commit(&self) -> Result<Option<CommitEntry>> {
        match self.list_batch_ids(COMMITS_DIR).await?.last() {
            Some(&id) => self.read_commit(id).await,
            None => Ok(None),
        }
    }

    /// Delete entries older than the last `retain` batches. Returns how many
    /// batches were removed.
    pub async fn purge(&self, retain: usize) -> Result<usize> {
        let ids = self.list_batch_ids(OFFSETS_DIR).await?;
        if ids.len() <= retain {
            return Ok(0);
        }
        let threshold = ids[ids.len() - retain];

        let commit_ids = self.list_batch_ids(COMMITS_DIR).await?;
        let mut removed = 0;
        for &id in ids.iter().take_while(|&&id| id < threshold) {
            self.delete(&Self::batch_path(OFFSETS_DIR, id)).await?;
            removed += 1;
        }
        for &id in commit_ids.iter().take_while(|&&id| id < threshold) {
            self.delete(&Self::batch_path(COMMITS_DIR, id)).await?;
        }

        if removed > 0 {
            debug!(removed = removed, below_batch = threshold, "Purged checkpoint entries");
        }
        Ok(removed)
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::Checkpoint(CheckpointError::WriteFailed(format!(
                "delete {}: {}",
                path, e
            )))),
        }
    }
}
