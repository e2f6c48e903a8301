//! Reading and committing `_delta_log/NNNNNNNNNNNNNNNNNNNN.json` files.

use super::actions::{Action, Metadata, Protocol};
use crate::{DeltaError, Error, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Log directory relative to the table root.
pub const DELTA_LOG_DIR: &str = "_delta_log";

/// Path of the commit file for `version`.
pub fn commit_path(version: i64) -> ObjectPath {
    ObjectPath::from(format!("{}/{:020}.json", DELTA_LOG_DIR, version))
}

/// Version encoded in a commit file name, if `name` is one.
fn parse_commit_version(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Table state reconstructed from the log.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    /// Latest committed version, `None` before the first commit
    pub version: Option<i64>,
    /// Current protocol
    pub protocol: Option<Protocol>,
    /// Current metadata
    pub metadata: Option<Metadata>,
    /// Latest `txn` version per application id
    pub app_versions: HashMap<String, i64>,
    /// Live data files
    pub files: HashSet<String>,
    /// Rows in live data files, from file statistics
    pub num_records: i64,
    file_records: HashMap<String, i64>,
}

impl TableSnapshot {
    /// Version the next commit must use.
    pub fn next_version(&self) -> i64 {
        self.version.map(|v| v + 1).unwrap_or(0)
    }

    /// Last batch id committed by `app_id`.
    pub fn app_version(&self, app_id: &str) -> Option<i64> {
        self.app_versions.get(app_id).copied()
    }

    /// Apply the actions of `version` on top of this snapshot.
    pub fn apply(&mut self, version: i64, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Protocol(p) => self.protocol = Some(p.clone()),
                Action::Metadata(m) => self.metadata = Some(m.clone()),
                Action::Txn(t) => {
                    self.app_versions.insert(t.app_id.clone(), t.version);
                }
                Action::Add(a) => {
                    let records = a.num_records().unwrap_or(0);
                    if self.files.insert(a.path.clone()) {
                        self.num_records += records;
                        self.file_records.insert(a.path.clone(), records);
                    }
                }
                Action::Remove(r) => {
                    if self.files.remove(&r.path) {
                        self.num_records -= self.file_records.remove(&r.path).unwrap_or(0);
                    }
                }
                Action::CommitInfo(_) => {}
            }
        }
        self.version = Some(version);
    }
}

/// Access to a table's transaction log.
#[derive(Clone)]
pub struct DeltaLog {
    store: Arc<dyn ObjectStore>,
}

impl DeltaLog {
    /// Wrap a store rooted at the table location.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Store rooted at the table location.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// All commit versions present in the log, ascending.
    pub async fn list_versions(&self) -> Result<Vec<i64>> {
        let prefix = ObjectPath::from(DELTA_LOG_DIR);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut versions: Vec<i64> = objects
            .iter()
            .filter_map(|meta| meta.location.filename().and_then(parse_commit_version))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Read the actions of one commit. `None` if the commit does not exist.
    pub async fn read_version(&self, version: i64) -> Result<Option<Vec<Action>>> {
        let data = match self.store.get(&commit_path(version)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let text = std::str::from_utf8(&data).map_err(|e| {
            Error::Delta(DeltaError::LogCorrupted {
                version,
                message: e.to_string(),
            })
        })?;

        let mut actions = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let action = Action::from_json_line(line).map_err(|e| {
                Error::Delta(DeltaError::LogCorrupted {
                    version,
                    message: e.to_string(),
                })
            })?;
            actions.extend(action);
        }
        Ok(Some(actions))
    }

    /// Rebuild the table state from every commit in the log.
    pub async fn load_snapshot(&self) -> Result<TableSnapshot> {
        let versions = self.list_versions().await?;
        let mut snapshot = TableSnapshot::default();

        if let Some(&first) = versions.first() {
            if first != 0 {
                return Err(Error::Delta(DeltaError::LogCorrupted {
                    version: first,
                    message: "log does not start at version 0; log checkpoints are not supported"
                        .into(),
                }));
            }
        }

        for version in versions {
            let actions = self.read_version(version).await?.ok_or_else(|| {
                Error::Delta(DeltaError::LogCorrupted {
                    version,
                    message: "commit listed but not readable".into(),
                })
            })?;
            snapshot.apply(version, &actions);
        }

        debug!(
            version = ?snapshot.version,
            files = snapshot.files.len(),
            "Loaded table snapshot"
        );
        Ok(snapshot)
    }

    /// Apply commits written after `snapshot.version`. Returns how many were applied.
    pub async fn update_snapshot(&self, snapshot: &mut TableSnapshot) -> Result<usize> {
        let mut applied = 0;
        loop {
            let version = snapshot.next_version();
            match self.read_version(version).await? {
                Some(actions) => {
                    snapshot.apply(version, &actions);
                    applied += 1;
                }
                None => return Ok(applied),
            }
        }
    }

    /// Write commit `version` only if nobody else has.
    pub async fn try_commit(&self, version: i64, actions: &[Action]) -> Result<()> {
        let mut body = String::new();
        for action in actions {
            body.push_str(&action.to_json_line()?);
            body.push('\n');
        }

        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(
                &commit_path(version),
                PutPayload::from_bytes(Bytes::from(body)),
                options,
            )
            .await
        {
            Ok(_) => {
                info!(version = version, actions = actions.len(), "Committed to Delta log");
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                Err(Error::Delta(DeltaError::CommitConflict { version }))
            }
            Err(e) => Err(e.into()),
        }
    }
}
