//! An append-only Delta table handle.

use super::actions::{Action, Metadata, Protocol};
use super::log::{DeltaLog, TableSnapshot};
use crate::Result;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::info;

/// A Delta table at one location, with its last known state.
pub struct DeltaTable {
    log: DeltaLog,
    snapshot: TableSnapshot,
}

impl DeltaTable {
    /// Open the table rooted at `store`, reading its log.
    ///
    /// A location without a log is a table that does not exist yet; it is
    /// created by the first append. An existing table must have the
    /// `raw_json string` schema and a protocol this writer supports.
    pub async fn open(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let log = DeltaLog::new(store);
        let snapshot = log.load_snapshot().await?;
        let table = Self { log, snapshot };
        table.validate()?;

        info!(
            version = ?table.snapshot.version,
            files = table.snapshot.files.len(),
            "Opened Delta table"
        );
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        if let Some(ref protocol) = self.snapshot.protocol {
            protocol.ensure_supported()?;
        }
        if let Some(ref metadata) = self.snapshot.metadata {
            metadata.ensure_raw_json_schema()?;
        }
        Ok(())
    }

    /// Latest committed version, `None` for a table not created yet.
    pub fn version(&self) -> Option<i64> {
        self.snapshot.version
    }

    /// True once protocol and metadata are committed.
    pub fn exists(&self) -> bool {
        self.snapshot.metadata.is_some()
    }

    /// Last batch id committed by `app_id` (the `txn` action).
    pub fn app_version(&self, app_id: &str) -> Option<i64> {
        self.snapshot.app_version(app_id)
    }

    /// Current table state.
    pub fn snapshot(&self) -> &TableSnapshot {
        &self.snapshot
    }

    pub(crate) fn log(&self) -> &DeltaLog {
        &self.log
    }

    /// Catch up with commits made since the table was read.
    pub async fn update(&mut self) -> Result<usize> {
        let applied = self.log.update_snapshot(&mut self.snapshot).await?;
        if applied > 0 {
            self.validate()?;
        }
        Ok(applied)
    }

    /// Protocol and metadata actions for the first commit, empty afterwards.
    pub(crate) fn table_creation_actions(&self, now_ms: i64) -> Vec<Action> {
        if self.exists() {
            return Vec::new();
        }
        let mut actions = Vec::with_capacity(2);
        if self.snapshot.protocol.is_none() {
            actions.push(Action::Protocol(Protocol::new_table()));
        }
        actions.push(Action::Metadata(Metadata::raw_json_table(now_ms)));
        actions
    }

    pub(crate) fn apply_commit(&mut self, version: i64, actions: &[Action]) {
        self.snapshot.apply(version, actions);
    }
}
