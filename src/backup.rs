//! Backup seam consumed by the migration saga: snapshot a source stream
//! before copying, restore it when compensation runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::document::ObjectDocument;
use crate::event::Event;
use crate::store::{DataStore, StoreError};
use crate::version::Version;

/// Errors returned by backup providers.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The referenced backup does not exist (anymore).
    #[error("backup '{backup_id}' was not found")]
    NotFound {
        /// Id of the missing backup.
        backup_id: Uuid,
    },

    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Provider-specific failure.
    #[error("backup provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

/// Everything a provider needs to take a backup of one source stream.
#[derive(Debug, Clone)]
pub struct BackupContext {
    /// The migration requesting the backup.
    pub migration_id: Uuid,

    /// Document owning the stream being backed up.
    pub document: ObjectDocument,

    /// Identifier of the stream being backed up.
    pub stream_identifier: String,

    /// Target location configured by the caller (path, container, ...).
    pub location: String,
}

/// Reference to a completed backup, stored in the saga memo so the
/// compensation path can find it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    /// Unique id of the backup.
    pub backup_id: Uuid,

    /// Where the backup was written.
    pub location: String,

    /// When the backup completed.
    pub created_at: DateTime<Utc>,

    /// Number of events captured.
    pub event_count: u64,
}

/// Takes and restores stream backups.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Captures the source stream described by `ctx` into a new backup.
    async fn backup(&self, ctx: &BackupContext) -> Result<BackupHandle, BackupError>;

    /// Restores a previously taken backup.
    async fn restore(&self, handle: &BackupHandle, ctx: &BackupContext)
        -> Result<(), BackupError>;
}

#[derive(Debug, Default)]
struct InMemoryBackupBackend {
    backups: HashMap<Uuid, Vec<Event>>,
    backup_calls: u64,
    restore_calls: Vec<Uuid>,
}

/// In-memory [`BackupProvider`] that captures the source stream's events
/// from a [`DataStore`] and records every restore invocation, so tests can
/// assert on compensation behavior.
#[derive(Clone)]
pub struct InMemoryBackupProvider {
    data_store: Arc<dyn DataStore>,
    backend: Arc<RwLock<InMemoryBackupBackend>>,
}

impl InMemoryBackupProvider {
    /// Creates a provider reading stream content from the given data store.
    pub fn new(data_store: Arc<dyn DataStore>) -> Self {
        Self {
            data_store,
            backend: Arc::default(),
        }
    }

    /// Number of backups taken so far.
    pub fn backup_calls(&self) -> u64 {
        self.backend
            .read()
            .expect("acquire read lock on backup backend")
            .backup_calls
    }

    /// Ids of the backups restored so far, in invocation order.
    pub fn restored(&self) -> Vec<Uuid> {
        self.backend
            .read()
            .expect("acquire read lock on backup backend")
            .restore_calls
            .clone()
    }

    /// The captured events of a backup, if it exists.
    pub fn captured(&self, backup_id: Uuid) -> Option<Vec<Event>> {
        self.backend
            .read()
            .expect("acquire read lock on backup backend")
            .backups
            .get(&backup_id)
            .cloned()
    }
}

impl std::fmt::Debug for InMemoryBackupProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackupProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl BackupProvider for InMemoryBackupProvider {
    async fn backup(&self, ctx: &BackupContext) -> Result<BackupHandle, BackupError> {
        let events = self
            .data_store
            .read(&ctx.document, 0 as Version, None, None)
            .await?;

        let handle = BackupHandle {
            backup_id: Uuid::new_v4(),
            location: ctx.location.clone(),
            created_at: Utc::now(),
            event_count: events.len() as u64,
        };

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on backup backend");
        backend.backup_calls += 1;
        backend.backups.insert(handle.backup_id, events);

        Ok(handle)
    }

    async fn restore(
        &self,
        handle: &BackupHandle,
        _ctx: &BackupContext,
    ) -> Result<(), BackupError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on backup backend");

        if !backend.backups.contains_key(&handle.backup_id) {
            return Err(BackupError::NotFound {
                backup_id: handle.backup_id,
            });
        }

        backend.restore_calls.push(handle.backup_id);
        Ok(())
    }
}
