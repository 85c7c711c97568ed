//! The migration service: an in-memory directory of active migrations
//! with status, pause, resume and cancel controls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::migration::bulk::{execute_bulk, BulkMigration, BulkMigrationResult};
use crate::migration::context::{MigrationContext, MigrationResult, MigrationStatus};
use crate::migration::executor::MigrationExecutor;
use crate::migration::progress::{ControlSignals, MigrationControls, StatusCell};

/// Directory entry describing one running migration.
#[derive(Debug, Clone)]
pub struct ActiveMigration {
    /// Id of the migration.
    pub migration_id: Uuid,

    /// Object id of the document under migration.
    pub object_id: String,

    /// Source stream identifier.
    pub source_stream_identifier: String,

    /// Target stream identifier.
    pub target_stream_identifier: String,

    status: StatusCell,
    controls: MigrationControls,
}

impl ActiveMigration {
    /// Current status of the migration.
    pub fn status(&self) -> MigrationStatus {
        self.status.get()
    }
}

/// Runs migrations and tracks the active ones by id.
///
/// Pause, resume and cancel are no-ops on unknown ids: they return `false`
/// rather than failing, since the migration may simply have finished.
#[derive(Debug, Clone, Default)]
pub struct MigrationService {
    active: Arc<RwLock<HashMap<Uuid, ActiveMigration>>>,
}

impl MigrationService {
    /// Creates a service with an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes one migration, keeping it in the directory while it runs.
    pub async fn execute(&self, context: MigrationContext) -> MigrationResult {
        let (controls, signals) = ControlSignals::channel();
        let executor = MigrationExecutor::new(context);
        let migration_id = self.register(&executor, controls);

        let result = executor.run(signals).await;

        self.active.write().remove(&migration_id);
        debug!(%migration_id, status = ?result.status, "migration removed from directory");

        result
    }

    /// Executes a bulk migration. The individual migrations register and
    /// deregister themselves as the worker pool reaches them.
    pub async fn execute_bulk(&self, bulk: BulkMigration) -> BulkMigrationResult {
        execute_bulk(bulk).await
    }

    fn register(&self, executor: &MigrationExecutor, controls: MigrationControls) -> Uuid {
        let entry = executor.directory_entry(controls);
        let migration_id = entry.migration_id;
        self.active.write().insert(migration_id, entry);
        debug!(%migration_id, "migration registered");
        migration_id
    }

    /// The currently running migrations.
    pub fn active_migrations(&self) -> Vec<ActiveMigration> {
        self.active.read().values().cloned().collect()
    }

    /// Status of one migration; `None` when the id is unknown.
    pub fn migration_status(&self, migration_id: Uuid) -> Option<MigrationStatus> {
        self.active
            .read()
            .get(&migration_id)
            .map(ActiveMigration::status)
    }

    /// Requests a pause; returns whether the id was known.
    pub fn pause(&self, migration_id: Uuid) -> bool {
        match self.active.read().get(&migration_id) {
            Some(entry) => {
                entry.controls.pause();
                true
            },
            None => false,
        }
    }

    /// Lifts a pause; returns whether the id was known.
    pub fn resume(&self, migration_id: Uuid) -> bool {
        match self.active.read().get(&migration_id) {
            Some(entry) => {
                entry.controls.resume();
                true
            },
            None => false,
        }
    }

    /// Requests cancellation; returns whether the id was known.
    pub fn cancel(&self, migration_id: Uuid) -> bool {
        match self.active.read().get(&migration_id) {
            Some(entry) => {
                entry.controls.cancel();
                true
            },
            None => false,
        }
    }
}

impl MigrationExecutor {
    /// Builds the directory entry the service tracks while this executor
    /// runs.
    pub(crate) fn directory_entry(&self, controls: MigrationControls) -> ActiveMigration {
        let context = self.context_ref();
        ActiveMigration {
            migration_id: context.migration_id,
            object_id: context.source_document.object_id.clone(),
            source_stream_identifier: context.source_stream_identifier.clone(),
            target_stream_identifier: context.target_stream_identifier.clone(),
            status: self.status_cell(),
            controls,
        }
    }
}
