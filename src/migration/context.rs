//! The migration context and its satellite records: configuration,
//! statistics, verification output and the final result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backup::BackupProvider;
use crate::document::ObjectDocument;
use crate::event::Event;
use crate::lock::{DistributedLockProvider, LockOptions};
use crate::migration::plan::MigrationPlan;
use crate::store::{DataStore, DocumentStore, StoreError};

/// Lifecycle states of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MigrationStatus {
    /// Built but not started.
    Pending,
    /// Copying and transforming events.
    InProgress,
    /// Taking the pre-copy backup.
    BackingUp,
    /// Running the verification checks.
    Verifying,
    /// Swapping the document's active stream pointer.
    CuttingOver,
    /// Finished successfully.
    Completed,
    /// Suspended between events by a pause signal.
    Paused,
    /// Finished unsuccessfully without compensation.
    Failed,
    /// Stopped by a cancel signal.
    Cancelled,
    /// Compensation is running.
    RollingBack,
    /// Compensation finished.
    RolledBack,
}

/// How the migration materializes the target stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum MigrationStrategy {
    /// Copy every source event into the target stream, transforming on the
    /// way. The only strategy currently implemented.
    #[default]
    CopyAndTransform,
    /// Transform lazily on read. Reserved; rejected by the executor.
    LazyTransform,
    /// Rewrite events in place. Reserved; rejected by the executor.
    InPlaceTransform,
}

/// Pre-copy backup settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Where the backup should be written (path, container, ...).
    pub location: String,

    /// Free-form metadata recorded with the backup.
    pub metadata: HashMap<String, String>,
}

impl BackupConfig {
    /// Creates a config targeting the given location.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Post-cutover bookkeeping settings for the terminated source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookClosingConfig {
    /// Reason recorded on the terminated stream.
    pub reason: String,

    /// Marks the terminated stream's data as deleted.
    pub mark_as_deleted: bool,

    /// Recorded under the `archiveLocation` metadata key when set.
    pub archive_location: Option<String>,

    /// Requests a snapshot of the target stream after closing the books.
    pub create_snapshot: bool,

    /// Extra metadata merged into the terminated stream record.
    pub metadata: HashMap<String, String>,
}

/// A named verification step supplied by the caller, run after the
/// built-in checks against the source and target event lists.
#[derive(Clone)]
pub struct CustomValidation {
    /// Name reported in the verification result.
    pub name: String,

    /// The check itself; an `Err` message fails the check.
    pub check: Arc<dyn Fn(&[Event], &[Event]) -> Result<(), String> + Send + Sync>,
}

impl std::fmt::Debug for CustomValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomValidation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Verification settings of the migration.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Abort the saga on the first failed check or transformation failure.
    pub fail_fast: bool,

    /// Run the per-event payload checksum comparison.
    pub verify_checksums: bool,

    /// Upper bound of events re-transformed by the sampling check.
    pub transformation_sample_size: usize,

    /// Caller-supplied checks, run last in declaration order.
    pub custom_validations: Vec<CustomValidation>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            verify_checksums: true,
            transformation_sample_size: 10,
            custom_validations: Vec::new(),
        }
    }
}

/// Progress reporting settings.
#[derive(Clone)]
pub struct ProgressConfig {
    /// Emit a report at least this often while events are flowing.
    pub report_interval: Duration,

    /// Emit a report every this many processed events.
    pub report_every_events: u64,

    /// Receives the reports.
    pub callback: Option<Arc<dyn Fn(&MigrationProgress) + Send + Sync>>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(5),
            report_every_events: 100,
            callback: None,
        }
    }
}

impl std::fmt::Debug for ProgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressConfig")
            .field("report_interval", &self.report_interval)
            .field("report_every_events", &self.report_every_events)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// One progress report emitted during the copy phase.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationProgress {
    /// The reporting migration.
    pub migration_id: Uuid,

    /// Events processed so far.
    pub processed_events: u64,

    /// Total events to process, when known.
    pub total_events: u64,

    /// Time since the copy phase started.
    pub elapsed: Duration,

    /// Throughput so far.
    pub events_per_second: f64,
}

/// Transforms one event on its way from the source to the target stream.
pub trait EventTransformer: Send + Sync {
    /// Transforms the event, or fails it out of the migration.
    fn transform(&self, event: Event) -> Result<Event, TransformError>;
}

/// A transformation failure for one event.
#[derive(Debug, thiserror::Error)]
#[error("failed to transform '{event_type}' at version {event_version}: {message}")]
pub struct TransformError {
    /// Event type of the failing event.
    pub event_type: String,

    /// Stream position of the failing event.
    pub event_version: i64,

    /// What went wrong.
    pub message: String,
}

/// [`EventTransformer`] built from a closure, mostly for tests and small
/// in-line transformations.
pub struct FnTransformer<F>(pub F);

impl<F> EventTransformer for FnTransformer<F>
where
    F: Fn(Event) -> Result<Event, TransformError> + Send + Sync,
{
    fn transform(&self, event: Event) -> Result<Event, TransformError> {
        (self.0)(event)
    }
}

/// Frozen description of one migration, produced by the
/// [builder][crate::migration::builder::MigrationBuilder] and consumed by
/// the [executor][crate::migration::executor::MigrationExecutor].
#[derive(Clone)]
pub struct MigrationContext {
    /// Unique id, generated when the builder is created.
    pub migration_id: Uuid,

    /// When the context was built.
    pub started_at: DateTime<Utc>,

    /// The document whose active stream is being migrated.
    pub source_document: ObjectDocument,

    /// Identifier of the stream being migrated away from.
    pub source_stream_identifier: String,

    /// Identifier of the stream being created; must differ from the source.
    pub target_stream_identifier: String,

    /// How the target stream is materialized.
    pub strategy: MigrationStrategy,

    /// Transformation pipeline applied to every copied event, in order.
    pub transformers: Vec<Arc<dyn EventTransformer>>,

    /// Lock settings; `None` runs without a distributed lock.
    pub lock_options: Option<LockOptions>,

    /// Backup settings; `None` skips the backup phase.
    pub backup_config: Option<BackupConfig>,

    /// Book-closing settings; `None` skips the book-closing phase.
    pub book_closing_config: Option<BookClosingConfig>,

    /// Verification settings; `None` skips the verification phase.
    pub verification_config: Option<VerificationConfig>,

    /// Progress reporting settings; `None` reports nothing.
    pub progress_config: Option<ProgressConfig>,

    /// Plan instead of execute.
    pub is_dry_run: bool,

    /// Honor pause signals between events.
    pub supports_pause: bool,

    /// Run compensation when a step fails after events were written.
    pub supports_rollback: bool,

    /// Data store holding both source and target stream events. Required
    /// at execution.
    pub data_store: Option<Arc<dyn DataStore>>,

    /// Document store owning the source document. Required at execution.
    pub document_store: Option<Arc<dyn DocumentStore>>,

    /// Lock provider; a no-op provider is used when `lock_options` is set
    /// but no provider was configured.
    pub lock_provider: Option<Arc<dyn DistributedLockProvider>>,

    /// Backup provider; without one a configured backup phase is a no-op.
    pub backup_provider: Option<Arc<dyn BackupProvider>>,

    /// Free-form metadata recorded on the migration.
    pub metadata: HashMap<String, String>,
}

impl MigrationContext {
    /// The lock key guarding this migration's source stream.
    pub fn lock_key(&self) -> String {
        format!(
            "migration:{}:{}",
            self.source_document.object_id, self.source_stream_identifier
        )
    }
}

impl std::fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("migration_id", &self.migration_id)
            .field("source", &self.source_stream_identifier)
            .field("target", &self.target_stream_identifier)
            .field("strategy", &self.strategy)
            .field("is_dry_run", &self.is_dry_run)
            .finish_non_exhaustive()
    }
}

/// Counters collected over the lifetime of one migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatistics {
    /// Events found on the source stream.
    pub total_events: u64,

    /// Events written to the target stream.
    pub events_transformed: u64,

    /// Events skipped because their transformation failed.
    pub transformation_failures: u64,

    /// Serialized payload bytes written to the target stream.
    pub total_bytes: u64,

    /// `events_transformed` over the elapsed wall-clock seconds.
    pub average_events_per_second: f64,

    /// A snapshot was requested during book-closing.
    pub snapshot_created: bool,

    /// Compensation ran. Advisory when no backup provider was configured:
    /// the target stream then remains as orphan data.
    pub rolled_back: bool,

    /// When the migration started executing.
    pub started_at: DateTime<Utc>,

    /// When the migration reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationStatistics {
    /// Creates zeroed statistics starting now.
    pub fn new() -> Self {
        Self {
            total_events: 0,
            events_transformed: 0,
            transformation_failures: 0,
            total_bytes: 0,
            average_events_per_second: 0.0,
            snapshot_created: false,
            rolled_back: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

impl Default for MigrationStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// One verification check outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCheck {
    /// Name of the check.
    pub name: String,

    /// Whether it passed.
    pub passed: bool,

    /// Details, for failed checks.
    pub message: String,
}

/// Aggregated verification output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerificationResult {
    /// True when every check passed.
    pub valid: bool,

    /// The individual checks, in execution order.
    pub checks: Vec<VerificationCheck>,
}

/// Phases of the migration saga, reported on phase-scoped errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Validation, locking, heartbeat start.
    Prepare,
    /// Pre-copy backup.
    Backup,
    /// Copying and transforming events.
    CopyTransform,
    /// Verification checks.
    Verify,
    /// Active-stream swap on the source document.
    Cutover,
    /// Terminated-stream bookkeeping.
    BookClose,
    /// Lock release and statistics.
    Finalize,
}

/// All possible error types surfaced by a migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The context failed validation at execution time.
    #[error("invalid migration context: {0}")]
    Validation(String),

    /// The distributed lock stayed contended for the whole timeout.
    #[error("failed to acquire migration lock '{key}'")]
    LockAcquisition {
        /// The contended lock key.
        key: String,
    },

    /// The heartbeat could not renew the lock lease.
    #[error("migration lock '{key}' was lost")]
    LockLost {
        /// The lost lock key.
        key: String,
    },

    /// The configured strategy is reserved for future work.
    #[error("migration strategy {0:?} is not implemented")]
    StrategyNotImplemented(MigrationStrategy),

    /// An event failed its transformation while fail-fast was active.
    #[error(transparent)]
    Transformation(#[from] TransformError),

    /// One or more verification checks failed.
    #[error("verification failed: {}", failed_checks.join(", "))]
    Verification {
        /// Names of the failed checks.
        failed_checks: Vec<String>,
    },

    /// The migration was cancelled cooperatively.
    #[error("migration was cancelled")]
    Cancelled,

    /// A storage call failed in the named phase.
    #[error("{phase:?} phase failed: {source}")]
    Storage {
        /// The saga phase the error occurred in.
        phase: MigrationPhase,
        /// The underlying storage error.
        #[source]
        source: StoreError,
    },

    /// A backup or restore call failed.
    #[error("{phase:?} phase failed: {source}")]
    Backup {
        /// The saga phase the error occurred in.
        phase: MigrationPhase,
        /// The underlying backup error.
        #[source]
        source: crate::backup::BackupError,
    },

    /// The commit engine refused a write to the target or source stream.
    #[error("{phase:?} phase failed: {source}")]
    Commit {
        /// The saga phase the error occurred in.
        phase: MigrationPhase,
        /// The underlying commit error.
        #[source]
        source: crate::session::CommitError,
    },
}

/// Final outcome of one migration run.
#[derive(Debug)]
pub struct MigrationResult {
    /// True when the saga reached [`MigrationStatus::Completed`].
    pub success: bool,

    /// Terminal status of the migration.
    pub status: MigrationStatus,

    /// Id of the migration.
    pub migration_id: Uuid,

    /// Counters collected during the run.
    pub statistics: MigrationStatistics,

    /// Verification output, when the phase ran.
    pub verification: Option<VerificationResult>,

    /// The dry-run plan, when planning was requested.
    pub plan: Option<MigrationPlan>,

    /// The failure that ended the saga, when unsuccessful.
    pub error: Option<MigrationError>,
}
