//! In-place event-stream migration: builders, the saga executor, dry-run
//! planning, bulk runs and the service directory.
//!
//! A migration copies the events of a document's active stream into a new
//! target stream, optionally transforming them on the way, verifies the
//! copy, and atomically swaps the document's active-stream pointer. The
//! source stream is terminated with a closure marker and, optionally,
//! book-closing metadata.

pub mod builder;
pub mod bulk;
pub mod context;
pub mod executor;
pub mod plan;
pub mod progress;
pub mod service;

pub use builder::{BuildError, BulkMigrationBuilder, MigrationBuilder};
pub use bulk::{
    execute_bulk, BulkMigration, BulkMigrationProgress, BulkMigrationResult, MigrationFailure,
};
pub use context::{
    BackupConfig, BookClosingConfig, CustomValidation, EventTransformer, FnTransformer,
    MigrationContext, MigrationError, MigrationPhase, MigrationProgress, MigrationResult,
    MigrationStatistics, MigrationStatus, MigrationStrategy, ProgressConfig, TransformError,
    VerificationCheck, VerificationConfig, VerificationResult,
};
pub use executor::{close_books, execute, MigrationExecutor};
pub use plan::{MigrationPlan, Prerequisite, Risk, RiskSeverity};
pub use progress::{ControlSignals, MigrationControls, ProgressTracker, StatusCell};
pub use service::{ActiveMigration, MigrationService};
