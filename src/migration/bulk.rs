//! Bulk migration: runs many single-document migrations with bounded
//! concurrency, aggregating progress and failures.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::migration::context::{MigrationContext, MigrationError, MigrationResult, MigrationStatus};
use crate::migration::executor::MigrationExecutor;
use crate::migration::progress::ControlSignals;

/// Receives a [`BulkMigrationProgress`] after each completed document.
pub type BulkProgressCallback = Arc<dyn Fn(&BulkMigrationProgress) + Send + Sync>;

/// Options of one bulk run.
#[derive(Clone)]
pub struct BulkMigrationOptions {
    /// Upper bound of concurrently running single-document migrations.
    pub max_concurrency: usize,

    /// Keep going when one document's migration fails.
    pub continue_on_error: bool,

    /// Progress callback, invoked after each completed document.
    pub progress: Option<BulkProgressCallback>,
}

impl std::fmt::Debug for BulkMigrationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkMigrationOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

/// A frozen bulk migration: one context per document plus the run options.
#[derive(Debug)]
pub struct BulkMigration {
    /// The per-document migration contexts, in input order.
    pub contexts: Vec<MigrationContext>,

    /// Concurrency, error policy and progress reporting.
    pub options: BulkMigrationOptions,
}

/// Progress snapshot over a bulk run.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkMigrationProgress {
    /// Documents in the bulk run.
    pub total_documents: u64,

    /// Documents whose migration has finished, successfully or not.
    pub processed_documents: u64,

    /// Documents migrated successfully.
    pub successful_migrations: u64,

    /// Documents whose migration failed.
    pub failed_migrations: u64,

    /// Object id of the document that just completed.
    pub current_document_id: String,

    /// `processed / total * 100`, or 0 when the run is empty.
    pub percentage_complete: f64,
}

/// Failure record for one document of a bulk run.
#[derive(Debug)]
pub struct MigrationFailure {
    /// Object id of the failed document.
    pub object_id: String,

    /// Object name of the failed document.
    pub object_name: String,

    /// Human-readable failure summary.
    pub error_message: String,

    /// The underlying error, when one was captured. Shared with
    /// [`BulkMigrationResult::first_error`] for the earliest failure.
    pub error: Option<Arc<MigrationError>>,
}

/// Aggregated outcome of a bulk run.
#[derive(Debug)]
pub struct BulkMigrationResult {
    /// [`Completed`][MigrationStatus::Completed] when every document
    /// succeeded, [`Failed`][MigrationStatus::Failed] otherwise.
    pub status: MigrationStatus,

    /// Documents in the bulk run.
    pub total_documents: u64,

    /// Documents migrated successfully.
    pub successful_migrations: u64,

    /// Documents whose migration failed.
    pub failed_migrations: u64,

    /// Per-document failure records, in completion order.
    pub failures: Vec<MigrationFailure>,

    /// Every single-document result, in completion order.
    pub results: Vec<MigrationResult>,

    /// Summary of the first failures plus the total count.
    pub error_message: Option<String>,

    /// The first failure's error, when any migration failed.
    pub first_error: Option<Arc<MigrationError>>,
}

impl BulkMigrationResult {
    /// True when every document migrated successfully.
    pub fn success(&self) -> bool {
        self.status == MigrationStatus::Completed
    }
}

struct BulkState {
    progress: BulkMigrationProgress,
    failures: Vec<MigrationFailure>,
    results: Vec<MigrationResult>,
}

/// Runs a bulk migration with at most
/// [`max_concurrency`][BulkMigrationOptions::max_concurrency] documents in
/// flight.
pub async fn execute_bulk(bulk: BulkMigration) -> BulkMigrationResult {
    let total = bulk.contexts.len() as u64;
    let options = bulk.options;

    info!(
        documents = total,
        max_concurrency = options.max_concurrency,
        "bulk migration started"
    );

    let state = Arc::new(Mutex::new(BulkState {
        progress: BulkMigrationProgress {
            total_documents: total,
            processed_documents: 0,
            successful_migrations: 0,
            failed_migrations: 0,
            current_document_id: String::new(),
            percentage_complete: 0.0,
        },
        failures: Vec::new(),
        results: Vec::new(),
    }));

    // One shared cancel signal: a failure with continue-on-error disabled
    // trips it, and every still-queued migration bails at its first
    // checkpoint.
    let (controls, signals) = ControlSignals::channel();

    stream::iter(bulk.contexts)
        .map(|context| {
            let signals = signals.clone();
            let state = Arc::clone(&state);
            let controls = controls.clone();
            let options = options.clone();

            async move {
                let object_id = context.source_document.object_id.clone();
                let object_name = context.source_document.object_name.clone();

                let mut result = MigrationExecutor::new(context).run(signals).await;

                let mut state = state.lock();
                state.progress.processed_documents += 1;
                state.progress.current_document_id = object_id.clone();

                if result.success {
                    state.progress.successful_migrations += 1;
                } else {
                    state.progress.failed_migrations += 1;

                    let error_message = result
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "migration failed".to_owned());
                    warn!(%object_id, %error_message, "bulk item failed");

                    state.failures.push(MigrationFailure {
                        object_id,
                        object_name,
                        error_message,
                        error: result.error.take().map(Arc::new),
                    });

                    if !options.continue_on_error {
                        controls.cancel();
                    }
                }

                state.progress.percentage_complete = if total == 0 {
                    0.0
                } else {
                    state.progress.processed_documents as f64 / total as f64 * 100.0
                };

                if let Some(callback) = options.progress.as_ref() {
                    callback(&state.progress);
                }

                state.results.push(result);
            }
        })
        .buffer_unordered(options.max_concurrency.max(1))
        .collect::<Vec<()>>()
        .await;

    let state = Arc::try_unwrap(state)
        .map(Mutex::into_inner)
        .unwrap_or_else(|state| {
            let mut guard = state.lock();
            BulkState {
                progress: guard.progress.clone(),
                failures: std::mem::take(&mut guard.failures),
                results: std::mem::take(&mut guard.results),
            }
        });

    let failures = state.failures;
    let results = state.results;

    let failed = state.progress.failed_migrations;
    let successful = state.progress.successful_migrations;
    let status = if failed == 0 {
        MigrationStatus::Completed
    } else {
        MigrationStatus::Failed
    };

    let error_message = (!failures.is_empty()).then(|| {
        let shown: Vec<String> = failures
            .iter()
            .take(3)
            .map(|f| format!("{}: {}", f.object_id, f.error_message))
            .collect();
        format!(
            "{} of {} migrations failed; first failures: {}",
            failed,
            total,
            shown.join("; ")
        )
    });

    let first_error = failures.first().and_then(|f| f.error.clone());

    info!(
        documents = total,
        successful,
        failed,
        "bulk migration finished"
    );

    BulkMigrationResult {
        status,
        total_documents: total,
        successful_migrations: successful,
        failed_migrations: failed,
        failures,
        results,
        error_message,
        first_error,
    }
}
