//! Fluent configuration of migrations: one builder for a single document,
//! one for bulk runs over many documents.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::backup::BackupProvider;
use crate::document::ObjectDocument;
use crate::lock::{DistributedLockProvider, LockOptions};
use crate::migration::bulk::{BulkMigration, BulkMigrationOptions, BulkProgressCallback};
use crate::migration::context::{
    BackupConfig, BookClosingConfig, EventTransformer, MigrationContext, MigrationStrategy,
    ProgressConfig, VerificationConfig,
};
use crate::migration::plan::MigrationPlan;
use crate::store::{DataStore, DocumentStore};

/// All possible error types returned by the builders.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No target stream identifier was configured.
    #[error("a target stream identifier is required")]
    MissingTarget,

    /// The target stream identifier is empty.
    #[error("the target stream identifier must not be empty")]
    EmptyTarget,

    /// The target equals the source stream identifier.
    #[error("target stream '{0}' must differ from the source stream")]
    TargetEqualsSource(String),

    /// Bulk concurrency must be positive.
    #[error("max concurrency must be greater than zero")]
    InvalidConcurrency,

    /// The bulk builder received no documents.
    #[error("at least one document is required")]
    NoDocuments,

    /// Live migration is only available for single-document migrations.
    #[error("live migration is not supported for bulk migrations")]
    LiveMigrationNotSupported,
}

/// Fluent, order-independent configuration of one migration.
///
/// Setters return `self`; [`build`][MigrationBuilder::build] validates and
/// freezes the configuration into a [`MigrationContext`].
pub struct MigrationBuilder {
    migration_id: Uuid,
    document: ObjectDocument,
    target: Option<String>,
    strategy: MigrationStrategy,
    transformers: Vec<Arc<dyn EventTransformer>>,
    lock_options: Option<LockOptions>,
    backup_config: Option<BackupConfig>,
    book_closing_config: Option<BookClosingConfig>,
    verification_config: Option<VerificationConfig>,
    progress_config: Option<ProgressConfig>,
    is_dry_run: bool,
    supports_pause: bool,
    supports_rollback: bool,
    live: bool,
    data_store: Option<Arc<dyn DataStore>>,
    document_store: Option<Arc<dyn DocumentStore>>,
    lock_provider: Option<Arc<dyn DistributedLockProvider>>,
    backup_provider: Option<Arc<dyn BackupProvider>>,
    metadata: HashMap<String, String>,
}

impl MigrationBuilder {
    /// Starts a migration of the document's active stream. The migration
    /// id is generated here, so dry-run and execution share it.
    pub fn new(document: ObjectDocument) -> Self {
        Self {
            migration_id: Uuid::new_v4(),
            document,
            target: None,
            strategy: MigrationStrategy::default(),
            transformers: Vec::new(),
            lock_options: None,
            backup_config: None,
            book_closing_config: None,
            verification_config: None,
            progress_config: None,
            is_dry_run: false,
            supports_pause: false,
            supports_rollback: false,
            live: false,
            data_store: None,
            document_store: None,
            lock_provider: None,
            backup_provider: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the target stream the events are copied into. Required.
    #[must_use]
    pub fn copy_to_new_stream(mut self, target_stream_identifier: impl Into<String>) -> Self {
        self.target = Some(target_stream_identifier.into());
        self
    }

    /// Selects the migration strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Appends a transformer to the pipeline.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn EventTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Guards the migration with a distributed lock.
    #[must_use]
    pub fn with_lock(mut self, options: LockOptions) -> Self {
        self.lock_options = Some(options);
        self
    }

    /// Configures the provider backing the distributed lock.
    #[must_use]
    pub fn with_lock_provider(mut self, provider: Arc<dyn DistributedLockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    /// Takes a backup before copying.
    #[must_use]
    pub fn with_backup(mut self, config: BackupConfig) -> Self {
        self.backup_config = Some(config);
        self
    }

    /// Configures the provider taking and restoring backups.
    #[must_use]
    pub fn with_backup_provider(mut self, provider: Arc<dyn BackupProvider>) -> Self {
        self.backup_provider = Some(provider);
        self
    }

    /// Closes the books on the terminated stream after cutover.
    #[must_use]
    pub fn with_book_closing(mut self, config: BookClosingConfig) -> Self {
        self.book_closing_config = Some(config);
        self
    }

    /// Verifies the copied stream before cutover.
    #[must_use]
    pub fn with_verification(mut self, config: VerificationConfig) -> Self {
        self.verification_config = Some(config);
        self
    }

    /// Emits progress reports during the copy phase.
    #[must_use]
    pub fn with_progress(mut self, config: ProgressConfig) -> Self {
        self.progress_config = Some(config);
        self
    }

    /// Plans instead of executing.
    #[must_use]
    pub fn as_dry_run(mut self) -> Self {
        self.is_dry_run = true;
        self
    }

    /// Honors pause signals between events.
    #[must_use]
    pub fn with_pause_support(mut self) -> Self {
        self.supports_pause = true;
        self
    }

    /// Runs compensation when a step fails after events were written.
    #[must_use]
    pub fn with_rollback_support(mut self) -> Self {
        self.supports_rollback = true;
        self
    }

    /// Keeps the source stream writable during the copy phase.
    #[must_use]
    pub fn with_live_migration(mut self) -> Self {
        self.live = true;
        self
    }

    /// Sets the stores the migration reads from and writes to. Required at
    /// execution time, optional for planning.
    #[must_use]
    pub fn with_stores(
        mut self,
        data_store: Arc<dyn DataStore>,
        document_store: Arc<dyn DocumentStore>,
    ) -> Self {
        self.data_store = Some(data_store);
        self.document_store = Some(document_store);
        self
    }

    /// Records a metadata entry on the migration.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Pre-seeds the builder from a dry-run plan: unmet prerequisites and
    /// risks are recorded as metadata so the executed migration carries
    /// the planning trail.
    #[must_use]
    pub fn from_dry_run_plan(mut self, plan: &MigrationPlan) -> Self {
        self.metadata.insert(
            "plan.feasible".to_owned(),
            plan.is_feasible.to_string(),
        );
        self.metadata.insert(
            "plan.eventCount".to_owned(),
            plan.source_analysis.event_count.to_string(),
        );
        for (i, risk) in plan.risks.iter().enumerate() {
            self.metadata.insert(
                format!("plan.risk.{i}"),
                format!("{:?}/{}: {}", risk.severity, risk.category, risk.description),
            );
        }
        for prerequisite in plan.prerequisites.iter().filter(|p| !p.is_met) {
            self.metadata.insert(
                format!("plan.unmet.{}", prerequisite.name.replace(' ', "-")),
                "unmet".to_owned(),
            );
        }
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(mut self) -> Result<MigrationContext, BuildError> {
        let target = self.target.take().ok_or(BuildError::MissingTarget)?;
        if target.is_empty() {
            return Err(BuildError::EmptyTarget);
        }

        let source = self.document.active.stream_identifier.clone();
        if target == source {
            return Err(BuildError::TargetEqualsSource(target));
        }

        if self.live {
            self.metadata
                .insert("liveMigration".to_owned(), "true".to_owned());
        }

        Ok(MigrationContext {
            migration_id: self.migration_id,
            started_at: Utc::now(),
            source_stream_identifier: source,
            source_document: self.document,
            target_stream_identifier: target,
            strategy: self.strategy,
            transformers: self.transformers,
            lock_options: self.lock_options,
            backup_config: self.backup_config,
            book_closing_config: self.book_closing_config,
            verification_config: self.verification_config,
            progress_config: self.progress_config,
            is_dry_run: self.is_dry_run,
            supports_pause: self.supports_pause,
            supports_rollback: self.supports_rollback,
            data_store: self.data_store,
            document_store: self.document_store,
            lock_provider: self.lock_provider,
            backup_provider: self.backup_provider,
            metadata: self.metadata,
        })
    }
}

/// Fluent configuration of one migration over many documents.
///
/// Shares the single-document options and adds concurrency, error policy
/// and bulk progress reporting. Live migration is not available here.
pub struct BulkMigrationBuilder {
    documents: Vec<ObjectDocument>,
    target_fn: Option<Arc<dyn Fn(&ObjectDocument) -> String + Send + Sync>>,
    template: MigrationBuilder,
    max_concurrency: usize,
    continue_on_error: bool,
    bulk_progress: Option<BulkProgressCallback>,
}

impl std::fmt::Debug for BulkMigrationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkMigrationBuilder")
            .field("documents", &self.documents.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .finish_non_exhaustive()
    }
}

impl BulkMigrationBuilder {
    /// Starts a bulk migration over the given documents.
    pub fn new(documents: Vec<ObjectDocument>) -> Self {
        Self {
            documents,
            target_fn: None,
            template: MigrationBuilder::new(ObjectDocument::new(
                "",
                "",
                crate::document::StreamInformation::new("", "", "", ""),
            )),
            max_concurrency: 4,
            continue_on_error: true,
            bulk_progress: None,
        }
    }

    /// Derives each document's target stream identifier. Required.
    #[must_use]
    pub fn copy_to_new_streams<F>(mut self, target_fn: F) -> Self
    where
        F: Fn(&ObjectDocument) -> String + Send + Sync + 'static,
    {
        self.target_fn = Some(Arc::new(target_fn));
        self
    }

    /// Caps the number of concurrently running single-document migrations.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Result<Self, BuildError> {
        if max_concurrency == 0 {
            return Err(BuildError::InvalidConcurrency);
        }
        self.max_concurrency = max_concurrency;
        Ok(self)
    }

    /// Keeps going when a single document's migration fails.
    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Receives a progress update after each completed document.
    #[must_use]
    pub fn with_bulk_progress(mut self, callback: BulkProgressCallback) -> Self {
        self.bulk_progress = Some(callback);
        self
    }

    /// Live migration cannot be combined with bulk runs.
    pub fn with_live_migration(self) -> Result<Self, BuildError> {
        Err(BuildError::LiveMigrationNotSupported)
    }

    /// Applies a single-document option to every built context.
    #[must_use]
    pub fn configure_each<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(MigrationBuilder) -> MigrationBuilder,
    {
        self.template = configure(self.template);
        self
    }

    /// Validates and freezes the configuration into per-document contexts.
    pub fn build(self) -> Result<BulkMigration, BuildError> {
        if self.documents.is_empty() {
            return Err(BuildError::NoDocuments);
        }
        let target_fn = self.target_fn.ok_or(BuildError::MissingTarget)?;

        let template = self.template;
        let mut contexts = Vec::with_capacity(self.documents.len());

        for document in self.documents {
            let target = target_fn(&document);

            let mut builder = MigrationBuilder::new(document);
            builder.strategy = template.strategy;
            builder.transformers = template.transformers.clone();
            builder.lock_options = template.lock_options.clone();
            builder.backup_config = template.backup_config.clone();
            builder.book_closing_config = template.book_closing_config.clone();
            builder.verification_config = template.verification_config.clone();
            builder.progress_config = template.progress_config.clone();
            builder.supports_pause = template.supports_pause;
            builder.supports_rollback = template.supports_rollback;
            builder.data_store = template.data_store.clone();
            builder.document_store = template.document_store.clone();
            builder.lock_provider = template.lock_provider.clone();
            builder.backup_provider = template.backup_provider.clone();
            builder.metadata = template.metadata.clone();

            contexts.push(builder.copy_to_new_stream(target).build()?);
        }

        Ok(BulkMigration {
            contexts,
            options: BulkMigrationOptions {
                max_concurrency: self.max_concurrency,
                continue_on_error: self.continue_on_error,
                progress: self.bulk_progress,
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::StreamInformation;

    fn document(id: &str) -> ObjectDocument {
        ObjectDocument::new(
            "order",
            id,
            StreamInformation::new(format!("{id}-stream"), "memory", "data", "documents"),
        )
    }

    #[test]
    fn build_requires_a_target() {
        let err = MigrationBuilder::new(document("order-1"))
            .build()
            .expect_err("missing target should fail");
        assert!(matches!(err, BuildError::MissingTarget));
    }

    #[test]
    fn build_rejects_target_equal_to_source() {
        let err = MigrationBuilder::new(document("order-1"))
            .copy_to_new_stream("order-1-stream")
            .build()
            .expect_err("target equal to source should fail");
        assert!(matches!(err, BuildError::TargetEqualsSource(_)));
    }

    #[test]
    fn build_freezes_the_configuration() {
        let context = MigrationBuilder::new(document("order-1"))
            .copy_to_new_stream("order-1-stream-v2")
            .with_backup(BackupConfig::new("/backups"))
            .with_rollback_support()
            .with_metadata("requestedBy", "ops")
            .build()
            .expect("context should build");

        assert_eq!("order-1-stream", context.source_stream_identifier);
        assert_eq!("order-1-stream-v2", context.target_stream_identifier);
        assert!(context.supports_rollback);
        assert_eq!(Some(&"ops".to_owned()), context.metadata.get("requestedBy"));
        assert_eq!(MigrationStrategy::CopyAndTransform, context.strategy);
    }

    #[test]
    fn bulk_build_requires_documents() {
        let err = BulkMigrationBuilder::new(Vec::new())
            .copy_to_new_streams(|d| format!("{}-v2", d.active.stream_identifier))
            .build()
            .expect_err("empty document collection should fail");
        assert!(matches!(err, BuildError::NoDocuments));
    }

    #[test]
    fn bulk_rejects_zero_concurrency() {
        let err = BulkMigrationBuilder::new(vec![document("order-1")])
            .with_max_concurrency(0)
            .expect_err("zero concurrency should fail");
        assert!(matches!(err, BuildError::InvalidConcurrency));
    }

    #[test]
    fn bulk_rejects_live_migration() {
        let err = BulkMigrationBuilder::new(vec![document("order-1")])
            .with_live_migration()
            .expect_err("live migration should be rejected on bulk");
        assert!(matches!(err, BuildError::LiveMigrationNotSupported));
    }

    #[test]
    fn bulk_build_produces_one_context_per_document() {
        let bulk = BulkMigrationBuilder::new(vec![document("order-1"), document("order-2")])
            .copy_to_new_streams(|d| format!("{}-v2", d.active.stream_identifier))
            .configure_each(|b| b.with_rollback_support())
            .build()
            .expect("bulk should build");

        assert_eq!(2, bulk.contexts.len());
        assert_eq!(4, bulk.options.max_concurrency);
        assert!(bulk.contexts.iter().all(|c| c.supports_rollback));
        assert_eq!(
            "order-2-stream-v2",
            bulk.contexts[1].target_stream_identifier
        );

        // Each context gets its own migration id.
        assert_ne!(bulk.contexts[0].migration_id, bulk.contexts[1].migration_id);
    }
}
