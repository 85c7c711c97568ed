//! The migration executor: a saga that copies a source stream into a
//! target stream with optional transformation, then atomically cuts the
//! document over.
//!
//! Phases: Prepare, Backup, Copy-Transform, Verify, Cutover, Book-Close,
//! Finalize. A failure after events were written triggers compensating
//! rollback when the context supports it; the finalizer always stops the
//! heartbeat and releases the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupContext, BackupHandle};
use crate::document::{ObjectDocument, StreamClosureReason, StreamInformation, TerminatedStream};
use crate::event::{Event, StreamClosedEvent};
use crate::hooks::HookSet;
use crate::lock::{LockHandle, NoOpLockProvider};
use crate::migration::context::{
    EventTransformer, MigrationContext, MigrationError, MigrationPhase, MigrationResult,
    MigrationStatistics, MigrationStatus, MigrationStrategy, TransformError, VerificationCheck,
    VerificationConfig, VerificationResult,
};
use crate::migration::plan;
use crate::migration::progress::{ControlSignals, ProgressTracker, StatusCell};
use crate::registry::EventTypeRegistry;
use crate::session::{AppendOptions, LeasedSession};
use crate::store::{DataStore, DocumentStore, InMemoryDocumentStore, StoreError};

/// Events per intermediate commit during the copy phase.
const COPY_BATCH_SIZE: usize = 100;

/// Runs the transformation pipeline over one event, in order.
pub(crate) fn run_pipeline(
    transformers: &[Arc<dyn EventTransformer>],
    event: Event,
) -> Result<Event, TransformError> {
    transformers
        .iter()
        .try_fold(event, |event, transformer| transformer.transform(event))
}

fn payload_checksum(payload: &serde_json::Value) -> String {
    // serde_json keeps object keys sorted, so the string form is a stable
    // normalization of the payload.
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Executes one [`MigrationContext`].
pub struct MigrationExecutor {
    context: MigrationContext,
    status: StatusCell,
}

impl MigrationExecutor {
    /// Creates an executor for the given context.
    pub fn new(context: MigrationContext) -> Self {
        Self {
            context,
            status: StatusCell::new(),
        }
    }

    /// The observable status cell of this migration.
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// The context this executor will run.
    pub(crate) fn context_ref(&self) -> &MigrationContext {
        &self.context
    }

    /// Runs the migration to completion, or plans it when the context is a
    /// dry run. Failures are reported through the returned result, never
    /// as a panic or an `Err` at this boundary.
    pub async fn run(self, signals: ControlSignals) -> MigrationResult {
        let migration_id = self.context.migration_id;

        if self.context.is_dry_run {
            return match plan::build_plan(&self.context).await {
                Ok(plan) => {
                    self.status.set(MigrationStatus::Completed);
                    MigrationResult {
                        success: true,
                        status: MigrationStatus::Completed,
                        migration_id,
                        statistics: MigrationStatistics::new(),
                        verification: None,
                        plan: Some(plan),
                        error: None,
                    }
                },
                Err(error) => {
                    self.status.set(MigrationStatus::Failed);
                    MigrationResult {
                        success: false,
                        status: MigrationStatus::Failed,
                        migration_id,
                        statistics: MigrationStatistics::new(),
                        verification: None,
                        plan: None,
                        error: Some(error),
                    }
                },
            };
        }

        let mut saga = Saga::new(self.context, self.status.clone());
        let mut signals = signals;
        let mut statistics = MigrationStatistics::new();

        let outcome = saga.execute(&mut signals, &mut statistics).await;

        let (success, status, error) = match outcome {
            Ok(()) => {
                statistics.completed_at = Some(Utc::now());
                self.status.set(MigrationStatus::Completed);
                info!(%migration_id, "migration completed");
                (true, MigrationStatus::Completed, None)
            },
            Err(error) => {
                let error = saga.map_lock_loss(error);
                let status = saga
                    .compensate(&error, &mut statistics)
                    .await
                    .unwrap_or(match error {
                        MigrationError::Cancelled => MigrationStatus::Cancelled,
                        _ => MigrationStatus::Failed,
                    });
                statistics.completed_at = Some(Utc::now());
                self.status.set(status);
                error!(%migration_id, %error, "migration failed");
                (false, status, Some(error))
            },
        };

        saga.finalize(&mut statistics).await;

        MigrationResult {
            success,
            status,
            migration_id,
            statistics,
            verification: saga.verification.take(),
            plan: None,
            error,
        }
    }
}

/// Saga memo: everything the phases build up and the compensation path
/// needs to unwind.
struct Saga {
    context: MigrationContext,
    status: StatusCell,
    registry: Arc<EventTypeRegistry>,
    hooks: HookSet,
    data_store: Option<Arc<dyn DataStore>>,
    document_store: Option<Arc<dyn DocumentStore>>,
    document: ObjectDocument,
    target_document: ObjectDocument,
    staging_store: Arc<InMemoryDocumentStore>,
    lock_handle: Option<Arc<dyn LockHandle>>,
    heartbeat: Option<JoinHandle<()>>,
    lock_lost: Arc<AtomicBool>,
    backup_handle: Option<BackupHandle>,
    backup_context: Option<BackupContext>,
    events_written: bool,
    cutover_done: bool,
    pre_cutover_active: Option<StreamInformation>,
    verification: Option<VerificationResult>,
    copy_started: Instant,
}

impl Saga {
    fn new(context: MigrationContext, status: StatusCell) -> Self {
        let document = context.source_document.clone();
        let mut target_active = StreamInformation::new(
            context.target_stream_identifier.clone(),
            document.active.stream_type.clone(),
            document.active.data_store.clone(),
            document.active.document_store.clone(),
        );
        target_active.chunk_settings = document.active.chunk_settings;

        let mut target_document = document.clone();
        target_document.active = target_active;
        target_document.etag = None;

        Self {
            context,
            status,
            registry: Arc::new(EventTypeRegistry::new()),
            hooks: HookSet::new(),
            data_store: None,
            document_store: None,
            document,
            target_document,
            staging_store: Arc::new(InMemoryDocumentStore::new()),
            lock_handle: None,
            heartbeat: None,
            lock_lost: Arc::new(AtomicBool::new(false)),
            backup_handle: None,
            backup_context: None,
            events_written: false,
            cutover_done: false,
            pre_cutover_active: None,
            verification: None,
            copy_started: Instant::now(),
        }
    }

    async fn execute(
        &mut self,
        signals: &mut ControlSignals,
        statistics: &mut MigrationStatistics,
    ) -> Result<(), MigrationError> {
        self.prepare(signals).await?;
        self.backup(signals).await?;
        let (kept_source, transformed) = self.copy_transform(signals, statistics).await?;
        self.verify(signals, &kept_source, &transformed).await?;
        self.cutover().await?;
        self.book_close(statistics).await?;
        Ok(())
    }

    // Phase 1: validation, lock acquisition, heartbeat start.
    async fn prepare(&mut self, signals: &ControlSignals) -> Result<(), MigrationError> {
        if self.context.strategy != MigrationStrategy::CopyAndTransform {
            return Err(MigrationError::StrategyNotImplemented(self.context.strategy));
        }

        if self.context.target_stream_identifier == self.context.source_stream_identifier {
            return Err(MigrationError::Validation(
                "target stream must differ from the source stream".to_owned(),
            ));
        }

        let data_store = self
            .context
            .data_store
            .clone()
            .ok_or_else(|| MigrationError::Validation("a data store is required".to_owned()))?;
        let document_store = self.context.document_store.clone().ok_or_else(|| {
            MigrationError::Validation("a document store is required".to_owned())
        })?;

        // Work on the freshest persisted document so the cutover write
        // carries a current concurrency token.
        if let Some(stored) = document_store
            .get(&self.document.object_name, &self.document.object_id)
            .await
            .map_err(|source| MigrationError::Storage {
                phase: MigrationPhase::Prepare,
                source,
            })?
        {
            self.document = stored;
        }

        if self.document.active.stream_identifier != self.context.source_stream_identifier {
            return Err(MigrationError::Validation(format!(
                "document's active stream is '{}', not the migration source '{}'",
                self.document.active.stream_identifier, self.context.source_stream_identifier
            )));
        }

        // Stream identifiers must stay unique across the active stream and
        // the terminated ones; reusing a terminated id would corrupt the
        // document after cutover.
        if self
            .document
            .is_terminated(&self.context.target_stream_identifier)
        {
            return Err(MigrationError::Validation(format!(
                "target stream '{}' already exists as a terminated stream",
                self.context.target_stream_identifier
            )));
        }

        self.data_store = Some(data_store);
        self.document_store = Some(document_store);

        let Some(lock_options) = self.context.lock_options.clone() else {
            return Ok(());
        };

        let provider = self
            .context
            .lock_provider
            .clone()
            .unwrap_or_else(|| Arc::new(NoOpLockProvider));

        let key = self.context.lock_key();
        let handle = provider
            .acquire(&key, lock_options.lock_timeout)
            .await
            .map_err(|e| MigrationError::Validation(e.to_string()))?
            .ok_or(MigrationError::LockAcquisition { key: key.clone() })?;

        debug!(lock_key = %key, lock_id = %handle.lock_id(), "migration lock acquired");

        if let Some(interval) = lock_options.heartbeat_interval {
            self.heartbeat = Some(spawn_heartbeat(
                Arc::clone(&handle),
                interval,
                signals.clone(),
                Arc::clone(&self.lock_lost),
                key,
            ));
        }

        self.lock_handle = Some(handle);
        Ok(())
    }

    // Phase 2: pre-copy backup, skipped without config, a no-op without a
    // provider.
    async fn backup(&mut self, signals: &mut ControlSignals) -> Result<(), MigrationError> {
        let Some(config) = self.context.backup_config.clone() else {
            return Ok(());
        };
        let Some(provider) = self.context.backup_provider.clone() else {
            debug!("backup configured without a provider, skipping");
            return Ok(());
        };

        signals
            .checkpoint(&self.status, MigrationStatus::BackingUp, self.context.supports_pause)
            .await?;
        self.status.set(MigrationStatus::BackingUp);

        let ctx = BackupContext {
            migration_id: self.context.migration_id,
            document: self.document.clone(),
            stream_identifier: self.context.source_stream_identifier.clone(),
            location: config.location.clone(),
        };

        let handle = provider
            .backup(&ctx)
            .await
            .map_err(|source| MigrationError::Backup {
                phase: MigrationPhase::Backup,
                source,
            })?;

        info!(
            migration_id = %self.context.migration_id,
            backup_id = %handle.backup_id,
            events = handle.event_count,
            "backup taken"
        );

        self.backup_handle = Some(handle);
        self.backup_context = Some(ctx);
        Ok(())
    }

    // Phase 3: copy the source stream into the target stream, transforming
    // on the way. Returns the kept source events and their transformed
    // counterparts for verification.
    async fn copy_transform(
        &mut self,
        signals: &mut ControlSignals,
        statistics: &mut MigrationStatistics,
    ) -> Result<(Vec<Event>, Vec<Event>), MigrationError> {
        self.status.set(MigrationStatus::InProgress);
        self.copy_started = Instant::now();

        let data_store = self.data_store.clone().expect("prepare resolved the data store");
        let source_events = data_store
            .read(&self.document, 0, None, None)
            .await
            .map_err(|source| MigrationError::Storage {
                phase: MigrationPhase::CopyTransform,
                source,
            })?;

        statistics.total_events = source_events.len() as u64;

        let fail_fast = self
            .context
            .verification_config
            .as_ref()
            .map(|cfg| cfg.fail_fast)
            .unwrap_or(false);

        let mut progress = ProgressTracker::new(
            self.context.migration_id,
            source_events.len() as u64,
            self.context.progress_config.clone(),
        );

        let mut kept_source = Vec::with_capacity(source_events.len());
        let mut transformed = Vec::with_capacity(source_events.len());

        let staging: Arc<dyn DocumentStore> = self.staging_store.clone();
        let mut session = LeasedSession::new(
            &mut self.target_document,
            Arc::clone(&self.registry),
            data_store.clone(),
            staging,
            &self.hooks,
        );

        for event in source_events {
            signals
                .checkpoint(
                    &self.status,
                    MigrationStatus::InProgress,
                    self.context.supports_pause,
                )
                .await?;

            let output = match run_pipeline(&self.context.transformers, event.clone()) {
                Ok(output) => output,
                Err(failure) => {
                    if fail_fast {
                        return Err(MigrationError::Transformation(failure));
                    }
                    warn!(
                        migration_id = %self.context.migration_id,
                        event_type = %failure.event_type,
                        event_version = failure.event_version,
                        "transformation failed, skipping event"
                    );
                    statistics.transformation_failures += 1;
                    progress.record();
                    continue;
                },
            };

            statistics.total_bytes += output.payload.to_string().len() as u64;

            session
                .append_encoded(
                    output.event_type.clone(),
                    output.schema_version,
                    output.payload.clone(),
                    AppendOptions {
                        override_event_type: None,
                        action_metadata: output.action_metadata.clone(),
                        external_sequencer: output.external_sequencer.clone(),
                        metadata: output.metadata.clone(),
                    },
                )
                .map_err(|e| MigrationError::Validation(e.to_string()))?;

            kept_source.push(event);
            transformed.push(output);

            if session.pending() >= COPY_BATCH_SIZE {
                session.commit().await.map_err(|source| MigrationError::Commit {
                    phase: MigrationPhase::CopyTransform,
                    source,
                })?;
                self.events_written = true;
            }

            statistics.events_transformed += 1;
            progress.record();
        }

        if session.pending() > 0 {
            session.commit().await.map_err(|source| MigrationError::Commit {
                phase: MigrationPhase::CopyTransform,
                source,
            })?;
            self.events_written = true;
        }
        drop(session);

        progress.finish();
        debug!(
            migration_id = %self.context.migration_id,
            copied = statistics.events_transformed,
            skipped = statistics.transformation_failures,
            "copy-transform finished"
        );

        Ok((kept_source, transformed))
    }

    // Phase 4: verification checks over the copied stream.
    async fn verify(
        &mut self,
        signals: &mut ControlSignals,
        kept_source: &[Event],
        transformed: &[Event],
    ) -> Result<(), MigrationError> {
        let Some(config) = self.context.verification_config.clone() else {
            return Ok(());
        };

        signals
            .checkpoint(&self.status, MigrationStatus::Verifying, self.context.supports_pause)
            .await?;
        self.status.set(MigrationStatus::Verifying);

        let data_store = self.data_store.clone().expect("prepare resolved the data store");
        let target_events = data_store
            .read(&self.target_document, 0, None, None)
            .await
            .map_err(|source| MigrationError::Storage {
                phase: MigrationPhase::Verify,
                source,
            })?;

        let mut result = VerificationResult {
            valid: true,
            checks: Vec::new(),
        };

        let record = |result: &mut VerificationResult,
                          name: &str,
                          passed: bool,
                          message: String|
         -> bool {
            result.checks.push(VerificationCheck {
                name: name.to_owned(),
                passed,
                message,
            });
            if !passed {
                result.valid = false;
            }
            !passed && config.fail_fast
        };

        let count_ok = target_events.len() == kept_source.len();
        if record(
            &mut result,
            "event count",
            count_ok,
            format!(
                "target has {} events, expected {}",
                target_events.len(),
                kept_source.len()
            ),
        ) {
            return self.fail_verification(result);
        }

        if config.verify_checksums {
            let mismatches = transformed
                .iter()
                .zip(target_events.iter())
                .filter(|(expected, actual)| {
                    payload_checksum(&expected.payload) != payload_checksum(&actual.payload)
                })
                .count();
            if record(
                &mut result,
                "payload checksums",
                mismatches == 0,
                format!("{mismatches} payload checksum mismatches"),
            ) {
                return self.fail_verification(result);
            }
        }

        let integrity_ok = target_events
            .iter()
            .enumerate()
            .all(|(i, event)| event.event_version == i as i64);
        if record(
            &mut result,
            "stream integrity",
            integrity_ok,
            "target event versions must be dense and monotone".to_owned(),
        ) {
            return self.fail_verification(result);
        }

        if !kept_source.is_empty() && config.transformation_sample_size > 0 {
            let mut indices: Vec<usize> = (0..kept_source.len()).collect();
            let sample_size = config.transformation_sample_size.min(indices.len());
            indices.shuffle(&mut rand::thread_rng());
            indices.truncate(sample_size);

            let mut sample_failures = 0usize;
            for index in indices {
                let reapplied =
                    run_pipeline(&self.context.transformers, kept_source[index].clone());
                let matches = match (reapplied, target_events.get(index)) {
                    (Ok(expected), Some(actual)) => expected.payload == actual.payload,
                    _ => false,
                };
                if !matches {
                    sample_failures += 1;
                }
            }

            if record(
                &mut result,
                "transformation sampling",
                sample_failures == 0,
                format!("{sample_failures} of {sample_size} sampled events diverged"),
            ) {
                return self.fail_verification(result);
            }
        }

        for validation in &config.custom_validations {
            let outcome = (validation.check)(kept_source, &target_events);
            let (passed, message) = match outcome {
                Ok(()) => (true, String::new()),
                Err(message) => (false, message),
            };
            if record(&mut result, &validation.name, passed, message) {
                return self.fail_verification(result);
            }
        }

        if result.valid {
            self.verification = Some(result);
            Ok(())
        } else {
            self.fail_verification(result)
        }
    }

    fn fail_verification(&mut self, result: VerificationResult) -> Result<(), MigrationError> {
        let failed_checks = result
            .checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.name.clone())
            .collect();
        self.verification = Some(result);
        Err(MigrationError::Verification { failed_checks })
    }

    // Phase 5: the single linearization point. Appends the closure marker
    // to the source stream, swaps the active pointer and persists the
    // document once.
    async fn cutover(&mut self) -> Result<(), MigrationError> {
        self.status.set(MigrationStatus::CuttingOver);

        let data_store = self.data_store.clone().expect("prepare resolved the data store");
        let document_store = self
            .document_store
            .clone()
            .expect("prepare resolved the document store");

        let source_active = self.document.active.clone();
        let last_business_event_version = source_active.current_stream_version;
        let closed_at = Utc::now();

        let closed = StreamClosedEvent {
            stream_identifier: source_active.stream_identifier.clone(),
            continuation_stream_id: self.target_document.active.stream_identifier.clone(),
            continuation_stream_type: self.target_document.active.stream_type.clone(),
            continuation_data_store: self.target_document.active.data_store.clone(),
            continuation_document_store: self.target_document.active.document_store.clone(),
            reason: StreamClosureReason::Migration,
            closed_at,
            migration_id: Some(self.context.migration_id),
            last_business_event_version,
        };

        let marker = closed
            .into_event(last_business_event_version + 1)
            .map_err(|e| MigrationError::Storage {
                phase: MigrationPhase::Cutover,
                source: StoreError::Internal(anyhow::anyhow!(e)),
            })?;

        data_store
            .append(&self.document, &[marker])
            .await
            .map_err(|source| MigrationError::Storage {
                phase: MigrationPhase::Cutover,
                source,
            })?;

        self.pre_cutover_active = Some(source_active.clone());

        self.document.terminated_streams.push(TerminatedStream {
            stream_identifier: source_active.stream_identifier.clone(),
            continuation_stream_id: self.target_document.active.stream_identifier.clone(),
            continuation_stream_type: self.target_document.active.stream_type.clone(),
            continuation_data_store: self.target_document.active.data_store.clone(),
            continuation_document_store: self.target_document.active.document_store.clone(),
            reason: StreamClosureReason::Migration,
            closed_at,
            migration_id: Some(self.context.migration_id),
            last_business_event_version,
            metadata: None,
            deleted: false,
        });
        self.document.active = self.target_document.active.clone();

        match document_store.set(&self.document).await {
            Ok(updated) => {
                self.document = updated;
                self.cutover_done = true;
                info!(
                    migration_id = %self.context.migration_id,
                    source = %source_active.stream_identifier,
                    target = %self.document.active.stream_identifier,
                    "cutover committed"
                );
                Ok(())
            },
            Err(source) => {
                // Undo the in-memory swap; the persisted document still
                // points at the source stream.
                self.document.terminated_streams.pop();
                self.document.active = source_active;
                self.pre_cutover_active = None;
                Err(MigrationError::Storage {
                    phase: MigrationPhase::Cutover,
                    source,
                })
            },
        }
    }

    // Phase 6: terminated-stream bookkeeping.
    async fn book_close(
        &mut self,
        statistics: &mut MigrationStatistics,
    ) -> Result<(), MigrationError> {
        let Some(config) = self.context.book_closing_config.clone() else {
            return Ok(());
        };

        let document_store = self
            .document_store
            .clone()
            .expect("prepare resolved the document store");

        let (document, changed) = close_books(
            document_store.as_ref(),
            &self.document,
            &self.context.source_stream_identifier,
            &config,
        )
        .await?;
        self.document = document;

        debug!(
            migration_id = %self.context.migration_id,
            stream = %self.context.source_stream_identifier,
            changed,
            "book-closing finished"
        );

        if config.create_snapshot {
            statistics.snapshot_created = true;
        }

        Ok(())
    }

    // Compensation: runs when a step failed after events were written and
    // the context supports rollback. Returns the terminal status when it
    // decided one.
    async fn compensate(
        &mut self,
        error: &MigrationError,
        statistics: &mut MigrationStatistics,
    ) -> Option<MigrationStatus> {
        let cancelled = matches!(error, MigrationError::Cancelled);

        if !self.context.supports_rollback || !self.events_written {
            return cancelled.then_some(MigrationStatus::Cancelled);
        }

        self.status.set(MigrationStatus::RollingBack);
        info!(
            migration_id = %self.context.migration_id,
            "running compensating rollback"
        );

        if self.cutover_done {
            self.reverse_cutover().await;
        }

        match (
            self.context.backup_provider.clone(),
            self.backup_handle.as_ref(),
            self.backup_context.as_ref(),
        ) {
            (Some(provider), Some(handle), Some(ctx)) => {
                match provider.restore(handle, ctx).await {
                    Ok(()) => {
                        info!(
                            migration_id = %self.context.migration_id,
                            backup_id = %handle.backup_id,
                            "backup restored"
                        );
                    },
                    Err(restore_error) => {
                        error!(
                            migration_id = %self.context.migration_id,
                            %restore_error,
                            "backup restore failed during rollback"
                        );
                    },
                }
            },
            _ => {
                warn!(
                    migration_id = %self.context.migration_id,
                    target = %self.context.target_stream_identifier,
                    "rollback without a backup: the target stream remains as orphan data"
                );
            },
        }

        statistics.rolled_back = true;
        Some(MigrationStatus::RolledBack)
    }

    // Reverses the active-stream swap and removes the closure marker from
    // the source stream, best effort.
    async fn reverse_cutover(&mut self) {
        let Some(pre_cutover) = self.pre_cutover_active.clone() else {
            return;
        };
        let Some(document_store) = self.document_store.clone() else {
            return;
        };

        let mut document = match document_store
            .get(&self.document.object_name, &self.document.object_id)
            .await
        {
            Ok(Some(document)) => document,
            _ => self.document.clone(),
        };

        document
            .terminated_streams
            .retain(|t| t.migration_id != Some(self.context.migration_id));
        document.active = pre_cutover.clone();

        match document_store.set(&document).await {
            Ok(updated) => {
                self.document = updated;
                self.cutover_done = false;
                info!(
                    migration_id = %self.context.migration_id,
                    "cutover reversed, active stream restored"
                );
            },
            Err(error) => {
                error!(
                    migration_id = %self.context.migration_id,
                    %error,
                    "failed to reverse cutover"
                );
                return;
            },
        }

        // The closure marker is now an orphan beyond the restored version.
        if let Some(recovery) = self.data_store.as_ref().and_then(|ds| ds.recovery()) {
            let marker_version = pre_cutover.current_stream_version + 1;
            if let Err(error) = recovery
                .remove_events_for_failed_commit(&self.document, marker_version, marker_version)
                .await
            {
                warn!(
                    migration_id = %self.context.migration_id,
                    %error,
                    "failed to remove the stream-closure marker"
                );
            }
        }
    }

    // Phase 7 support: always runs, also after failures.
    async fn finalize(&mut self, statistics: &mut MigrationStatistics) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        if let Some(handle) = self.lock_handle.take() {
            if let Err(error) = handle.release().await {
                warn!(
                    migration_id = %self.context.migration_id,
                    %error,
                    "failed to release migration lock"
                );
            }
        }

        let elapsed = self.copy_started.elapsed().as_secs_f64();
        statistics.average_events_per_second = if elapsed > f64::EPSILON {
            statistics.events_transformed as f64 / elapsed
        } else {
            0.0
        };
    }

    fn map_lock_loss(&self, error: MigrationError) -> MigrationError {
        if matches!(error, MigrationError::Cancelled) && self.lock_lost.load(Ordering::SeqCst) {
            return MigrationError::LockLost {
                key: self.context.lock_key(),
            };
        }
        error
    }
}

/// Closes the books on a terminated stream: updates its reason, deleted
/// flag and merged metadata (including `archiveLocation`), and persists
/// the document when anything actually changed.
///
/// Idempotent: re-running against already-closed state persists nothing
/// and reports `false`.
pub async fn close_books(
    document_store: &dyn DocumentStore,
    document: &ObjectDocument,
    source_stream_identifier: &str,
    config: &crate::migration::context::BookClosingConfig,
) -> Result<(ObjectDocument, bool), MigrationError> {
    let mut document = document_store
        .get(&document.object_name, &document.object_id)
        .await
        .map_err(|source| MigrationError::Storage {
            phase: MigrationPhase::BookClose,
            source,
        })?
        .unwrap_or_else(|| document.clone());

    let Some(terminated) = document
        .terminated_streams
        .iter_mut()
        .find(|t| t.stream_identifier == source_stream_identifier)
    else {
        return Err(MigrationError::Validation(format!(
            "no terminated stream '{source_stream_identifier}' to close books on"
        )));
    };

    let mut desired_metadata = terminated.metadata.clone().unwrap_or_default();
    for (key, value) in &config.metadata {
        desired_metadata.insert(key.clone(), value.clone());
    }
    if let Some(location) = &config.archive_location {
        desired_metadata.insert("archiveLocation".to_owned(), location.clone());
    }

    let desired_reason = StreamClosureReason::Other(config.reason.clone());
    let changed = terminated.reason != desired_reason
        || terminated.deleted != config.mark_as_deleted
        || terminated.metadata.as_ref() != Some(&desired_metadata);

    if !changed {
        return Ok((document, false));
    }

    terminated.reason = desired_reason;
    terminated.deleted = config.mark_as_deleted;
    terminated.metadata = Some(desired_metadata);

    let updated = document_store
        .set(&document)
        .await
        .map_err(|source| MigrationError::Storage {
            phase: MigrationPhase::BookClose,
            source,
        })?;

    Ok((updated, true))
}

fn spawn_heartbeat(
    handle: Arc<dyn LockHandle>,
    interval: Duration,
    signals: ControlSignals,
    lock_lost: Arc<AtomicBool>,
    key: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the loop starts after one
        // full interval.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match handle.renew().await {
                Ok(true) => {
                    debug!(lock_key = %key, "migration lock renewed");
                },
                outcome => {
                    warn!(lock_key = %key, ?outcome, "lock renewal failed, cancelling migration");
                    lock_lost.store(true, Ordering::SeqCst);
                    signals.trip_cancel();
                    break;
                },
            }
        }
    })
}

/// Convenience entry point used by the migration service and tests: runs
/// a context with detached signals.
pub async fn execute(context: MigrationContext) -> MigrationResult {
    MigrationExecutor::new(context)
        .run(ControlSignals::none())
        .await
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::lock::DistributedLockProvider;
    use crate::migration::builder::MigrationBuilder;
    use crate::migration::context::FnTransformer;
    use crate::store::{DocumentStore, InMemoryDataStore, InMemoryDocumentStore};
    use crate::version::Version;

    fn document() -> ObjectDocument {
        ObjectDocument::new(
            "order",
            "order-1",
            StreamInformation::new("stream-1", "memory", "data", "documents"),
        )
    }

    fn event(version: Version, event_type: &str) -> Event {
        Event {
            event_type: event_type.to_owned(),
            event_version: version,
            schema_version: 1,
            payload: json!({"n": version}),
            external_sequencer: None,
            action_metadata: None,
            metadata: HashMap::new(),
        }
    }

    async fn seeded_stores(
        doc: &mut ObjectDocument,
        events: usize,
    ) -> (Arc<InMemoryDataStore>, Arc<InMemoryDocumentStore>) {
        let data_store = Arc::new(InMemoryDataStore::new());
        let document_store = Arc::new(InMemoryDocumentStore::new());

        let seeded: Vec<Event> = (0..events)
            .map(|i| event(i as Version, if i % 2 == 0 { "EventA" } else { "EventB" }))
            .collect();
        data_store.append(doc, &seeded).await.unwrap();
        doc.active.current_stream_version = events as Version - 1;
        *doc = document_store.set(doc).await.unwrap();

        (data_store, document_store)
    }

    #[tokio::test]
    async fn migration_copies_and_cuts_over() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 4).await;

        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_stores(data_store.clone(), document_store.clone())
            .build()
            .unwrap();

        let result = execute(context).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(MigrationStatus::Completed, result.status);
        assert_eq!(4, result.statistics.total_events);
        assert_eq!(4, result.statistics.events_transformed);

        // The target stream holds the copied events in source order.
        let target_events = data_store.events("stream-2");
        assert_eq!(4, target_events.len());
        assert_eq!(
            vec![0, 1, 2, 3],
            target_events
                .iter()
                .map(|e| e.event_version)
                .collect::<Vec<_>>()
        );

        // The source stream got the closure marker as its last event.
        let source_events = data_store.events("stream-1");
        assert_eq!(5, source_events.len());
        assert!(source_events.last().unwrap().is_stream_closed());

        // The stored document now points at the target stream.
        let stored = document_store.stored("order", "order-1").unwrap();
        assert_eq!("stream-2", stored.active.stream_identifier);
        assert_eq!(3, stored.active.current_stream_version);
        assert!(stored.is_terminated("stream-1"));
    }

    #[tokio::test]
    async fn transformer_failures_are_skipped_without_fail_fast() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 4).await;

        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_stores(data_store.clone(), document_store)
            .with_transformer(Arc::new(FnTransformer(|event: Event| {
                if event.event_type == "EventB" {
                    return Err(TransformError {
                        event_type: event.event_type,
                        event_version: event.event_version,
                        message: "unsupported".to_owned(),
                    });
                }
                Ok(event)
            })))
            .build()
            .unwrap();

        let result = execute(context).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(2, result.statistics.transformation_failures);
        assert_eq!(2, result.statistics.events_transformed);
        assert_eq!(2, data_store.events("stream-2").len());
    }

    #[tokio::test]
    async fn reserved_strategies_are_rejected() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 1).await;

        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_strategy(MigrationStrategy::LazyTransform)
            .with_stores(data_store, document_store)
            .build()
            .unwrap();

        let result = execute(context).await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(MigrationError::StrategyNotImplemented(
                MigrationStrategy::LazyTransform
            ))
        ));
    }

    #[tokio::test]
    async fn contended_lock_fails_fast() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 1).await;

        let provider = Arc::new(crate::lock::InMemoryLockProvider::default());
        let held = provider
            .acquire("migration:order-1:stream-1", Duration::from_millis(1))
            .await
            .unwrap()
            .expect("pre-acquire should succeed");

        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_stores(data_store.clone(), document_store)
            .with_lock(crate::lock::LockOptions {
                lock_timeout: Duration::from_millis(30),
                lease_duration: Duration::from_secs(5),
                heartbeat_interval: None,
            })
            .with_lock_provider(provider)
            .build()
            .unwrap();

        let result = execute(context).await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(MigrationError::LockAcquisition { .. })
        ));
        assert!(data_store.events("stream-2").is_empty());

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn verification_catches_a_short_target() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 3).await;

        // A custom validation that always fails stands in for a corrupted
        // copy; the built-in checks all pass on this healthy run.
        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_stores(data_store, document_store.clone())
            .with_verification(VerificationConfig {
                fail_fast: false,
                verify_checksums: true,
                transformation_sample_size: 2,
                custom_validations: vec![crate::migration::context::CustomValidation {
                    name: "refuse everything".to_owned(),
                    check: Arc::new(|_, _| Err("nope".to_owned())),
                }],
            })
            .build()
            .unwrap();

        let result = execute(context).await;

        assert!(!result.success);
        let verification = result.verification.expect("verification ran");
        assert!(!verification.valid);
        assert!(verification
            .checks
            .iter()
            .any(|c| c.name == "refuse everything" && !c.passed));
        assert!(verification
            .checks
            .iter()
            .any(|c| c.name == "event count" && c.passed));

        // The cutover never ran: the document still points at the source.
        let stored = document_store.stored("order", "order-1").unwrap();
        assert_eq!("stream-1", stored.active.stream_identifier);
    }

    #[tokio::test]
    async fn cancelled_migration_reports_cancelled() {
        let mut doc = document();
        let (data_store, document_store) = seeded_stores(&mut doc, 3).await;

        let context = MigrationBuilder::new(doc)
            .copy_to_new_stream("stream-2")
            .with_stores(data_store, document_store)
            .build()
            .unwrap();

        let (controls, signals) = ControlSignals::channel();
        controls.cancel();

        let result = MigrationExecutor::new(context).run(signals).await;

        assert!(!result.success);
        assert_eq!(MigrationStatus::Cancelled, result.status);
        assert!(matches!(result.error, Some(MigrationError::Cancelled)));
    }
}
