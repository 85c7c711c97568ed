//! The leased session: buffered appends against one object document and
//! the two-phase commit protocol that persists them.
//!
//! A session is single-writer by construction: it borrows the document
//! mutably, and `append`/`commit` take `&mut self`. Every exit path of
//! [`LeasedSession::commit`] upholds three invariants: the in-memory
//! stream version reflects exactly the persisted events, any orphaned
//! data-store write is compensated or surfaced as a broken stream, and the
//! buffer is drained iff the commit succeeded.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::document::{
    BrokenStreamInfo, ObjectDocument, RollbackRecord, StreamChunk,
};
use crate::event::{ActionMetadata, Event};
use crate::hooks::{EventDraft, HookSet};
use crate::registry::{EventTypeRegistry, RegistryError};
use crate::store::{DataStore, DocumentStore, StoreError};
use crate::version::Version;

/// Error code reported on a failed commit that is safe to retry.
pub const ERROR_CODE_COMMIT_FAILED: &str = "ELFAES-COMMIT-0001";

/// Error code reported when a failed commit's cleanup also failed.
pub const ERROR_CODE_COMMIT_CLEANUP_FAILED: &str = "ELFAES-COMMIT-0002";

/// Label recorded when the data store does not implement the recovery
/// contract and orphan cleanup could not even be attempted.
const RECOVERY_NOT_SUPPORTED: &str = "recovery_not_supported";

/// Optional per-event arguments of [`LeasedSession::append`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Replaces the registered event name, keeping schema version and codec.
    pub override_event_type: Option<String>,

    /// Causal context to record on the event.
    pub action_metadata: Option<ActionMetadata>,

    /// Sorting key for total-order reads across streams.
    pub external_sequencer: Option<String>,

    /// Free-form string metadata.
    pub metadata: HashMap<String, String>,
}

/// All possible error types returned by [`LeasedSession::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The payload serialized to JSON `null`, which cannot be stored.
    #[error("payload must not serialize to null")]
    NullPayload,

    /// The stream was marked broken by a failed cleanup; it refuses new
    /// appends until reconciled externally.
    #[error("stream '{stream_identifier}' is broken and refuses new events")]
    BrokenStream {
        /// Identifier of the broken stream.
        stream_identifier: String,
    },

    /// The payload type or codec lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Details of a commit that failed but left no orphaned events behind,
/// either because the failure happened before any event write or because
/// cleanup removed them again.
#[derive(Debug)]
pub struct CommitFailure {
    /// Identifier of the stream the commit ran against.
    pub stream_identifier: String,

    /// Stream version before the commit; the in-memory document has been
    /// restored to it.
    pub original_version: Version,

    /// Stream version the commit attempted to reach.
    pub attempted_version: Version,

    /// True when events may exist in the data store beyond
    /// `original_version`. Always false on this variant: either nothing
    /// was written or cleanup removed it.
    pub events_may_be_written: bool,

    /// The storage error that failed the commit.
    pub source: StoreError,
}

/// Details of a commit whose event write failed and whose orphan cleanup
/// failed as well; the stream has been marked broken.
#[derive(Debug)]
pub struct CleanupFailure {
    /// Identifier of the stream the commit ran against.
    pub stream_identifier: String,

    /// Stream version before the commit.
    pub original_version: Version,

    /// Stream version the commit attempted to reach.
    pub attempted_version: Version,

    /// First event version of the orphaned range.
    pub cleanup_from_version: Version,

    /// Last event version of the orphaned range.
    pub cleanup_to_version: Version,

    /// The storage error that failed the commit.
    pub original_commit_error: StoreError,

    /// The error raised by the cleanup attempt; `None` when the data store
    /// does not implement recovery removal.
    pub cleanup_error: Option<StoreError>,
}

/// Outcome of the two-phase commit protocol. `commit` translates the
/// non-success variants into [`CommitError`] at the public boundary.
#[derive(Debug)]
enum CommitOutcome {
    Committed,
    Failed(CommitFailure),
    CleanupFailed(CleanupFailure),
}

/// All possible error types returned by [`LeasedSession::commit`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The commit failed cleanly; the buffer is preserved and the commit is
    /// safe to retry.
    #[error(
        "[{ERROR_CODE_COMMIT_FAILED}] commit on stream '{}' failed, safe to retry: {}",
        .0.stream_identifier,
        .0.source
    )]
    Failed(CommitFailure),

    /// The commit failed and cleanup of the orphaned events failed too; the
    /// stream is now marked broken.
    #[error(
        "[{ERROR_CODE_COMMIT_CLEANUP_FAILED}] commit cleanup on stream '{}' failed for versions {}..={}: {}",
        .0.stream_identifier,
        .0.cleanup_from_version,
        .0.cleanup_to_version,
        .0.original_commit_error
    )]
    CleanupFailed(CleanupFailure),

    /// The stream is broken; commits are refused until reconciled.
    #[error("stream '{stream_identifier}' is broken and refuses commits")]
    BrokenStream {
        /// Identifier of the broken stream.
        stream_identifier: String,
    },
}

/// One batch of buffered events bound for a specific chunk (or for the
/// whole stream when chunking is off).
#[derive(Debug)]
struct CommitBatch {
    events: Vec<Event>,
}

/// A writing session over one object document.
///
/// Obtained through [`EventStream::session`][crate::stream::EventStream::session];
/// buffers appended events and persists them atomically on
/// [`commit`][LeasedSession::commit].
pub struct LeasedSession<'a> {
    document: &'a mut ObjectDocument,
    registry: Arc<EventTypeRegistry>,
    data_store: Arc<dyn DataStore>,
    document_store: Arc<dyn DocumentStore>,
    hooks: &'a HookSet,
    buffer: Vec<Event>,
}

impl<'a> LeasedSession<'a> {
    pub(crate) fn new(
        document: &'a mut ObjectDocument,
        registry: Arc<EventTypeRegistry>,
        data_store: Arc<dyn DataStore>,
        document_store: Arc<dyn DocumentStore>,
        hooks: &'a HookSet,
    ) -> Self {
        Self {
            document,
            registry,
            data_store,
            document_store,
            hooks,
            buffer: Vec::new(),
        }
    }

    /// The document this session writes to.
    pub fn document(&self) -> &ObjectDocument {
        self.document
    }

    /// Number of events buffered and not yet committed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Buffers a payload of a registered type for the next commit.
    ///
    /// Resolves `(event type, schema version, codec)` through the type
    /// registry, runs the pre-append hooks over the encoded payload, and
    /// assigns the tentative version the event will take once committed.
    pub fn append<T>(
        &mut self,
        payload: &T,
        options: AppendOptions,
    ) -> Result<&Event, AppendError>
    where
        T: Any + Send + Sync,
    {
        let registry = Arc::clone(&self.registry);
        let binding = registry.binding_for::<T>()?;
        let payload = binding.encode(payload).map_err(RegistryError::Codec)?;

        self.append_encoded(
            binding.name().to_owned(),
            binding.schema_version(),
            payload,
            options,
        )
    }

    /// Buffers an already-encoded payload, used by stream copies and the
    /// stream-closure marker where no domain type is in play.
    pub fn append_encoded(
        &mut self,
        event_type: String,
        schema_version: u32,
        mut payload: serde_json::Value,
        options: AppendOptions,
    ) -> Result<&Event, AppendError> {
        if self.document.active.is_broken {
            return Err(AppendError::BrokenStream {
                stream_identifier: self.document.active.stream_identifier.clone(),
            });
        }

        if payload.is_null() {
            return Err(AppendError::NullPayload);
        }

        let event_type = options.override_event_type.clone().unwrap_or(event_type);

        let event_version =
            self.document.active.current_stream_version + 1 + self.buffer.len() as Version;

        let draft = EventDraft {
            event_type,
            schema_version,
            event_version,
            action_metadata: options.action_metadata,
        };

        self.hooks
            .run_pre_append(&mut payload, &draft, self.document);

        self.buffer.push(Event {
            event_type: draft.event_type,
            event_version,
            schema_version,
            payload,
            external_sequencer: options.external_sequencer,
            action_metadata: draft.action_metadata,
            metadata: options.metadata,
        });

        Ok(self.buffer.last().expect("buffer cannot be empty here"))
    }

    /// Reads committed events of the active stream, inclusive on both
    /// bounds. Buffered events are not visible until committed.
    pub async fn read(
        &self,
        start_version: Version,
        until_version: Option<Version>,
    ) -> Result<Vec<Event>, StoreError> {
        self.data_store
            .read(self.document, start_version, until_version, None)
            .await
    }

    /// Membership test over the document's terminated streams.
    pub fn is_terminated(&self, stream_identifier: &str) -> bool {
        self.document.is_terminated(stream_identifier)
    }

    /// Persists the buffered events with the two-phase protocol: document
    /// metadata first, then the events.
    ///
    /// On success the buffer is drained. On failure the buffer is kept so
    /// the caller can retry, and the error reports whether events may have
    /// been left behind in the data store.
    pub async fn commit(&mut self) -> Result<(), CommitError> {
        if self.document.active.is_broken {
            return Err(CommitError::BrokenStream {
                stream_identifier: self.document.active.stream_identifier.clone(),
            });
        }

        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.try_commit().await {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Failed(failure) => Err(CommitError::Failed(failure)),
            CommitOutcome::CleanupFailed(failure) => Err(CommitError::CleanupFailed(failure)),
        }
    }

    async fn try_commit(&mut self) -> CommitOutcome {
        let original_version = self.document.active.current_stream_version;
        let original_chunks = self.document.active.stream_chunks.clone();
        let attempted_version = original_version + self.buffer.len() as Version;
        let stream_identifier = self.document.active.stream_identifier.clone();

        // Phase A: advance the document metadata and persist it before any
        // event write, so a failure here leaves the data store untouched.
        let (batches, closed_chunks) = self.plan_batches();

        self.document.active.current_stream_version = attempted_version;

        match self.document_store.set(self.document).await {
            Ok(updated) => *self.document = updated,
            Err(error) => {
                self.document.active.current_stream_version = original_version;
                self.document.active.stream_chunks = original_chunks;
                debug!(
                    stream = %stream_identifier,
                    error = %error,
                    "document update failed before any event write"
                );
                return CommitOutcome::Failed(CommitFailure {
                    stream_identifier,
                    original_version,
                    attempted_version,
                    events_may_be_written: false,
                    source: error,
                });
            },
        }

        for chunk in &closed_chunks {
            self.hooks.run_chunk_closed(chunk, self.document);
        }

        // Phase B: write the events, batch per chunk.
        let mut events_started = false;
        let mut write_error = None;

        for batch in &batches {
            events_started = true;
            if let Err(error) = self.data_store.append(self.document, &batch.events).await {
                write_error = Some(error);
                break;
            }
        }

        let Some(error) = write_error else {
            let committed = std::mem::take(&mut self.buffer);
            self.hooks.run_post_commit(&committed, self.document);
            debug!(
                stream = %stream_identifier,
                events = committed.len(),
                version = attempted_version,
                "commit succeeded"
            );
            return CommitOutcome::Committed;
        };

        // The append dispatched at least one batch, so events may exist in
        // the data store beyond the original version. Try to remove them.
        debug_assert!(events_started);
        let cleanup_from = original_version + 1;
        let cleanup_to = attempted_version;

        let cleanup_result = match self.data_store.recovery() {
            Some(recovery) => Some(
                recovery
                    .remove_events_for_failed_commit(self.document, cleanup_from, cleanup_to)
                    .await,
            ),
            None => None,
        };

        match cleanup_result {
            Some(Ok(events_removed)) => {
                warn!(
                    stream = %stream_identifier,
                    from = cleanup_from,
                    to = cleanup_to,
                    removed = events_removed,
                    "commit failed, orphaned events removed"
                );
                self.document.active.record_rollback(RollbackRecord {
                    rolled_back_at: Utc::now(),
                    from_version: cleanup_from,
                    to_version: cleanup_to,
                    events_removed,
                    original_error: error.to_string(),
                    original_error_kind: error.kind().to_owned(),
                });
                self.document.active.current_stream_version = original_version;
                self.document.active.stream_chunks = original_chunks;

                CommitOutcome::Failed(CommitFailure {
                    stream_identifier,
                    original_version,
                    attempted_version,
                    events_may_be_written: false,
                    source: error,
                })
            },
            cleanup_failure => {
                let cleanup_error = match cleanup_failure {
                    Some(Err(cleanup_error)) => Some(cleanup_error),
                    _ => None,
                };
                let cleanup_error_kind = cleanup_error
                    .as_ref()
                    .map(|e| e.kind())
                    .unwrap_or(RECOVERY_NOT_SUPPORTED);

                error!(
                    stream = %stream_identifier,
                    from = cleanup_from,
                    to = cleanup_to,
                    commit_error = %error,
                    cleanup_error = cleanup_error_kind,
                    "commit cleanup failed, marking stream broken"
                );

                self.document.active.is_broken = true;
                self.document.active.broken_info = Some(BrokenStreamInfo {
                    broken_at: Utc::now(),
                    orphaned_from_version: cleanup_from,
                    orphaned_to_version: cleanup_to,
                    error_message: error.to_string(),
                    original_error_kind: error.kind().to_owned(),
                    cleanup_error_kind: cleanup_error_kind.to_owned(),
                });

                // Best effort: persist the broken marker so reconciliation
                // tooling can find the stream. The in-memory state stays
                // authoritative when this write fails.
                match self.document_store.set(self.document).await {
                    Ok(updated) => *self.document = updated,
                    Err(persist_error) => {
                        warn!(
                            stream = %self.document.active.stream_identifier,
                            error = %persist_error,
                            "failed to persist broken-stream marker"
                        );
                    },
                }

                self.document.active.current_stream_version = original_version;
                self.document.active.stream_chunks = original_chunks;

                CommitOutcome::CleanupFailed(CleanupFailure {
                    stream_identifier,
                    original_version,
                    attempted_version,
                    cleanup_from_version: cleanup_from,
                    cleanup_to_version: cleanup_to,
                    original_commit_error: error,
                    cleanup_error,
                })
            },
        }
    }

    /// Splits the buffer into per-chunk batches and advances the chunk
    /// directory, returning the chunks that filled up in the process.
    ///
    /// Without chunking the whole buffer forms a single batch and the chunk
    /// directory stays empty.
    fn plan_batches(&mut self) -> (Vec<CommitBatch>, Vec<StreamChunk>) {
        let settings = self.document.active.chunk_settings;

        if !settings.enable_chunks || settings.chunk_size == 0 {
            return (
                vec![CommitBatch {
                    events: self.buffer.clone(),
                }],
                Vec::new(),
            );
        }

        let chunk_size = settings.chunk_size;
        let chunks = &mut self.document.active.stream_chunks;
        let mut batches = Vec::new();
        let mut closed = Vec::new();
        let mut remaining = self.buffer.as_slice();

        while !remaining.is_empty() {
            let tail_capacity = match chunks.last() {
                Some(tail) if tail.len() < chunk_size => chunk_size - tail.len(),
                _ => 0,
            };

            if tail_capacity == 0 {
                let next_id = chunks.last().map(|c| c.chunk_identifier + 1).unwrap_or(0);
                let first = remaining[0].event_version;
                chunks.push(StreamChunk {
                    chunk_identifier: next_id,
                    first_event_version: first,
                    // Filled in below as the batch is taken.
                    last_event_version: first - 1,
                });
                continue;
            }

            let take = (tail_capacity as usize).min(remaining.len());
            let (batch, rest) = remaining.split_at(take);
            remaining = rest;

            let tail = chunks.last_mut().expect("tail chunk exists here");
            tail.last_event_version = batch
                .last()
                .expect("batch cannot be empty here")
                .event_version;

            if tail.len() == chunk_size {
                closed.push(*tail);
            }

            batches.push(CommitBatch {
                events: batch.to_vec(),
            });
        }

        (batches, closed)
    }
}

impl std::fmt::Debug for LeasedSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedSession")
            .field("stream", &self.document.active.stream_identifier)
            .field("pending", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::document::StreamInformation;
    use crate::store::{InMemoryDataStore, InMemoryDocumentStore};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct OrderWasPlaced {
        order_id: String,
    }

    fn registry() -> Arc<EventTypeRegistry> {
        let mut registry = EventTypeRegistry::new();
        registry.add::<OrderWasPlaced>("OrderWasPlaced").unwrap();
        registry.freeze();
        Arc::new(registry)
    }

    struct Fixture {
        document: ObjectDocument,
        registry: Arc<EventTypeRegistry>,
        data_store: InMemoryDataStore,
        document_store: InMemoryDocumentStore,
        hooks: HookSet,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                document: ObjectDocument::new(
                    "order",
                    "order-1",
                    StreamInformation::new("stream-1", "memory", "data", "documents"),
                ),
                registry: registry(),
                data_store: InMemoryDataStore::new(),
                document_store: InMemoryDocumentStore::new(),
                hooks: HookSet::new(),
            }
        }

        fn session(&mut self) -> LeasedSession<'_> {
            LeasedSession::new(
                &mut self.document,
                Arc::clone(&self.registry),
                Arc::new(self.data_store.clone()),
                Arc::new(self.document_store.clone()),
                &self.hooks,
            )
        }
    }

    fn placed(order_id: &str) -> OrderWasPlaced {
        OrderWasPlaced {
            order_id: order_id.to_owned(),
        }
    }

    #[tokio::test]
    async fn append_assigns_contiguous_tentative_versions() {
        let mut fixture = Fixture::new();
        let mut session = fixture.session();

        let first = session
            .append(&placed("a"), AppendOptions::default())
            .unwrap()
            .event_version;
        let second = session
            .append(&placed("b"), AppendOptions::default())
            .unwrap()
            .event_version;

        assert_eq!(0, first);
        assert_eq!(1, second);
        assert_eq!(2, session.pending());
    }

    #[tokio::test]
    async fn commit_drains_the_buffer_and_advances_the_version() {
        let mut fixture = Fixture::new();
        let mut session = fixture.session();

        session
            .append(&placed("a"), AppendOptions::default())
            .unwrap();
        session
            .append(&placed("b"), AppendOptions::default())
            .unwrap();
        session.commit().await.expect("commit should not fail");

        assert_eq!(0, session.pending());
        assert_eq!(1, session.document().active.current_stream_version);
        drop(session);

        assert_eq!(2, fixture.data_store.events("stream-1").len());
        assert_eq!(1, fixture.document_store.set_calls());
    }

    #[tokio::test]
    async fn pre_append_hooks_shape_the_buffered_payload() {
        let mut fixture = Fixture::new();
        fixture.hooks.on_pre_append(|payload, draft, _| {
            payload["stampedVersion"] = json!(draft.event_version);
        });

        let mut session = fixture.session();
        let event = session
            .append(&placed("a"), AppendOptions::default())
            .unwrap();

        assert_eq!(json!(0), event.payload["stampedVersion"]);
    }

    #[tokio::test]
    async fn override_event_type_replaces_only_the_name() {
        let mut fixture = Fixture::new();
        let mut session = fixture.session();

        let event = session
            .append(
                &placed("a"),
                AppendOptions {
                    override_event_type: Some("OrderWasImported".to_owned()),
                    ..AppendOptions::default()
                },
            )
            .unwrap();

        assert_eq!("OrderWasImported", event.event_type);
        assert_eq!(1, event.schema_version);
    }

    #[tokio::test]
    async fn document_store_failure_keeps_the_data_store_untouched() {
        let mut fixture = Fixture::new();
        fixture
            .document_store
            .fail_next_set(StoreError::Unavailable("503".to_owned()));

        let mut session = fixture.session();
        session
            .append(&placed("a"), AppendOptions::default())
            .unwrap();

        let err = session.commit().await.expect_err("commit should fail");
        let CommitError::Failed(failure) = err else {
            panic!("expected CommitError::Failed, got: {err}");
        };

        assert!(!failure.events_may_be_written);
        assert_eq!(-1, session.document().active.current_stream_version);
        assert_eq!(1, session.pending());
        drop(session);

        assert_eq!(0, fixture.data_store.append_calls());
    }

    #[tokio::test]
    async fn data_store_failure_with_cleanup_records_a_rollback() {
        let mut fixture = Fixture::new();
        fixture.document.active.current_stream_version = 10;

        // Pretend versions 0..=10 exist so the data store accepts the batch.
        let seeded: Vec<Event> = (0..=10)
            .map(|v| Event {
                event_type: "Seeded".to_owned(),
                event_version: v,
                schema_version: 1,
                payload: json!({}),
                external_sequencer: None,
                action_metadata: None,
                metadata: HashMap::new(),
            })
            .collect();
        let seed_doc = fixture.document.clone();
        fixture
            .data_store
            .append(&seed_doc, &seeded)
            .await
            .unwrap();

        fixture
            .data_store
            .fail_next_append_after(StoreError::Timeout, 3);

        let mut session = fixture.session();
        for i in 0..5 {
            session
                .append(&placed(&format!("o-{i}")), AppendOptions::default())
                .unwrap();
        }

        let err = session.commit().await.expect_err("commit should fail");
        let CommitError::Failed(failure) = err else {
            panic!("expected CommitError::Failed, got: {err}");
        };

        assert!(!failure.events_may_be_written);
        assert_eq!(10, failure.original_version);
        assert_eq!(15, failure.attempted_version);

        let active = &session.document().active;
        assert_eq!(10, active.current_stream_version);
        assert!(!active.is_broken);

        let rollback = &active.rollback_history.as_ref().unwrap()[0];
        assert_eq!(11, rollback.from_version);
        assert_eq!(15, rollback.to_version);
        assert_eq!(3, rollback.events_removed);
        assert_eq!("timeout", rollback.original_error_kind);

        assert_eq!(5, session.pending());
        drop(session);

        // The partially written events were removed again.
        assert_eq!(11, fixture.data_store.events("stream-1").len());
    }

    #[tokio::test]
    async fn failed_cleanup_marks_the_stream_broken() {
        let mut fixture = Fixture::new();
        fixture
            .data_store
            .fail_next_append(StoreError::Unavailable("503".to_owned()));
        fixture.data_store.fail_next_recovery(StoreError::Timeout);

        let mut session = fixture.session();
        session
            .append(&placed("a"), AppendOptions::default())
            .unwrap();

        let err = session.commit().await.expect_err("commit should fail");
        let CommitError::CleanupFailed(failure) = err else {
            panic!("expected CommitError::CleanupFailed, got: {err}");
        };

        assert_eq!(0, failure.cleanup_from_version);
        assert_eq!(0, failure.cleanup_to_version);
        assert!(failure.cleanup_error.is_some());

        let active = &session.document().active;
        assert!(active.is_broken);
        let info = active.broken_info.as_ref().expect("broken info populated");
        assert_eq!("unavailable", info.original_error_kind);
        assert_eq!("timeout", info.cleanup_error_kind);

        // Further work on the session is refused.
        let append_err = session
            .append(&placed("b"), AppendOptions::default())
            .expect_err("append on broken stream should fail");
        assert!(matches!(append_err, AppendError::BrokenStream { .. }));
        assert!(matches!(
            session.commit().await,
            Err(CommitError::BrokenStream { .. })
        ));
        drop(session);

        // Commit set + broken marker set.
        assert_eq!(2, fixture.document_store.set_calls());
    }

    #[tokio::test]
    async fn missing_recovery_contract_behaves_like_failed_cleanup() {
        let mut fixture = Fixture::new();
        fixture.data_store = InMemoryDataStore::without_recovery();
        fixture.data_store.fail_next_append(StoreError::Timeout);

        let mut session = fixture.session();
        session
            .append(&placed("a"), AppendOptions::default())
            .unwrap();

        let err = session.commit().await.expect_err("commit should fail");
        let CommitError::CleanupFailed(failure) = err else {
            panic!("expected CommitError::CleanupFailed, got: {err}");
        };

        assert!(failure.cleanup_error.is_none());
        assert!(session.document().active.is_broken);
        assert_eq!(
            "recovery_not_supported",
            session
                .document()
                .active
                .broken_info
                .as_ref()
                .unwrap()
                .cleanup_error_kind
        );
    }

    #[tokio::test]
    async fn chunked_commit_partitions_the_buffer() {
        let mut fixture = Fixture::new();
        fixture.document.active = fixture.document.active.clone().with_chunks(2);

        let closed = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let closed_count = Arc::clone(&closed);
        fixture.hooks.on_chunk_closed(move |_, _| {
            closed_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let mut session = fixture.session();
        for i in 0..5 {
            session
                .append(&placed(&format!("o-{i}")), AppendOptions::default())
                .unwrap();
        }
        session.commit().await.expect("commit should not fail");

        let active = &session.document().active;
        assert_eq!(4, active.current_stream_version);
        assert_eq!(3, active.stream_chunks.len());
        assert!(active.chunks_are_consistent());
        assert_eq!(2, closed.load(std::sync::atomic::Ordering::SeqCst));
        drop(session);

        // One append per chunk batch.
        assert_eq!(3, fixture.data_store.append_calls());
    }

    #[tokio::test]
    async fn empty_commit_is_a_no_op() {
        let mut fixture = Fixture::new();
        let mut session = fixture.session();

        session.commit().await.expect("empty commit should succeed");
        drop(session);

        assert_eq!(0, fixture.document_store.set_calls());
        assert_eq!(0, fixture.data_store.append_calls());
    }
}
