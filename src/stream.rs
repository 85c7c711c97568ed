//! The event stream facade: per-document entry point tying together the
//! stores, registries, hooks and the commit engine.

use std::sync::Arc;

use tracing::debug;

use crate::aggregate::Aggregate;
use crate::document::{ObjectDocument, StreamSnapShot};
use crate::event::Event;
use crate::hooks::HookSet;
use crate::registry::EventTypeRegistry;
use crate::session::LeasedSession;
use crate::store::{DataStore, DocumentStore, Snapshot, SnapshotStore, StoreError};
use crate::upcast::UpcasterRegistry;
use crate::version::{Version, NO_STREAM};

/// Existence requirement checked when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// No requirement on the stream's existence.
    Any,
    /// The stream must not have any committed events yet.
    New,
    /// The stream must already have committed events.
    Existing,
}

/// The stream's existence did not match the session constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "stream '{stream_identifier}' does not satisfy the {required:?} constraint \
     (current version: {current_stream_version})"
)]
pub struct ConstraintError {
    /// Identifier of the stream the session was opened for.
    pub stream_identifier: String,

    /// The requirement that was violated.
    pub required: Constraint,

    /// The stream's current version at the time of the check.
    pub current_stream_version: Version,
}

/// All possible error types returned by [`EventStream::read`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The underlying data store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// All possible error types returned by the snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No snapshot store (and therefore no state codec) is bound to this
    /// stream.
    #[error("no snapshot store is bound to stream '{stream_identifier}'")]
    CodecNotBound {
        /// Identifier of the stream a snapshot was requested for.
        stream_identifier: String,
    },

    /// The stream is broken; snapshots are refused until reconciled.
    #[error("stream '{stream_identifier}' is broken and refuses snapshots")]
    BrokenStream {
        /// Identifier of the broken stream.
        stream_identifier: String,
    },

    /// The requested version exceeds the committed stream.
    #[error("cannot snapshot until version {until_version}, stream is at {current_stream_version}")]
    VersionOutOfRange {
        /// Requested fold boundary.
        until_version: Version,
        /// The stream's actual version.
        current_stream_version: Version,
    },

    /// The aggregate state failed to serialize or deserialize.
    #[error("failed to convert snapshot state: {0}")]
    State(#[from] serde_json::Error),

    /// The underlying stores failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options of [`EventStream::read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Sort the result lexicographically by
    /// [`external_sequencer`][crate::event::Event::external_sequencer]
    /// instead of stream order. Events without a sequencer sort last.
    pub use_external_sequencer: bool,
}

/// Per-document facade over one active event stream.
///
/// Owns the document between commits; sessions borrow it mutably so a
/// stale copy can never be committed twice.
pub struct EventStream {
    document: ObjectDocument,
    registry: Arc<EventTypeRegistry>,
    upcasters: Arc<UpcasterRegistry>,
    data_store: Arc<dyn DataStore>,
    document_store: Arc<dyn DocumentStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    hooks: HookSet,
}

impl EventStream {
    /// Creates a stream facade over the given document and dependencies.
    pub fn new(
        document: ObjectDocument,
        registry: Arc<EventTypeRegistry>,
        upcasters: Arc<UpcasterRegistry>,
        data_store: Arc<dyn DataStore>,
        document_store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            document,
            registry,
            upcasters,
            data_store,
            document_store,
            snapshot_store: None,
            hooks: HookSet::new(),
        }
    }

    /// Binds a snapshot store, enabling the snapshot operations.
    #[must_use]
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// The document this stream operates on.
    pub fn document(&self) -> &ObjectDocument {
        &self.document
    }

    /// Hands the document back, consuming the facade.
    pub fn into_document(self) -> ObjectDocument {
        self.document
    }

    /// Mutable access to the hook registrations of this stream.
    pub fn hooks_mut(&mut self) -> &mut HookSet {
        &mut self.hooks
    }

    /// Membership test over the document's terminated streams.
    pub fn is_terminated(&self, stream_identifier: &str) -> bool {
        self.document.is_terminated(stream_identifier)
    }

    /// Opens a writing session after checking the existence constraint.
    pub fn session(&mut self, constraint: Constraint) -> Result<LeasedSession<'_>, ConstraintError> {
        let current = self.document.active.current_stream_version;
        let satisfied = match constraint {
            Constraint::Any => true,
            Constraint::New => current == NO_STREAM,
            Constraint::Existing => current > NO_STREAM,
        };

        if !satisfied {
            return Err(ConstraintError {
                stream_identifier: self.document.active.stream_identifier.clone(),
                required: constraint,
                current_stream_version: current,
            });
        }

        Ok(LeasedSession::new(
            &mut self.document,
            Arc::clone(&self.registry),
            Arc::clone(&self.data_store),
            Arc::clone(&self.document_store),
            &self.hooks,
        ))
    }

    /// Reads the whole stream: chunk by chunk when chunking is enabled,
    /// in one sweep otherwise. Each event runs through the upcaster chain
    /// (fanning out into zero or more events), then through the post-read
    /// hooks; the result is optionally re-sorted by external sequencer.
    pub async fn read(&self, options: ReadOptions) -> Result<Vec<Event>, ReadError> {
        let raw = self.read_raw().await?;

        let mut events: Vec<Event> = raw
            .into_iter()
            .flat_map(|event| self.upcasters.apply(event))
            .collect();

        if options.use_external_sequencer {
            events.sort_by(|a, b| match (&a.external_sequencer, &b.external_sequencer) {
                (Some(left), Some(right)) => left.cmp(right),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.event_version.cmp(&b.event_version),
            });
        }

        self.hooks.run_post_read(&mut events, &self.document);

        Ok(events)
    }

    async fn read_raw(&self) -> Result<Vec<Event>, StoreError> {
        let active = &self.document.active;

        if !active.chunk_settings.enable_chunks || active.stream_chunks.is_empty() {
            return self.data_store.read(&self.document, 0, None, None).await;
        }

        let mut events = Vec::with_capacity(active.event_count() as usize);
        for chunk in &active.stream_chunks {
            let mut chunk_events = self
                .data_store
                .read(&self.document, 0, None, Some(chunk.chunk_identifier))
                .await?;
            events.append(&mut chunk_events);
        }

        Ok(events)
    }

    /// Builds an aggregate snapshot by folding events up to and including
    /// `until_version`, persists it through the snapshot store, and records
    /// it on the document.
    pub async fn snapshot<A>(
        &mut self,
        until_version: Version,
        name: Option<String>,
    ) -> Result<Snapshot, SnapshotError>
    where
        A: Aggregate,
    {
        let snapshot_store = self.snapshot_store.clone().ok_or_else(|| {
            SnapshotError::CodecNotBound {
                stream_identifier: self.document.active.stream_identifier.clone(),
            }
        })?;

        if self.document.active.is_broken {
            return Err(SnapshotError::BrokenStream {
                stream_identifier: self.document.active.stream_identifier.clone(),
            });
        }

        let current = self.document.active.current_stream_version;
        if until_version > current || until_version < 0 {
            return Err(SnapshotError::VersionOutOfRange {
                until_version,
                current_stream_version: current,
            });
        }

        let events = self
            .data_store
            .read(&self.document, 0, Some(until_version), None)
            .await?;

        let state = A::fold(&events);
        let snapshot = Snapshot {
            until_version,
            name: name.clone(),
            state: serde_json::to_value(state)?,
        };

        snapshot_store.set(snapshot.clone(), &self.document).await?;

        self.document.active.snapshots.push(StreamSnapShot {
            until_version,
            name,
        });
        self.document = self.document_store.set(&self.document).await?;

        debug!(
            stream = %self.document.active.stream_identifier,
            until_version,
            "snapshot created"
        );

        Ok(snapshot)
    }

    /// Loads a previously persisted snapshot and deserializes its state.
    pub async fn load_snapshot<A>(
        &self,
        until_version: Version,
        name: Option<&str>,
    ) -> Result<Option<(A::State, Version)>, SnapshotError>
    where
        A: Aggregate,
    {
        let snapshot_store = self.snapshot_store.clone().ok_or_else(|| {
            SnapshotError::CodecNotBound {
                stream_identifier: self.document.active.stream_identifier.clone(),
            }
        })?;

        let Some(snapshot) = snapshot_store
            .get(&self.document, until_version, name)
            .await?
        else {
            return Ok(None);
        };

        let state: A::State = serde_json::from_value(snapshot.state)?;
        Ok(Some((state, snapshot.until_version)))
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("stream", &self.document.active.stream_identifier)
            .field("version", &self.document.active.current_stream_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::document::StreamInformation;
    use crate::session::AppendOptions;
    use crate::store::{InMemoryDataStore, InMemoryDocumentStore, InMemorySnapshotStore};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct OrderWasPlaced {
        order_id: String,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct OrderCount {
        placed: u32,
    }

    struct OrderAggregate;

    impl Aggregate for OrderAggregate {
        type State = OrderCount;

        fn apply(mut state: Self::State, event: &Event) -> Self::State {
            if event.event_type == "OrderWasPlaced" {
                state.placed += 1;
            }
            state
        }
    }

    fn registry() -> Arc<EventTypeRegistry> {
        let mut registry = EventTypeRegistry::new();
        registry.add::<OrderWasPlaced>("OrderWasPlaced").unwrap();
        registry.freeze();
        Arc::new(registry)
    }

    fn stream(upcasters: UpcasterRegistry) -> EventStream {
        EventStream::new(
            ObjectDocument::new(
                "order",
                "order-1",
                StreamInformation::new("stream-1", "memory", "data", "documents"),
            ),
            registry(),
            Arc::new(upcasters),
            Arc::new(InMemoryDataStore::new()),
            Arc::new(InMemoryDocumentStore::new()),
        )
    }

    fn placed(order_id: &str) -> OrderWasPlaced {
        OrderWasPlaced {
            order_id: order_id.to_owned(),
        }
    }

    #[tokio::test]
    async fn new_constraint_rejects_existing_streams() {
        let mut stream = stream(UpcasterRegistry::new());

        {
            let mut session = stream.session(Constraint::New).expect("stream is new");
            session
                .append(&placed("a"), AppendOptions::default())
                .unwrap();
            session.commit().await.unwrap();
        }

        let err = stream
            .session(Constraint::New)
            .expect_err("stream exists now");
        assert_eq!(Constraint::New, err.required);
        assert_eq!(0, err.current_stream_version);

        assert!(stream.session(Constraint::Existing).is_ok());
    }

    #[tokio::test]
    async fn existing_constraint_rejects_new_streams() {
        let mut stream = stream(UpcasterRegistry::new());

        let err = stream
            .session(Constraint::Existing)
            .expect_err("stream does not exist yet");
        assert_eq!(Constraint::Existing, err.required);
    }

    #[tokio::test]
    async fn read_applies_the_upcaster_chain() {
        let mut upcasters = UpcasterRegistry::new();
        upcasters
            .add("OrderWasPlaced", 1, 2, |mut payload| {
                payload["currency"] = json!("EUR");
                vec![payload]
            })
            .unwrap();

        let mut stream = stream(upcasters);
        {
            let mut session = stream.session(Constraint::Any).unwrap();
            session
                .append(&placed("a"), AppendOptions::default())
                .unwrap();
            session.commit().await.unwrap();
        }

        let events = stream.read(ReadOptions::default()).await.unwrap();
        assert_eq!(1, events.len());
        assert_eq!(2, events[0].schema_version);
        assert_eq!(json!("EUR"), events[0].payload["currency"]);
    }

    #[tokio::test]
    async fn read_sorts_by_external_sequencer_when_asked() {
        let mut stream = stream(UpcasterRegistry::new());
        {
            let mut session = stream.session(Constraint::Any).unwrap();
            for sequencer in ["b", "a", "c"] {
                session
                    .append(
                        &placed(sequencer),
                        AppendOptions {
                            external_sequencer: Some(sequencer.to_owned()),
                            ..AppendOptions::default()
                        },
                    )
                    .unwrap();
            }
            session.commit().await.unwrap();
        }

        let events = stream
            .read(ReadOptions {
                use_external_sequencer: true,
            })
            .await
            .unwrap();

        let order: Vec<_> = events
            .iter()
            .map(|e| e.external_sequencer.clone().unwrap())
            .collect();
        assert_eq!(vec!["a", "b", "c"], order);
    }

    #[tokio::test]
    async fn snapshot_requires_a_bound_store() {
        let mut stream = stream(UpcasterRegistry::new());

        let err = stream
            .snapshot::<OrderAggregate>(0, None)
            .await
            .expect_err("no snapshot store is bound");
        assert!(matches!(err, SnapshotError::CodecNotBound { .. }));
    }

    #[tokio::test]
    async fn snapshot_folds_and_persists() {
        let snapshot_store = Arc::new(InMemorySnapshotStore::new());
        let mut stream =
            stream(UpcasterRegistry::new()).with_snapshot_store(snapshot_store.clone());

        {
            let mut session = stream.session(Constraint::Any).unwrap();
            for i in 0..3 {
                session
                    .append(&placed(&format!("o-{i}")), AppendOptions::default())
                    .unwrap();
            }
            session.commit().await.unwrap();
        }

        let snapshot = stream
            .snapshot::<OrderAggregate>(1, None)
            .await
            .expect("snapshot should not fail");
        assert_eq!(1, snapshot.until_version);
        assert_eq!(json!({"placed": 2}), snapshot.state);

        assert_eq!(
            vec![StreamSnapShot {
                until_version: 1,
                name: None,
            }],
            stream.document().active.snapshots
        );

        let (state, version) = stream
            .load_snapshot::<OrderAggregate>(1, None)
            .await
            .expect("load should not fail")
            .expect("snapshot should exist");
        assert_eq!(OrderCount { placed: 2 }, state);
        assert_eq!(1, version);
    }
}
