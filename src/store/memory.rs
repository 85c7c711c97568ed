//! In-memory implementations of the storage contracts, backed by
//! thread-safe [`std::collections::HashMap`]s.
//!
//! Besides serving as the reference implementation, the stores support
//! scripted fault injection so commit and migration failure paths can be
//! exercised deterministically in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::document::ObjectDocument;
use crate::event::Event;
use crate::store::{
    DataStore, DocumentStore, RecoverableDataStore, Snapshot, SnapshotStore, StoreError,
};
use crate::version::{ConflictError, Version, NO_STREAM};

/// A scripted failure for the next matching store call.
#[derive(Debug)]
struct ScriptedFailure {
    error: StoreError,
    /// Number of events to write before failing; lets tests model a batch
    /// that was partially persisted when the backend gave up.
    write_first: usize,
}

#[derive(Debug, Default)]
struct DataBackend {
    streams: HashMap<String, Vec<Event>>,
    append_failures: VecDeque<ScriptedFailure>,
    recovery_failures: VecDeque<StoreError>,
    append_calls: u64,
    read_calls: u64,
    recovery_calls: u64,
}

/// In-memory implementation of [`DataStore`], with the optional
/// [recovery][RecoverableDataStore] contract enabled by default.
#[derive(Debug, Clone)]
pub struct InMemoryDataStore {
    backend: Arc<RwLock<DataBackend>>,
    recovery_enabled: bool,
}

impl InMemoryDataStore {
    /// Creates an empty data store supporting recovery removal.
    pub fn new() -> Self {
        Self {
            backend: Arc::default(),
            recovery_enabled: true,
        }
    }

    /// Creates an empty data store that does NOT implement the recovery
    /// contract, to exercise the commit engine's broken-stream path.
    pub fn without_recovery() -> Self {
        Self {
            backend: Arc::default(),
            recovery_enabled: false,
        }
    }

    /// Scripts the next `append` call to fail with `error` without writing
    /// anything.
    pub fn fail_next_append(&self, error: StoreError) {
        self.fail_next_append_after(error, 0);
    }

    /// Scripts the next `append` call to persist the first `write_first`
    /// events of the batch and then fail with `error`.
    pub fn fail_next_append_after(&self, error: StoreError, write_first: usize) {
        self.backend
            .write()
            .expect("acquire write lock on data store backend")
            .append_failures
            .push_back(ScriptedFailure { error, write_first });
    }

    /// Scripts the next recovery removal to fail with `error`.
    pub fn fail_next_recovery(&self, error: StoreError) {
        self.backend
            .write()
            .expect("acquire write lock on data store backend")
            .recovery_failures
            .push_back(error);
    }

    /// Returns all events currently stored for a stream.
    pub fn events(&self, stream_identifier: &str) -> Vec<Event> {
        self.backend
            .read()
            .expect("acquire read lock on data store backend")
            .streams
            .get(stream_identifier)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `append` calls received so far.
    pub fn append_calls(&self) -> u64 {
        self.backend
            .read()
            .expect("acquire read lock on data store backend")
            .append_calls
    }

    /// Number of `read` calls received so far.
    pub fn read_calls(&self) -> u64 {
        self.backend
            .read()
            .expect("acquire read lock on data store backend")
            .read_calls
    }

    /// Number of recovery-removal calls received so far.
    pub fn recovery_calls(&self) -> u64 {
        self.backend
            .read()
            .expect("acquire read lock on data store backend")
            .recovery_calls
    }

    fn write_events(
        backend: &mut DataBackend,
        stream_identifier: &str,
        events: &[Event],
    ) -> Result<(), StoreError> {
        let stream = backend
            .streams
            .entry(stream_identifier.to_owned())
            .or_default();

        let last_version = stream.last().map(|e| e.event_version).unwrap_or(NO_STREAM);

        for (i, event) in events.iter().enumerate() {
            let expected = last_version + 1 + i as Version;
            if event.event_version != expected {
                return Err(StoreError::BadRequest(format!(
                    "event version {} is out of order, expected {}",
                    event.event_version, expected
                )));
            }
        }

        stream.extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn append(&self, document: &ObjectDocument, events: &[Event]) -> Result<(), StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on data store backend");
        backend.append_calls += 1;

        if let Some(failure) = backend.append_failures.pop_front() {
            let partial = &events[..failure.write_first.min(events.len())];
            if !partial.is_empty() {
                Self::write_events(
                    &mut backend,
                    &document.active.stream_identifier,
                    partial,
                )?;
            }
            return Err(failure.error);
        }

        Self::write_events(&mut backend, &document.active.stream_identifier, events)
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on data store backend");
        backend.read_calls += 1;

        let chunk_bounds = chunk.and_then(|id| {
            document
                .active
                .stream_chunks
                .iter()
                .find(|c| c.chunk_identifier == id)
                .map(|c| (c.first_event_version, c.last_event_version))
        });

        let events = backend
            .streams
            .get(&document.active.stream_identifier)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| {
                        let v = event.event_version;
                        v >= start_version
                            && until_version.map_or(true, |until| v <= until)
                            && chunk_bounds.map_or(true, |(first, last)| v >= first && v <= last)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(events)
    }

    fn recovery(&self) -> Option<&dyn RecoverableDataStore> {
        if self.recovery_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl RecoverableDataStore for InMemoryDataStore {
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from_version: Version,
        to_version: Version,
    ) -> Result<u64, StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on data store backend");
        backend.recovery_calls += 1;

        if let Some(error) = backend.recovery_failures.pop_front() {
            return Err(error);
        }

        let Some(stream) = backend.streams.get_mut(&document.active.stream_identifier) else {
            return Ok(0);
        };

        let before = stream.len();
        stream.retain(|event| {
            event.event_version < from_version || event.event_version > to_version
        });

        Ok((before - stream.len()) as u64)
    }
}

#[derive(Debug, Default)]
struct DocumentBackend {
    documents: HashMap<(String, String), ObjectDocument>,
    set_failures: VecDeque<StoreError>,
    get_calls: u64,
    set_calls: u64,
}

/// In-memory implementation of [`DocumentStore`] with etag-based
/// optimistic concurrency.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    backend: Arc<RwLock<DocumentBackend>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next `set` call to fail with `error`.
    pub fn fail_next_set(&self, error: StoreError) {
        self.backend
            .write()
            .expect("acquire write lock on document store backend")
            .set_failures
            .push_back(error);
    }

    /// Number of `set` calls received so far.
    pub fn set_calls(&self) -> u64 {
        self.backend
            .read()
            .expect("acquire read lock on document store backend")
            .set_calls
    }

    /// Returns the stored document without bumping call counters.
    pub fn stored(&self, object_name: &str, object_id: &str) -> Option<ObjectDocument> {
        self.backend
            .read()
            .expect("acquire read lock on document store backend")
            .documents
            .get(&(object_name.to_owned(), object_id.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<ObjectDocument>, StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on document store backend");
        backend.get_calls += 1;

        Ok(backend
            .documents
            .get(&(object_name.to_owned(), object_id.to_owned()))
            .cloned())
    }

    async fn set(&self, document: &ObjectDocument) -> Result<ObjectDocument, StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on document store backend");
        backend.set_calls += 1;

        if let Some(error) = backend.set_failures.pop_front() {
            return Err(error);
        }

        let key = (document.object_name.clone(), document.object_id.clone());

        if let Some(stored) = backend.documents.get(&key) {
            if stored.etag != document.etag {
                return Err(StoreError::Conflict(ConflictError {
                    expected: document.etag.clone().unwrap_or_default(),
                    actual: stored.etag.clone().unwrap_or_default(),
                }));
            }
        }

        let mut updated = document.clone();
        updated.etag = Some(Uuid::new_v4().to_string());
        backend.documents.insert(key, updated.clone());

        Ok(updated)
    }
}

/// In-memory implementation of [`SnapshotStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    backend: Arc<RwLock<HashMap<(String, String, Version, Option<String>), Snapshot>>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty snapshot store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(
        &self,
        document: &ObjectDocument,
        until_version: Version,
        name: Option<&str>,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .backend
            .read()
            .expect("acquire read lock on snapshot store backend")
            .get(&(
                document.object_name.clone(),
                document.object_id.clone(),
                until_version,
                name.map(str::to_owned),
            ))
            .cloned())
    }

    async fn set(&self, snapshot: Snapshot, document: &ObjectDocument) -> Result<(), StoreError> {
        self.backend
            .write()
            .expect("acquire write lock on snapshot store backend")
            .insert(
                (
                    document.object_name.clone(),
                    document.object_id.clone(),
                    snapshot.until_version,
                    snapshot.name.clone(),
                ),
                snapshot,
            );

        Ok(())
    }
}
