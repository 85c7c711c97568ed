//! Storage contracts consumed by the commit engine and the migration
//! orchestrator, plus the in-memory implementations and the resilient
//! retry decorator.

pub mod memory;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::document::{ObjectDocument, StreamInformation};
use crate::event::Event;
use crate::version::{ConflictError, Version};

pub use memory::{InMemoryDataStore, InMemoryDocumentStore, InMemorySnapshotStore};
pub use retry::{Resilient, ResilientDataStoreExt, RetryPolicy};

/// Error code reported when a stream of the requested type cannot be created.
pub const ERROR_CODE_STREAM_TYPE: &str = "ELFAES-CFG-0003";

/// All possible error types returned by the storage contracts.
///
/// The variants mirror the failure classes of real storage backends so the
/// [retry decorator][crate::store::Resilient] can classify them without
/// inspecting driver-specific types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage call did not complete in time. Transient.
    #[error("storage request timed out")]
    Timeout,

    /// The storage backend reported a 5xx-equivalent condition. Transient.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// The storage backend throttled the request (429-equivalent). Transient.
    #[error("storage backend throttled the request")]
    TooManyRequests,

    /// Optimistic-concurrency conflict; the caller must reload and retry
    /// at its own level. Never retried by the decorator.
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// The requested stream or document does not exist.
    #[error("requested item was not found")]
    NotFound,

    /// The request was malformed (4xx-equivalent).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller is not authorized for the storage account.
    #[error("unauthorized")]
    Unauthorized,

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Returns true for failure classes that are worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout | StoreError::Unavailable(_) | StoreError::TooManyRequests
        )
    }

    /// Stable label of the failure class, recorded in rollback and
    /// broken-stream audit data.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Timeout => "timeout",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::TooManyRequests => "too_many_requests",
            StoreError::Conflict(_) => "conflict",
            StoreError::NotFound => "not_found",
            StoreError::BadRequest(_) => "bad_request",
            StoreError::Unauthorized => "unauthorized",
            StoreError::Internal(_) => "internal",
        }
    }
}

/// Appends and reads the events of a stream.
///
/// `append` must reject a batch whose event versions are not the contiguous
/// range directly following the document's current stream version.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Appends the given events to the document's active stream.
    async fn append(&self, document: &ObjectDocument, events: &[Event]) -> Result<(), StoreError>;

    /// Reads events of the document's active stream, inclusive on both
    /// bounds. `chunk` narrows the read to one physical chunk.
    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u64>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Optional recovery contract used by the commit engine to remove
    /// orphaned events after a failed commit. Stores that cannot delete
    /// return `None` and the engine marks the stream broken instead.
    fn recovery(&self) -> Option<&dyn RecoverableDataStore> {
        None
    }
}

/// Optional sibling contract of [`DataStore`]: removal of an event-version
/// range written by a commit that subsequently failed.
#[async_trait]
pub trait RecoverableDataStore: Send + Sync {
    /// Removes events in `[from_version, to_version]` from the document's
    /// active stream, returning how many were actually removed.
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from_version: Version,
        to_version: Version,
    ) -> Result<u64, StoreError>;
}

/// Loads and persists object documents under optimistic concurrency.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches a document by name and id; `None` when it does not exist.
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<ObjectDocument>, StoreError>;

    /// Persists the document. Fails with [`StoreError::Conflict`] when the
    /// document's etag no longer matches the stored one. On success the
    /// returned document carries the fresh etag.
    async fn set(&self, document: &ObjectDocument) -> Result<ObjectDocument, StoreError>;
}

/// A folded aggregate state persisted to accelerate replay.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    /// The snapshot folds all events up to and including this version.
    pub until_version: Version,

    /// Optional snapshot name, for named projections.
    pub name: Option<String>,

    /// Serialized aggregate state.
    pub state: serde_json::Value,
}

/// Stores folded aggregate snapshots per document.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetches the snapshot taken at `until_version`, if one exists.
    async fn get(
        &self,
        document: &ObjectDocument,
        until_version: Version,
        name: Option<&str>,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Persists a snapshot for the document.
    async fn set(
        &self,
        snapshot: Snapshot,
        document: &ObjectDocument,
    ) -> Result<(), StoreError>;
}

/// Raised when stream routing cannot resolve a configured store.
#[derive(Debug, thiserror::Error)]
#[error("[{ERROR_CODE_STREAM_TYPE}] unable to create stream of type '{stream_type}': {reason}")]
pub struct ConfigError {
    /// The stream type that failed to resolve.
    pub stream_type: String,
    /// Human-readable cause.
    pub reason: String,
}

/// Routes the logical store names on [`StreamInformation`] to concrete
/// driver instances.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    data_stores: HashMap<String, Arc<dyn DataStore>>,
    document_stores: HashMap<String, Arc<dyn DocumentStore>>,
    snapshot_stores: HashMap<String, Arc<dyn SnapshotStore>>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a data store under its logical name.
    #[must_use]
    pub fn with_data_store(mut self, name: impl Into<String>, store: Arc<dyn DataStore>) -> Self {
        self.data_stores.insert(name.into(), store);
        self
    }

    /// Registers a document store under its logical name.
    #[must_use]
    pub fn with_document_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        self.document_stores.insert(name.into(), store);
        self
    }

    /// Registers a snapshot store under its logical name.
    #[must_use]
    pub fn with_snapshot_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        self.snapshot_stores.insert(name.into(), store);
        self
    }

    /// Resolves the data store a stream routes to.
    pub fn data_store(&self, stream: &StreamInformation) -> Result<Arc<dyn DataStore>, ConfigError> {
        self.data_stores
            .get(&stream.data_store)
            .cloned()
            .ok_or_else(|| ConfigError {
                stream_type: stream.stream_type.clone(),
                reason: format!("no data store registered under '{}'", stream.data_store),
            })
    }

    /// Resolves the document store a stream routes to.
    pub fn document_store(
        &self,
        stream: &StreamInformation,
    ) -> Result<Arc<dyn DocumentStore>, ConfigError> {
        self.document_stores
            .get(&stream.document_store)
            .cloned()
            .ok_or_else(|| ConfigError {
                stream_type: stream.stream_type.clone(),
                reason: format!(
                    "no document store registered under '{}'",
                    stream.document_store
                ),
            })
    }

    /// Resolves the snapshot store a stream routes to, if one is registered.
    pub fn snapshot_store(&self, stream: &StreamInformation) -> Option<Arc<dyn SnapshotStore>> {
        self.snapshot_stores.get(&stream.data_store).cloned()
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("data_stores", &self.data_stores.keys())
            .field("document_stores", &self.document_stores.keys())
            .field("snapshot_stores", &self.snapshot_stores.keys())
            .finish()
    }
}
