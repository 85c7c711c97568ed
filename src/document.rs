//! The object document: persisted metadata for one aggregate instance.
//!
//! A document points at the currently [active][ObjectDocument::active] event
//! stream and carries the history of [terminated][TerminatedStream] streams
//! that preceded it, e.g. after a stream migration or a size-limit rollover.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{Version, NO_STREAM};

/// Persisted metadata for a single aggregate instance.
///
/// The document is created by the document store on first write, and mutated
/// only through [`DocumentStore::set`][crate::store::DocumentStore::set]
/// under optimistic concurrency keyed by [`etag`][ObjectDocument::etag].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDocument {
    /// Identity of the aggregate instance this document describes.
    pub object_id: String,

    /// Type tag of the aggregate, used to partition documents per kind.
    pub object_name: String,

    /// The stream currently receiving new events.
    pub active: StreamInformation,

    /// Streams this document wrote to in the past, most recent last.
    #[serde(default)]
    pub terminated_streams: Vec<TerminatedStream>,

    /// Opaque optimistic-concurrency token owned by the document store.
    /// `None` until the document has been persisted at least once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ObjectDocument {
    /// Creates a document for a brand new aggregate instance, pointing at a
    /// stream that holds no events yet.
    pub fn new(
        object_name: impl Into<String>,
        object_id: impl Into<String>,
        active: StreamInformation,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            object_name: object_name.into(),
            active,
            terminated_streams: Vec::new(),
            etag: None,
        }
    }

    /// Returns true when the given identifier belongs to one of the
    /// terminated streams of this document.
    pub fn is_terminated(&self, stream_identifier: &str) -> bool {
        self.terminated_streams
            .iter()
            .any(|terminated| terminated.stream_identifier == stream_identifier)
    }

    /// Looks up a terminated stream record by identifier.
    pub fn terminated_stream(&self, stream_identifier: &str) -> Option<&TerminatedStream> {
        self.terminated_streams
            .iter()
            .find(|terminated| terminated.stream_identifier == stream_identifier)
    }

    /// Checks that the active stream identifier does not collide with any
    /// terminated stream identifier.
    pub fn has_unique_stream_identifiers(&self) -> bool {
        !self.is_terminated(&self.active.stream_identifier)
    }
}

/// Descriptor of one append-only event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInformation {
    /// Unique identifier of the stream within its data store.
    pub stream_identifier: String,

    /// Routes the stream to a storage driver kind (e.g. `"blob"`).
    pub stream_type: String,

    /// Logical name of the data store holding the stream's events.
    pub data_store: String,

    /// Logical name of the document store holding the owning document.
    pub document_store: String,

    /// Version of the last committed event; [`NO_STREAM`] when empty.
    pub current_stream_version: Version,

    /// Physical layout settings for this stream.
    #[serde(default)]
    pub chunk_settings: ChunkSettings,

    /// Chunk directory, ordered by [`StreamChunk::chunk_identifier`].
    #[serde(default)]
    pub stream_chunks: Vec<StreamChunk>,

    /// Snapshots taken over this stream, oldest first.
    #[serde(default)]
    pub snapshots: Vec<StreamSnapShot>,

    /// Audit trail of failed commits whose events were removed again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_history: Option<Vec<RollbackRecord>>,

    /// When true the stream refuses new appends until reconciled externally.
    #[serde(default)]
    pub is_broken: bool,

    /// Populated iff [`is_broken`][StreamInformation::is_broken] is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_info: Option<BrokenStreamInfo>,
}

impl StreamInformation {
    /// Creates stream information for an empty, unchunked stream.
    pub fn new(
        stream_identifier: impl Into<String>,
        stream_type: impl Into<String>,
        data_store: impl Into<String>,
        document_store: impl Into<String>,
    ) -> Self {
        Self {
            stream_identifier: stream_identifier.into(),
            stream_type: stream_type.into(),
            data_store: data_store.into(),
            document_store: document_store.into(),
            current_stream_version: NO_STREAM,
            chunk_settings: ChunkSettings::default(),
            stream_chunks: Vec::new(),
            snapshots: Vec::new(),
            rollback_history: None,
            is_broken: false,
            broken_info: None,
        }
    }

    /// Enables chunking with the given chunk size.
    #[must_use]
    pub fn with_chunks(mut self, chunk_size: u64) -> Self {
        self.chunk_settings = ChunkSettings {
            enable_chunks: true,
            chunk_size,
        };
        self
    }

    /// Returns true when at least one event has been committed.
    pub fn exists(&self) -> bool {
        self.current_stream_version > NO_STREAM
    }

    /// Number of committed events on the stream.
    pub fn event_count(&self) -> u64 {
        (self.current_stream_version + 1).max(0) as u64
    }

    /// Appends a rollback record to the stream's audit trail.
    pub fn record_rollback(&mut self, record: RollbackRecord) {
        self.rollback_history
            .get_or_insert_with(Vec::new)
            .push(record);
    }

    /// Verifies the chunk directory invariant: chunks are dense, ordered by
    /// identifier, and together partition `[0, current_stream_version]`.
    pub fn chunks_are_consistent(&self) -> bool {
        if self.stream_chunks.is_empty() {
            return true;
        }

        let mut expected_first = 0;
        let mut previous_id: Option<u64> = None;

        for chunk in &self.stream_chunks {
            if chunk.first_event_version != expected_first {
                return false;
            }
            if let Some(prev) = previous_id {
                if chunk.chunk_identifier <= prev {
                    return false;
                }
            }
            if chunk.last_event_version < chunk.first_event_version {
                return false;
            }
            expected_first = chunk.last_event_version + 1;
            previous_id = Some(chunk.chunk_identifier);
        }

        expected_first == self.current_stream_version + 1
    }
}

/// Physical layout settings of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    /// When true, committed events are partitioned into chunks.
    pub enable_chunks: bool,

    /// Maximum number of events a chunk may hold.
    pub chunk_size: u64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            enable_chunks: false,
            chunk_size: 0,
        }
    }
}

/// One physical partition of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Strictly increasing chunk number within the stream.
    pub chunk_identifier: u64,

    /// Version of the first event stored in this chunk.
    pub first_event_version: Version,

    /// Version of the last event stored in this chunk.
    pub last_event_version: Version,
}

impl StreamChunk {
    /// Number of events currently held by the chunk.
    pub fn len(&self) -> u64 {
        (self.last_event_version - self.first_event_version + 1).max(0) as u64
    }

    /// Returns true when the chunk holds no events.
    pub fn is_empty(&self) -> bool {
        self.last_event_version < self.first_event_version
    }
}

/// Record of a snapshot taken over the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSnapShot {
    /// The snapshot folds all events up to and including this version.
    pub until_version: Version,

    /// Optional snapshot name, for named projections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Why a stream was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamClosureReason {
    /// The stream was migrated to a continuation stream.
    Migration,
    /// The stream hit its configured size limit and rolled over.
    SizeLimit,
    /// The stream was archived.
    Archival,
    /// The stream was closed by an operator.
    Manual,
    /// Free-form reason recorded during book-closing.
    Other(String),
}

/// Closure record of a stream that is no longer active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatedStream {
    /// Identifier of the closed stream.
    pub stream_identifier: String,

    /// Identifier of the stream that continues this one.
    pub continuation_stream_id: String,

    /// Stream type of the continuation stream.
    pub continuation_stream_type: String,

    /// Data store of the continuation stream.
    pub continuation_data_store: String,

    /// Document store of the continuation stream.
    pub continuation_document_store: String,

    /// Why the stream was closed.
    pub reason: StreamClosureReason,

    /// When the stream was closed.
    pub closed_at: DateTime<Utc>,

    /// Migration that closed the stream, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<uuid::Uuid>,

    /// Version of the last business event before the closure marker.
    pub last_business_event_version: Version,

    /// Bookkeeping added during book-closing (e.g. `archiveLocation`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,

    /// Whether the underlying event data has been deleted.
    #[serde(default)]
    pub deleted: bool,
}

/// Audit entry for a failed commit whose orphaned events were removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// When the cleanup completed.
    pub rolled_back_at: DateTime<Utc>,

    /// First event version of the removed range.
    pub from_version: Version,

    /// Last event version of the removed range.
    pub to_version: Version,

    /// How many events the data store actually removed.
    pub events_removed: u64,

    /// Message of the error that failed the commit.
    pub original_error: String,

    /// Kind label of the error that failed the commit.
    pub original_error_kind: String,
}

/// Reconciliation data for a stream whose commit cleanup failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenStreamInfo {
    /// When the stream was marked broken.
    pub broken_at: DateTime<Utc>,

    /// First event version that may be orphaned in the data store.
    pub orphaned_from_version: Version,

    /// Last event version that may be orphaned in the data store.
    pub orphaned_to_version: Version,

    /// Message of the commit error.
    pub error_message: String,

    /// Kind label of the commit error.
    pub original_error_kind: String,

    /// Kind label of the error raised by the cleanup attempt.
    pub cleanup_error_kind: String,
}

#[cfg(test)]
mod test {
    use super::*;

    fn stream() -> StreamInformation {
        StreamInformation::new("stream-1", "memory", "data", "documents")
    }

    #[test]
    fn new_stream_has_no_events() {
        let info = stream();

        assert!(!info.exists());
        assert_eq!(NO_STREAM, info.current_stream_version);
        assert_eq!(0, info.event_count());
    }

    #[test]
    fn chunk_directory_partitions_version_space() {
        let mut info = stream().with_chunks(3);
        info.current_stream_version = 7;
        info.stream_chunks = vec![
            StreamChunk {
                chunk_identifier: 0,
                first_event_version: 0,
                last_event_version: 2,
            },
            StreamChunk {
                chunk_identifier: 1,
                first_event_version: 3,
                last_event_version: 5,
            },
            StreamChunk {
                chunk_identifier: 2,
                first_event_version: 6,
                last_event_version: 7,
            },
        ];

        assert!(info.chunks_are_consistent());

        // Introduce a hole between chunk 0 and chunk 1.
        info.stream_chunks[1].first_event_version = 4;
        assert!(!info.chunks_are_consistent());
    }

    #[test]
    fn terminated_stream_membership() {
        let mut document = ObjectDocument::new("order", "order-42", stream());
        assert!(!document.is_terminated("old-stream"));

        document.terminated_streams.push(TerminatedStream {
            stream_identifier: "old-stream".to_owned(),
            continuation_stream_id: "stream-1".to_owned(),
            continuation_stream_type: "memory".to_owned(),
            continuation_data_store: "data".to_owned(),
            continuation_document_store: "documents".to_owned(),
            reason: StreamClosureReason::Migration,
            closed_at: Utc::now(),
            migration_id: None,
            last_business_event_version: 10,
            metadata: None,
            deleted: false,
        });

        assert!(document.is_terminated("old-stream"));
        assert!(document.has_unique_stream_identifiers());
    }

    #[test]
    fn rollback_history_starts_on_first_record() {
        let mut info = stream();
        assert!(info.rollback_history.is_none());

        info.record_rollback(RollbackRecord {
            rolled_back_at: Utc::now(),
            from_version: 11,
            to_version: 15,
            events_removed: 3,
            original_error: "timed out".to_owned(),
            original_error_kind: "timeout".to_owned(),
        });

        assert_eq!(1, info.rollback_history.as_ref().map(Vec::len).unwrap_or(0));
    }
}
