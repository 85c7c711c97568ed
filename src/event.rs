//! The persisted event record and the well-known wire events built on it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::StreamClosureReason;
use crate::version::Version;

/// Event-type name under which [`StreamClosedEvent`] is persisted.
pub const STREAM_CLOSED_EVENT_TYPE: &str = "EventStream.Closed";

/// Optional causal context attached to an event by the producing action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionMetadata {
    /// Correlates the event with the request or workflow that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event or command that caused this event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

/// A single persisted event.
///
/// Identity is `(stream, event_version)`; the record is immutable once
/// appended. The payload stays opaque to the runtime: codecs bound in the
/// [`EventTypeRegistry`][crate::registry::EventTypeRegistry] translate it
/// to and from domain types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Logical name of the event, resolved through the type registry.
    pub event_type: String,

    /// Position of the event inside its stream.
    pub event_version: Version,

    /// Schema version of the payload, used to select codecs and upcasters.
    pub schema_version: u32,

    /// The serialized payload.
    pub payload: serde_json::Value,

    /// Opaque sorting key for total-order reads across streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_sequencer: Option<String>,

    /// Causal context recorded by the producing action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_metadata: Option<ActionMetadata>,

    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Adds a metadata entry to the event.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true when this event is a stream-closure marker.
    pub fn is_stream_closed(&self) -> bool {
        self.event_type == STREAM_CLOSED_EVENT_TYPE
    }
}

/// Payload of the closure marker appended as the last event of a stream
/// that has been migrated, archived or otherwise terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamClosedEvent {
    /// Identifier of the stream being closed.
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
    pub migration_id: Option<Uuid>,

    /// Version of the last business event preceding this marker.
    pub last_business_event_version: Version,
}

impl StreamClosedEvent {
    /// Wraps the closure payload into a persistable [`Event`] at the given
    /// stream position.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` when the payload cannot be serialized,
    /// which only happens on non-string map keys and similar malformed data.
    pub fn into_event(self, event_version: Version) -> Result<Event, serde_json::Error> {
        Ok(Event {
            event_type: STREAM_CLOSED_EVENT_TYPE.to_owned(),
            event_version,
            schema_version: 1,
            payload: serde_json::to_value(self)?,
            external_sequencer: None,
            action_metadata: None,
            metadata: HashMap::new(),
        })
    }

    /// Parses a closure marker back out of a persisted event.
    pub fn from_event(event: &Event) -> Option<Self> {
        if !event.is_stream_closed() {
            return None;
        }

        serde_json::from_value(event.payload.clone()).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_closed_round_trips_through_event() {
        let closed = StreamClosedEvent {
            stream_identifier: "stream-a".to_owned(),
            continuation_stream_id: "stream-b".to_owned(),
            continuation_stream_type: "memory".to_owned(),
            continuation_data_store: "data".to_owned(),
            continuation_document_store: "documents".to_owned(),
            reason: StreamClosureReason::Migration,
            closed_at: Utc::now(),
            migration_id: Some(Uuid::new_v4()),
            last_business_event_version: 41,
        };

        let event = closed
            .clone()
            .into_event(42)
            .expect("closure marker should serialize");

        assert_eq!(STREAM_CLOSED_EVENT_TYPE, event.event_type);
        assert_eq!(42, event.event_version);
        assert!(event.is_stream_closed());

        let parsed = StreamClosedEvent::from_event(&event).expect("closure marker should parse");
        assert_eq!(closed, parsed);
    }

    #[test]
    fn from_event_ignores_business_events() {
        let event = Event {
            event_type: "OrderWasPlaced".to_owned(),
            event_version: 0,
            schema_version: 1,
            payload: serde_json::json!({"orderId": "order-1"}),
            external_sequencer: None,
            action_metadata: None,
            metadata: HashMap::new(),
        };

        assert!(StreamClosedEvent::from_event(&event).is_none());
    }
}
