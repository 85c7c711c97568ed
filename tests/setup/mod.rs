//! Shared fixtures for the integration suites: a registered payload type,
//! seeded in-memory stores and document builders.

// Not every suite uses every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use everstream::document::StreamInformation;
use everstream::store::{DataStore, DocumentStore, InMemoryDataStore, InMemoryDocumentStore};
use everstream::{Event, EventTypeRegistry, ObjectDocument, UpcasterRegistry, Version};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWasPlaced {
    pub order_id: String,
}

impl OrderWasPlaced {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

/// A frozen registry knowing the test payload type.
pub fn registry() -> Arc<EventTypeRegistry> {
    let mut registry = EventTypeRegistry::new();
    registry
        .add::<OrderWasPlaced>("OrderWasPlaced")
        .expect("registration should not fail");
    registry.freeze();
    Arc::new(registry)
}

/// An empty, frozen upcaster registry.
pub fn upcasters() -> Arc<UpcasterRegistry> {
    let mut upcasters = UpcasterRegistry::new();
    upcasters.freeze();
    Arc::new(upcasters)
}

/// A document over an unchunked in-memory stream.
pub fn document(object_id: &str, stream_identifier: &str) -> ObjectDocument {
    ObjectDocument::new(
        "order",
        object_id,
        StreamInformation::new(stream_identifier, "memory", "data", "documents"),
    )
}

/// A bare event at the given position.
pub fn event(event_type: &str, version: Version) -> Event {
    Event {
        event_type: event_type.to_owned(),
        event_version: version,
        schema_version: 1,
        payload: serde_json::json!({ "n": version }),
        external_sequencer: None,
        action_metadata: None,
        metadata: HashMap::new(),
    }
}

/// Seeds `count` committed events onto the document's stream and persists
/// the document, so tests start from a stream at version `count - 1`.
pub async fn seed_stream(
    document: &mut ObjectDocument,
    data_store: &InMemoryDataStore,
    document_store: &InMemoryDocumentStore,
    event_types: &[&str],
) {
    let events: Vec<Event> = event_types
        .iter()
        .enumerate()
        .map(|(i, event_type)| event(event_type, i as Version))
        .collect();

    data_store
        .append(document, &events)
        .await
        .expect("seeding append should not fail");
    document.active.current_stream_version = event_types.len() as Version - 1;
    *document = document_store
        .set(document)
        .await
        .expect("seeding set should not fail");
}
