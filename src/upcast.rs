//! Upcaster registry: pure payload transforms that lift older-versioned
//! event payloads to newer schema versions, composed into chains.
//!
//! Like the [`EventTypeRegistry`][crate::registry::EventTypeRegistry], the
//! registry is staged: mutable during wiring, then frozen and shared.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::Event;
use crate::registry::RegistryError;

/// A single upcast step. The input payload may be replaced by zero, one or
/// several payloads at the target schema version; returning an empty vector
/// drops the event from the read pipeline.
pub type UpcastFn = Arc<dyn Fn(serde_json::Value) -> Vec<serde_json::Value> + Send + Sync>;

/// Result of walking an upcast chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Upcasted {
    /// The payloads produced by the chain; usually exactly one.
    pub payloads: Vec<serde_json::Value>,

    /// The schema version the chain actually reached. Equals the requested
    /// target unless the chain has a gap, in which case it is the largest
    /// reachable version below the gap.
    pub version: u32,
}

struct Upcaster {
    to_version: u32,
    transform: UpcastFn,
}

impl std::fmt::Debug for Upcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upcaster")
            .field("to_version", &self.to_version)
            .finish_non_exhaustive()
    }
}

/// Maps `(event name, from-version)` to the transform lifting payloads to
/// the next schema version.
#[derive(Debug, Default)]
pub struct UpcasterRegistry {
    upcasters: HashMap<(String, u32), Upcaster>,
    frozen: bool,
}

impl UpcasterRegistry {
    /// Creates an empty, mutable registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an upcaster lifting payloads of the named event from
    /// `from_version` to `to_version`.
    pub fn add<F>(
        &mut self,
        name: impl Into<String>,
        from_version: u32,
        to_version: u32,
        transform: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(serde_json::Value) -> Vec<serde_json::Value> + Send + Sync + 'static,
    {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }

        let name = name.into();
        if self
            .upcasters
            .contains_key(&(name.clone(), from_version))
        {
            return Err(RegistryError::DuplicateBinding {
                name,
                schema_version: from_version,
            });
        }

        self.upcasters.insert(
            (name, from_version),
            Upcaster {
                to_version,
                transform: Arc::new(transform),
            },
        );
        Ok(())
    }

    /// Seals the registry; further registrations fail with
    /// [`RegistryError::Frozen`].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns true once the registry has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns true when an upcaster is registered for the named event at
    /// the given schema version.
    pub fn can_upcast(&self, name: &str, from_version: u32) -> bool {
        self.upcasters
            .contains_key(&(name.to_owned(), from_version))
    }

    /// Highest schema version reachable from `from_version` by following
    /// the registered chain for the named event.
    pub fn latest_version(&self, name: &str, from_version: u32) -> u32 {
        let mut version = from_version;
        while let Some(upcaster) = self.upcasters.get(&(name.to_owned(), version)) {
            version = upcaster.to_version;
        }
        version
    }

    /// Walks the upcast chain greedily from `from_version` towards
    /// `to_version`.
    ///
    /// The walk stops early at a gap: if no upcaster is registered at some
    /// version `k < to_version`, the payloads at `k` are returned together
    /// with `k` as the reached version. `from_version == to_version` returns
    /// the payload untouched.
    pub fn upcast_to_version(
        &self,
        name: &str,
        from_version: u32,
        to_version: u32,
        payload: serde_json::Value,
    ) -> Upcasted {
        let mut payloads = vec![payload];
        let mut version = from_version;

        while version < to_version {
            let Some(upcaster) = self.upcasters.get(&(name.to_owned(), version)) else {
                break;
            };

            payloads = payloads
                .into_iter()
                .flat_map(|payload| (upcaster.transform)(payload))
                .collect();
            version = upcaster.to_version;

            if payloads.is_empty() {
                break;
            }
        }

        Upcasted { payloads, version }
    }

    /// Applies the full chain to a persisted event, fanning it out into
    /// zero or more events at the highest reachable schema version.
    ///
    /// Events without a registered upcaster pass through untouched.
    pub fn apply(&self, event: Event) -> Vec<Event> {
        let target = self.latest_version(&event.event_type, event.schema_version);
        if target == event.schema_version {
            return vec![event];
        }

        let upcasted = self.upcast_to_version(
            &event.event_type,
            event.schema_version,
            target,
            event.payload.clone(),
        );

        upcasted
            .payloads
            .into_iter()
            .map(|payload| {
                let mut out = event.clone();
                out.payload = payload;
                out.schema_version = upcasted.version;
                out
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn registry() -> UpcasterRegistry {
        let mut registry = UpcasterRegistry::new();
        registry
            .add("OrderWasPlaced", 1, 2, |mut payload| {
                payload["currency"] = json!("EUR");
                vec![payload]
            })
            .unwrap();
        registry
            .add("OrderWasPlaced", 2, 3, |mut payload| {
                if let Some(amount) = payload.get("amount").and_then(|v| v.as_i64()) {
                    payload["amountCents"] = json!(amount * 100);
                }
                vec![payload]
            })
            .unwrap();
        registry
    }

    #[test]
    fn same_version_is_identity() {
        let registry = registry();
        let payload = json!({"amount": 5});

        let result = registry.upcast_to_version("OrderWasPlaced", 1, 1, payload.clone());

        assert_eq!(vec![payload], result.payloads);
        assert_eq!(1, result.version);
    }

    #[test]
    fn chain_walks_to_target() {
        let registry = registry();

        let result =
            registry.upcast_to_version("OrderWasPlaced", 1, 3, json!({"amount": 5}));

        assert_eq!(3, result.version);
        assert_eq!(
            vec![json!({"amount": 5, "currency": "EUR", "amountCents": 500})],
            result.payloads
        );
    }

    #[test]
    fn gap_stops_at_largest_reachable_version() {
        let mut registry = registry();
        // Version 4 is only reachable from version 5; versions 3->4 are a gap.
        registry
            .add("OrderWasPlaced", 5, 6, |payload| vec![payload])
            .unwrap();

        let result =
            registry.upcast_to_version("OrderWasPlaced", 1, 6, json!({"amount": 5}));

        assert_eq!(3, result.version);
    }

    #[test]
    fn empty_output_drops_the_event() {
        let mut registry = UpcasterRegistry::new();
        registry
            .add("LegacyNoise", 1, 2, |_| Vec::new())
            .unwrap();

        let event = Event {
            event_type: "LegacyNoise".to_owned(),
            event_version: 7,
            schema_version: 1,
            payload: json!({}),
            external_sequencer: None,
            action_metadata: None,
            metadata: Default::default(),
        };

        assert!(registry.apply(event).is_empty());
    }

    #[test]
    fn fan_out_produces_multiple_events() {
        let mut registry = UpcasterRegistry::new();
        registry
            .add("BatchRecorded", 1, 2, |payload| {
                payload["items"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|item| json!({ "item": item }))
                    .collect()
            })
            .unwrap();

        let event = Event {
            event_type: "BatchRecorded".to_owned(),
            event_version: 0,
            schema_version: 1,
            payload: json!({"items": ["a", "b"]}),
            external_sequencer: None,
            action_metadata: None,
            metadata: Default::default(),
        };

        let events = registry.apply(event);
        assert_eq!(2, events.len());
        assert!(events.iter().all(|e| e.schema_version == 2));
        assert!(events.iter().all(|e| e.event_version == 0));
    }

    #[test]
    fn add_after_freeze_fails() {
        let mut registry = registry();
        registry.freeze();

        let err = registry
            .add("OrderWasPlaced", 3, 4, |payload| vec![payload])
            .expect_err("registration after freeze should fail");
        assert!(matches!(err, RegistryError::Frozen));
    }
}
