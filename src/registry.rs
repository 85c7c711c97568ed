//! Event type registry: maps payload types to their logical event name,
//! schema version and codec.
//!
//! The registry is staged: mutable while the application wires itself up,
//! then [frozen][EventTypeRegistry::freeze] and shared behind an `Arc`.
//! Reads after freezing go through `&self` only, so no locking is involved.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serde::{JsonSerde, PayloadSerde, SerdeError};

/// Errors returned by registry mutation and lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry has been frozen; no further registrations are accepted.
    #[error("registry is frozen, registrations are no longer accepted")]
    Frozen,

    /// A binding for the same key already exists.
    #[error("event type '{name}' schema version {schema_version} is already registered")]
    DuplicateBinding {
        /// Logical event name of the conflicting binding.
        name: String,
        /// Schema version of the conflicting binding.
        schema_version: u32,
    },

    /// No binding was found for the requested payload type.
    #[error("payload type '{type_name}' is not registered")]
    UnknownPayloadType {
        /// Rust type name, for diagnostics only.
        type_name: &'static str,
    },

    /// No binding was found for the requested wire key.
    #[error("event type '{name}' schema version {schema_version} is not registered")]
    UnknownEventType {
        /// Logical event name looked up.
        name: String,
        /// Schema version looked up.
        schema_version: u32,
    },

    /// The bound codec failed to convert a payload.
    #[error(transparent)]
    Codec(#[from] SerdeError),
}

/// A registered binding between a payload type and its wire identity.
#[derive(Clone)]
pub struct EventTypeBinding {
    name: Arc<str>,
    schema_version: u32,
    codec: Arc<dyn PayloadSerde>,
}

impl EventTypeBinding {
    /// Logical event name of the binding.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema version of the binding.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Serializes a payload of the bound type into its wire value.
    pub fn encode(&self, payload: &dyn Any) -> Result<serde_json::Value, SerdeError> {
        self.codec.serialize(payload)
    }

    /// Deserializes a wire value back into the bound payload type.
    pub fn decode(&self, value: serde_json::Value) -> Result<Box<dyn Any + Send>, SerdeError> {
        self.codec.deserialize(value)
    }
}

impl std::fmt::Debug for EventTypeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeBinding")
            .field("name", &self.name)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

/// Maps payload types to `(event name, schema version, codec)` bindings.
///
/// Lookup works both ways: from code (by `TypeId`, on the append path) and
/// from the wire (by `(name, schema_version)`, on the read path).
#[derive(Debug, Default)]
pub struct EventTypeRegistry {
    by_type: HashMap<TypeId, EventTypeBinding>,
    by_name: HashMap<(String, u32), EventTypeBinding>,
    frozen: bool,
}

impl EventTypeRegistry {
    /// Creates an empty, mutable registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type under the given event name at schema
    /// version 1, with the default JSON codec.
    pub fn add<T>(&mut self, name: impl Into<String>) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.add_versioned::<T>(name, 1)
    }

    /// Registers a payload type under the given event name and schema
    /// version, with the default JSON codec.
    pub fn add_versioned<T>(
        &mut self,
        name: impl Into<String>,
        schema_version: u32,
    ) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.add_with_codec::<T>(name, schema_version, Arc::new(JsonSerde::<T>::default()))
    }

    /// Registers a payload type with an explicit codec.
    pub fn add_with_codec<T>(
        &mut self,
        name: impl Into<String>,
        schema_version: u32,
        codec: Arc<dyn PayloadSerde>,
    ) -> Result<(), RegistryError>
    where
        T: Send + Sync + 'static,
    {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }

        let name = name.into();
        let key = (name.clone(), schema_version);
        if self.by_name.contains_key(&key) {
            return Err(RegistryError::DuplicateBinding {
                name,
                schema_version,
            });
        }

        let binding = EventTypeBinding {
            name: Arc::from(name),
            schema_version,
            codec,
        };

        self.by_type.insert(TypeId::of::<T>(), binding.clone());
        self.by_name.insert(key, binding);
        Ok(())
    }

    /// Seals the registry; any further [`add`][EventTypeRegistry::add]
    /// fails with [`RegistryError::Frozen`]. Lookups are unaffected.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns true once the registry has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Looks up the binding for a payload type, on the append path.
    pub fn binding_for<T>(&self) -> Result<&EventTypeBinding, RegistryError>
    where
        T: 'static,
    {
        self.by_type
            .get(&TypeId::of::<T>())
            .ok_or(RegistryError::UnknownPayloadType {
                type_name: std::any::type_name::<T>(),
            })
    }

    /// Looks up the binding for a wire identity, on the read path.
    pub fn binding_for_name(
        &self,
        name: &str,
        schema_version: u32,
    ) -> Result<&EventTypeBinding, RegistryError> {
        self.by_name
            .get(&(name.to_owned(), schema_version))
            .ok_or_else(|| RegistryError::UnknownEventType {
                name: name.to_owned(),
                schema_version,
            })
    }

    /// Returns the highest schema version registered under an event name,
    /// if any.
    pub fn latest_schema_version(&self, name: &str) -> Option<u32> {
        self.by_name
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .max()
    }
}
