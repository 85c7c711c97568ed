//! Payload codecs: translate domain payload types to and from the opaque
//! JSON representation persisted on [`Event`][crate::event::Event] records.

use std::any::Any;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors returned by [`PayloadSerde`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum SerdeError {
    /// The value handed to [`PayloadSerde::serialize`] was not of the type
    /// the codec was registered for.
    #[error("payload value is not of the registered type")]
    TypeMismatch,

    /// The payload could not be converted to or from its wire form.
    #[error("failed to convert payload: {0}")]
    Conversion(#[from] serde_json::Error),
}

/// A [`PayloadSerde`] can be used to serialize a domain payload into the
/// wire representation stored on events, and deserialize it back.
///
/// Implementations are type-erased behind `dyn Any` so the
/// [`EventTypeRegistry`][crate::registry::EventTypeRegistry] can hold codecs
/// for arbitrary payload types in one table.
pub trait PayloadSerde: Send + Sync {
    /// Serializes the given value into the wire format supported by this codec.
    fn serialize(&self, value: &dyn Any) -> Result<serde_json::Value, SerdeError>;

    /// Deserializes the given wire value back into the registered payload type.
    fn deserialize(&self, value: serde_json::Value) -> Result<Box<dyn Any + Send>, SerdeError>;
}

/// Implements [`PayloadSerde`] using the `serde_json` crate for any payload
/// type that supports serde both ways.
#[derive(Debug, Clone, Copy)]
pub struct JsonSerde<T>(PhantomData<T>)
where
    T: Serialize + DeserializeOwned + Send + Sync;

impl<T> Default for JsonSerde<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> PayloadSerde for JsonSerde<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &dyn Any) -> Result<serde_json::Value, SerdeError> {
        let typed = value.downcast_ref::<T>().ok_or(SerdeError::TypeMismatch)?;
        Ok(serde_json::to_value(typed)?)
    }

    fn deserialize(&self, value: serde_json::Value) -> Result<Box<dyn Any + Send>, SerdeError> {
        let typed: T = serde_json::from_value(value)?;
        Ok(Box::new(typed))
    }
}
