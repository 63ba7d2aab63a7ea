//! External collaborator contracts: serialization and validation.
//!
//! The transport never defines an event schema. It only consumes the two
//! pure operations described here, the way [`crate::ws::connection`] only
//! ever consumes a [`MessageParser`]-shaped abstraction over a concrete
//! message type.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::error::Error;

/// Converts a typed event to wire bytes, and extracts just the `type`
/// discriminant from an inbound frame without fully deserializing it.
pub trait Serializer<E>: Send + Sync + 'static {
    fn serialize(&self, event: &E) -> Result<Vec<u8>>;

    /// Extracts the top-level `type` field from a raw frame. The Transport
    /// uses this on the ingress path to route to handlers without paying
    /// for a full typed deserialization per handler.
    fn extract_type(&self, bytes: &[u8]) -> Result<String>;
}

/// Outcome of an event validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Invoked only when event validation is enabled on the owning `Transport`.
pub trait Validator<E>: Send + Sync + 'static {
    fn validate(&self, event: &E) -> ValidationOutcome;
}

/// A `Serializer` built on `serde_json`, suitable for any event type that
/// round-trips through a JSON object carrying a top-level `type` field.
pub struct JsonSerializer<E> {
    _marker: PhantomData<fn(&E)>,
}

impl<E> Default for JsonSerializer<E> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> JsonSerializer<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: Serialize + DeserializeOwned + Send + Sync + 'static> Serializer<E> for JsonSerializer<E> {
    fn serialize(&self, event: &E) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    fn extract_type(&self, bytes: &[u8]) -> Result<String> {
        let value: Value = serde_json::from_slice(bytes)?;
        value
            .get("type")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| Error::invalid_config("frame missing top-level \"type\" field"))
    }
}
