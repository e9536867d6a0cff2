//! Codecs for domain records stored inline as `record:<kind>` fields.
//!
//! The field model is closed, so any domain state that is not a primitive
//! or one of the extended kinds travels as a [`FieldValue::Record`]
//! carrying JSON. A [`CodecTable`] maps each record kind to a
//! [`RecordCodec`] that validates and normalizes that JSON on the way in
//! and out. The table is built once at startup and never changes.
//!
//! [`FieldValue::Record`]: cadence_types::FieldValue::Record

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Encoder/decoder for one domain record kind.
pub trait RecordCodec: Send + Sync {
    /// Normalize an in-memory record payload for writing.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error if the payload does not have the
    /// shape of this kind.
    fn encode(&self, value: &Value) -> Result<Value, serde_json::Error>;

    /// Validate a stored payload and return its in-memory form.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error if the payload does not have the
    /// shape of this kind.
    fn decode(&self, value: Value) -> Result<Value, serde_json::Error>;
}

/// Codec that validates payloads by round-tripping them through `T`.
pub struct TypedCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedCodec<T> {
    /// Create the codec.
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec for TypedCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &Value) -> Result<Value, serde_json::Error> {
        let typed: T = serde_json::from_value(value.clone())?;
        serde_json::to_value(typed)
    }

    fn decode(&self, value: Value) -> Result<Value, serde_json::Error> {
        let typed: T = serde_json::from_value(value)?;
        serde_json::to_value(typed)
    }
}

/// Immutable table of record codecs keyed by kind name.
#[derive(Default)]
pub struct CodecTable {
    codecs: BTreeMap<String, Box<dyn RecordCodec>>,
}

impl CodecTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a codec for `kind`, replacing any previous one.
    #[must_use]
    pub fn with_codec(mut self, kind: impl Into<String>, codec: Box<dyn RecordCodec>) -> Self {
        self.codecs.insert(kind.into(), codec);
        self
    }

    /// Add a [`TypedCodec`] for `kind`.
    #[must_use]
    pub fn with_type<T>(self, kind: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.with_codec(kind, Box::new(TypedCodec::<T>::new()))
    }

    /// Codec registered for `kind`.
    pub fn get(&self, kind: &str) -> Option<&dyn RecordCodec> {
        self.codecs.get(kind).map(|codec| &**codec)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }
}

impl fmt::Debug for CodecTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecTable")
            .field("kinds", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}
