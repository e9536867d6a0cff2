//! On-disk record format.
//!
//! A record is a JSON array `[kind, [[name, tag, value], ...]]`. The kind
//! names the node type that wrote it; each field carries its [`TypeTag`]
//! so decoding never has to guess. Encodings of the extended kinds:
//!
//! | tag             | JSON value                                   |
//! |-----------------|----------------------------------------------|
//! | `datetime`      | RFC 3339 text, microsecond precision, UTC    |
//! | `timedelta`     | total seconds as a float                     |
//! | `path`          | text                                         |
//! | `enum`          | symbolic name                                |
//! | `pairs`         | `[[[tag, v], [tag, v]], ...]`                |
//! | `record:<kind>` | payload normalized by the kind's codec       |
//!
//! Items of `list`, `dict` and `pairs` are written as `[tag, value]` so
//! nested extended values survive a round trip.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cadence_types::{Field, FieldMap, FieldValue, IntervalValue, TypeTag};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::codec::CodecTable;
use crate::error::CheckpointError;

/// File name of the canonical record inside a checkpoint directory.
pub const RECORD_FILE: &str = "record.json";

/// File name of the in-flight record written before the atomic rename.
pub const TEMP_FILE: &str = "record.json.tmp";

/// One node's persisted state: its kind and its fields, in write order.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// Kind name of the node that wrote the record.
    pub kind: String,
    /// Fields in write order.
    pub fields: Vec<Field>,
}

#[derive(Serialize, Deserialize)]
struct WireRecord(String, Vec<WireField>);

#[derive(Serialize, Deserialize)]
struct WireField(String, TypeTag, Value);

impl CheckpointRecord {
    /// Create a record.
    pub fn new(kind: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            kind: kind.into(),
            fields,
        }
    }

    /// Field named `name`, if present.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    /// Fields keyed by name.
    pub fn to_field_map(&self) -> FieldMap {
        self.fields.iter().cloned().collect()
    }

    /// Encode as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if a field cannot be
    /// encoded, including record kinds missing from `codecs`.
    pub fn encode(&self, codecs: &CodecTable) -> Result<Vec<u8>, CheckpointError> {
        let fields = self
            .fields
            .iter()
            .map(|field| {
                Ok(WireField(
                    field.name.clone(),
                    field.value.tag(),
                    encode_value(&field.name, &field.value, codecs)?,
                ))
            })
            .collect::<Result<Vec<_>, CheckpointError>>()?;

        serde_json::to_vec_pretty(&WireRecord(self.kind.clone(), fields)).map_err(|err| {
            CheckpointError::Serialization {
                field: self.kind.clone(),
                reason: err.to_string(),
            }
        })
    }

    /// Decode bytes read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Deserialization`] if the bytes are not a
    /// well-formed record or a field does not match its tag.
    pub fn decode(bytes: &[u8], codecs: &CodecTable, path: &Path) -> Result<Self, CheckpointError> {
        let WireRecord(kind, wire_fields) = serde_json::from_slice(bytes)
            .map_err(|err| CheckpointError::deserialization(path, err.to_string()))?;

        let fields = wire_fields
            .into_iter()
            .map(|WireField(name, tag, value)| {
                let value = decode_value(&tag, value, codecs)
                    .map_err(|reason| {
                        CheckpointError::deserialization(path, format!("field `{name}`: {reason}"))
                    })?;
                Ok(Field::new(name, value))
            })
            .collect::<Result<Vec<_>, CheckpointError>>()?;

        Ok(Self { kind, fields })
    }
}

fn encode_value(name: &str, value: &FieldValue, codecs: &CodecTable) -> Result<Value, CheckpointError> {
    let failed = |reason: String| CheckpointError::Serialization {
        field: name.to_owned(),
        reason,
    };

    Ok(match value {
        FieldValue::Null => Value::Null,
        FieldValue::Str(s) | FieldValue::Enum(s) => Value::String(s.clone()),
        FieldValue::Int(v) => Value::Number(Number::from(*v)),
        FieldValue::Float(v) => Value::Number(
            Number::from_f64(*v).ok_or_else(|| failed(format!("non-finite float {v}")))?,
        ),
        FieldValue::Bool(v) => Value::Bool(*v),
        FieldValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| encode_tagged(name, item, codecs))
                .collect::<Result<_, _>>()?,
        ),
        FieldValue::Dict(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), encode_tagged(name, item, codecs)?)))
                .collect::<Result<_, CheckpointError>>()?,
        ),
        FieldValue::Datetime(v) => Value::String(v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        FieldValue::Timedelta(v) => {
            let seconds = IntervalValue::Duration(*v).as_seconds();
            Value::Number(
                Number::from_f64(seconds)
                    .ok_or_else(|| failed(format!("duration {seconds} is not finite")))?,
            )
        }
        FieldValue::Path(path) => Value::String(
            path.to_str()
                .ok_or_else(|| failed(format!("path {} is not UTF-8", path.display())))?
                .to_owned(),
        ),
        FieldValue::Pairs(pairs) => Value::Array(
            pairs
                .iter()
                .map(|(k, v)| {
                    Ok(Value::Array(vec![
                        encode_tagged(name, k, codecs)?,
                        encode_tagged(name, v, codecs)?,
                    ]))
                })
                .collect::<Result<_, CheckpointError>>()?,
        ),
        FieldValue::Record { kind, value } => {
            let codec = codecs
                .get(kind)
                .ok_or_else(|| failed(format!("no codec registered for record kind `{kind}`")))?;
            codec.encode(value).map_err(|err| failed(err.to_string()))?
        }
    })
}

fn encode_tagged(name: &str, value: &FieldValue, codecs: &CodecTable) -> Result<Value, CheckpointError> {
    Ok(Value::Array(vec![
        Value::String(value.tag().as_text()),
        encode_value(name, value, codecs)?,
    ]))
}

fn decode_value(tag: &TypeTag, value: Value, codecs: &CodecTable) -> Result<FieldValue, String> {
    let mismatch = |value: &Value| format!("value {value} does not match tag `{tag}`");

    match (tag, value) {
        (TypeTag::None, Value::Null) => Ok(FieldValue::Null),
        (TypeTag::Str, Value::String(s)) => Ok(FieldValue::Str(s)),
        (TypeTag::Enum, Value::String(s)) => Ok(FieldValue::Enum(s)),
        (TypeTag::Int, Value::Number(n)) => n.as_i64().map(FieldValue::Int).ok_or_else(|| {
            format!("{n} is not a 64-bit integer")
        }),
        (TypeTag::Float, Value::Number(n)) => n
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| format!("{n} is not a float")),
        (TypeTag::Bool, Value::Bool(b)) => Ok(FieldValue::Bool(b)),
        (TypeTag::List, Value::Array(items)) => items
            .into_iter()
            .map(|item| decode_tagged(item, codecs))
            .collect::<Result<_, _>>()
            .map(FieldValue::List),
        (TypeTag::Dict, Value::Object(entries)) => entries
            .into_iter()
            .map(|(key, item)| Ok((key, decode_tagged(item, codecs)?)))
            .collect::<Result<BTreeMap<_, _>, String>>()
            .map(FieldValue::Dict),
        (TypeTag::Datetime, Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| FieldValue::Datetime(dt.with_timezone(&Utc)))
            .map_err(|err| format!("`{text}` is not RFC 3339: {err}")),
        (TypeTag::Timedelta, Value::Number(n)) => {
            let seconds = n.as_f64().ok_or_else(|| format!("{n} is not a float"))?;
            IntervalValue::duration_from_seconds(seconds)
                .map(FieldValue::Timedelta)
                .map_err(|err| err.to_string())
        }
        (TypeTag::Path, Value::String(text)) => Ok(FieldValue::Path(PathBuf::from(text))),
        (TypeTag::Pairs, Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    match (pair.next(), pair.next()) {
                        (Some(k), Some(v)) => Ok((decode_tagged(k, codecs)?, decode_tagged(v, codecs)?)),
                        _ => Err("pair must have two elements".to_owned()),
                    }
                }
                other => Err(format!("{other} is not a pair")),
            })
            .collect::<Result<_, _>>()
            .map(FieldValue::Pairs),
        (TypeTag::Record(kind), value) => {
            let codec = codecs
                .get(kind)
                .ok_or_else(|| format!("no codec registered for record kind `{kind}`"))?;
            let value = codec.decode(value).map_err(|err| err.to_string())?;
            Ok(FieldValue::Record {
                kind: kind.clone(),
                value,
            })
        }
        (_, other) => Err(mismatch(&other)),
    }
}

fn decode_tagged(item: Value, codecs: &CodecTable) -> Result<FieldValue, String> {
    match item {
        Value::Array(parts) if parts.len() == 2 => {
            let mut parts = parts.into_iter();
            match (parts.next(), parts.next()) {
                (Some(Value::String(tag)), Some(value)) => {
                    let tag = TypeTag::parse(&tag).ok_or_else(|| format!("unknown tag `{tag}`"))?;
                    decode_value(&tag, value, codecs)
                }
                _ => Err("nested item must be [tag, value]".to_owned()),
            }
        }
        other => Err(format!("nested item {other} must be [tag, value]")),
    }
}

/// Path of the canonical record in `dir`.
pub fn record_path(dir: &Path) -> PathBuf {
    dir.join(RECORD_FILE)
}

/// Path of the temp record in `dir`.
pub fn temp_path(dir: &Path) -> PathBuf {
    dir.join(TEMP_FILE)
}
