//! The closed field model used by checkpoint records.
//!
//! Every persisted attribute of a schedulable node is a named [`FieldValue`].
//! The set of value kinds is closed: six primitives plus a fixed list of
//! extended kinds. Domain state that does not fit is carried as
//! [`FieldValue::Record`], whose encoding is delegated to a codec registered
//! with the checkpoint store at startup.
//!
//! Types expose their persisted attributes through a static table of
//! [`FieldDescriptor`]s (name + accessor). Reconstruction goes the other way
//! through the typed getters on [`FieldMap`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::step::{IntervalValue, StepValue};

/// Prefix of the type tag used for domain records.
const RECORD_TAG_PREFIX: &str = "record:";

/// Errors raised while reading typed values out of a [`FieldMap`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// A required field is absent.
    #[error("missing field `{name}`")]
    Missing {
        /// Name of the absent field.
        name: String,
    },

    /// A field is present but carries an unexpected kind.
    #[error("field `{name}` has type `{found}`, expected {expected}")]
    Mistyped {
        /// Name of the field.
        name: String,
        /// Human-readable description of the accepted kinds.
        expected: String,
        /// The tag actually found.
        found: TypeTag,
    },

    /// A field has the right kind but an unusable value.
    #[error("field `{name}` is malformed: {reason}")]
    Malformed {
        /// Name of the field.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TypeTag
// ---------------------------------------------------------------------------

/// Type tag written next to every encoded field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TypeTag {
    /// Absent optional value.
    None,
    /// UTF-8 text.
    Str,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// Ordered sequence of untyped values.
    List,
    /// String-keyed mapping of untyped values.
    Dict,
    /// UTC instant, encoded as RFC 3339 text.
    Datetime,
    /// Duration, encoded as total seconds.
    Timedelta,
    /// Filesystem path, encoded as text.
    Path,
    /// Enumerated constant, encoded as its symbolic name.
    Enum,
    /// Ordered collection of pairs, encoded as a nested list.
    Pairs,
    /// Domain record handled by a registered codec.
    Record(String),
}

impl TypeTag {
    /// Text form written to checkpoint files.
    pub fn as_text(&self) -> String {
        match self {
            Self::None => "none".to_owned(),
            Self::Str => "str".to_owned(),
            Self::Int => "int".to_owned(),
            Self::Float => "float".to_owned(),
            Self::Bool => "bool".to_owned(),
            Self::List => "list".to_owned(),
            Self::Dict => "dict".to_owned(),
            Self::Datetime => "datetime".to_owned(),
            Self::Timedelta => "timedelta".to_owned(),
            Self::Path => "path".to_owned(),
            Self::Enum => "enum".to_owned(),
            Self::Pairs => "pairs".to_owned(),
            Self::Record(kind) => format!("{RECORD_TAG_PREFIX}{kind}"),
        }
    }

    /// Parse the text form of a tag.
    pub fn parse(text: &str) -> Option<Self> {
        let tag = match text {
            "none" => Self::None,
            "str" => Self::Str,
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "list" => Self::List,
            "dict" => Self::Dict,
            "datetime" => Self::Datetime,
            "timedelta" => Self::Timedelta,
            "path" => Self::Path,
            "enum" => Self::Enum,
            "pairs" => Self::Pairs,
            other => {
                let kind = other.strip_prefix(RECORD_TAG_PREFIX)?;
                if kind.is_empty() {
                    return None;
                }
                Self::Record(kind.to_owned())
            }
        };
        Some(tag)
    }

    /// Whether the tag belongs to the extended (non-primitive) set.
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::Datetime | Self::Timedelta | Self::Path | Self::Enum | Self::Pairs | Self::Record(_)
        )
    }
}

impl core::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.as_text()
    }
}

impl TryFrom<String> for TypeTag {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text).ok_or_else(|| format!("unknown type tag `{text}`"))
    }
}

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

/// One persisted value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent optional value.
    Null,
    /// UTF-8 text.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Ordered sequence.
    List(Vec<FieldValue>),
    /// String-keyed mapping.
    Dict(BTreeMap<String, FieldValue>),
    /// UTC instant.
    Datetime(DateTime<Utc>),
    /// Signed duration.
    Timedelta(TimeDelta),
    /// Filesystem path.
    Path(PathBuf),
    /// Symbolic name of an enumerated constant.
    Enum(String),
    /// Ordered pairs.
    Pairs(Vec<(FieldValue, FieldValue)>),
    /// Domain record: a codec kind plus its JSON payload.
    Record {
        /// Codec kind name.
        kind: String,
        /// Payload in the codec's normalized JSON form.
        value: serde_json::Value,
    },
}

impl FieldValue {
    /// Type tag for this value.
    pub fn tag(&self) -> TypeTag {
        match self {
            Self::Null => TypeTag::None,
            Self::Str(_) => TypeTag::Str,
            Self::Int(_) => TypeTag::Int,
            Self::Float(_) => TypeTag::Float,
            Self::Bool(_) => TypeTag::Bool,
            Self::List(_) => TypeTag::List,
            Self::Dict(_) => TypeTag::Dict,
            Self::Datetime(_) => TypeTag::Datetime,
            Self::Timedelta(_) => TypeTag::Timedelta,
            Self::Path(_) => TypeTag::Path,
            Self::Enum(_) => TypeTag::Enum,
            Self::Pairs(_) => TypeTag::Pairs,
            Self::Record { kind, .. } => TypeTag::Record(kind.clone()),
        }
    }

    /// Encode a step position using the field kind that matches its step kind.
    pub const fn from_step(step: &StepValue) -> Self {
        match step {
            StepValue::Integer(v) => Self::Int(*v),
            StepValue::Float(v) => Self::Float(*v),
            StepValue::Timestamp(v) => Self::Datetime(*v),
        }
    }

    /// Encode an optional step position (`None` becomes [`FieldValue::Null`]).
    pub fn from_optional_step(step: Option<&StepValue>) -> Self {
        step.map_or(Self::Null, Self::from_step)
    }

    /// Encode an interval using the field kind that matches its kind.
    pub const fn from_interval(interval: &IntervalValue) -> Self {
        match interval {
            IntervalValue::Integer(v) => Self::Int(*v),
            IntervalValue::Float(v) => Self::Float(*v),
            IntervalValue::Duration(v) => Self::Timedelta(*v),
        }
    }

    /// Encode an unsigned counter; values above `i64::MAX` saturate.
    pub fn from_count(count: u64) -> Self {
        Self::Int(i64::try_from(count).unwrap_or(i64::MAX))
    }

    /// Wrap any serializable domain value as a record of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Malformed`] if the value cannot be represented
    /// as JSON.
    pub fn record<T: Serialize>(kind: &str, value: &T) -> Result<Self, FieldError> {
        let value = serde_json::to_value(value).map_err(|err| FieldError::Malformed {
            name: kind.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(Self::Record {
            kind: kind.to_owned(),
            value,
        })
    }
}

/// A named value, as written to a checkpoint record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name, unique within a record.
    pub name: String,
    /// The value.
    pub value: FieldValue,
}

impl Field {
    /// Build a field from a name and value.
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// FieldDescriptor
// ---------------------------------------------------------------------------

/// Static description of one persisted attribute of `T`.
///
/// Types declare a `&'static [FieldDescriptor<Self>]` table at definition
/// time; encoding walks the table instead of inspecting the object.
pub struct FieldDescriptor<T> {
    /// Field name written to the record.
    pub name: &'static str,
    /// Accessor producing the current value.
    pub get: fn(&T) -> FieldValue,
}

impl<T> FieldDescriptor<T> {
    /// Evaluate every descriptor of `table` against `target`, in table order.
    pub fn collect(table: &[Self], target: &T) -> Vec<Field> {
        table
            .iter()
            .map(|descriptor| Field::new(descriptor.name, (descriptor.get)(target)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FieldMap
// ---------------------------------------------------------------------------

/// Decoded fields of a record, keyed by name, with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Whether a field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the map has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Raw access to a required field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Missing`] if the field is absent.
    pub fn get(&self, name: &str) -> Result<&FieldValue, FieldError> {
        self.fields.get(name).ok_or_else(|| FieldError::Missing {
            name: name.to_owned(),
        })
    }

    fn mistyped(name: &str, expected: &str, found: &FieldValue) -> FieldError {
        FieldError::Mistyped {
            name: name.to_owned(),
            expected: expected.to_owned(),
            found: found.tag(),
        }
    }

    /// Required text field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `str`.
    pub fn str(&self, name: &str) -> Result<&str, FieldError> {
        match self.get(name)? {
            FieldValue::Str(v) => Ok(v),
            other => Err(Self::mistyped(name, "str", other)),
        }
    }

    /// Required integer field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `int`.
    pub fn int(&self, name: &str) -> Result<i64, FieldError> {
        match self.get(name)? {
            FieldValue::Int(v) => Ok(*v),
            other => Err(Self::mistyped(name, "int", other)),
        }
    }

    /// Required non-negative integer field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent, not `int`, or negative.
    pub fn count(&self, name: &str) -> Result<u64, FieldError> {
        let value = self.int(name)?;
        u64::try_from(value).map_err(|err| FieldError::Malformed {
            name: name.to_owned(),
            reason: format!("expected a non-negative count, found {value}: {err}"),
        })
    }

    /// Required float field (integers are widened).
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not numeric.
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&self, name: &str) -> Result<f64, FieldError> {
        match self.get(name)? {
            FieldValue::Float(v) => Ok(*v),
            FieldValue::Int(v) => Ok(*v as f64),
            other => Err(Self::mistyped(name, "float", other)),
        }
    }

    /// Required boolean field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `bool`.
    pub fn bool(&self, name: &str) -> Result<bool, FieldError> {
        match self.get(name)? {
            FieldValue::Bool(v) => Ok(*v),
            other => Err(Self::mistyped(name, "bool", other)),
        }
    }

    /// Required list field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `list`.
    pub fn list(&self, name: &str) -> Result<&[FieldValue], FieldError> {
        match self.get(name)? {
            FieldValue::List(v) => Ok(v),
            other => Err(Self::mistyped(name, "list", other)),
        }
    }

    /// Required mapping field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `dict`.
    pub fn dict(&self, name: &str) -> Result<&BTreeMap<String, FieldValue>, FieldError> {
        match self.get(name)? {
            FieldValue::Dict(v) => Ok(v),
            other => Err(Self::mistyped(name, "dict", other)),
        }
    }

    /// Required enumerated constant (symbolic name).
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `enum`.
    pub fn enumerated(&self, name: &str) -> Result<&str, FieldError> {
        match self.get(name)? {
            FieldValue::Enum(v) => Ok(v),
            other => Err(Self::mistyped(name, "enum", other)),
        }
    }

    /// Required path field.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or not `path`.
    pub fn path(&self, name: &str) -> Result<&std::path::Path, FieldError> {
        match self.get(name)? {
            FieldValue::Path(v) => Ok(v),
            other => Err(Self::mistyped(name, "path", other)),
        }
    }

    /// Required step position (`int`, `float`, or `datetime`).
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or of another kind.
    pub fn step(&self, name: &str) -> Result<StepValue, FieldError> {
        match self.get(name)? {
            FieldValue::Int(v) => Ok(StepValue::Integer(*v)),
            FieldValue::Float(v) => Ok(StepValue::Float(*v)),
            FieldValue::Datetime(v) => Ok(StepValue::Timestamp(*v)),
            other => Err(Self::mistyped(name, "int, float or datetime", other)),
        }
    }

    /// Optional step position; `none` decodes to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or of another kind.
    pub fn optional_step(&self, name: &str) -> Result<Option<StepValue>, FieldError> {
        match self.get(name)? {
            FieldValue::Null => Ok(None),
            _ => self.step(name).map(Some),
        }
    }

    /// Required interval (`int`, `float`, or `timedelta`).
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent or of another kind.
    pub fn interval(&self, name: &str) -> Result<IntervalValue, FieldError> {
        match self.get(name)? {
            FieldValue::Int(v) => Ok(IntervalValue::Integer(*v)),
            FieldValue::Float(v) => Ok(IntervalValue::Float(*v)),
            FieldValue::Timedelta(v) => Ok(IntervalValue::Duration(*v)),
            other => Err(Self::mistyped(name, "int, float or timedelta", other)),
        }
    }

    /// Required domain record of `kind`, deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if absent, of another kind, or if the payload
    /// does not deserialize into `T`.
    pub fn record<T: DeserializeOwned>(&self, name: &str, kind: &str) -> Result<T, FieldError> {
        match self.get(name)? {
            FieldValue::Record { kind: found, value } if found == kind => {
                serde_json::from_value(value.clone()).map_err(|err| FieldError::Malformed {
                    name: name.to_owned(),
                    reason: err.to_string(),
                })
            }
            other => Err(Self::mistyped(name, &format!("record:{kind}"), other)),
        }
    }
}

impl FromIterator<Field> for FieldMap {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|field| (field.name, field.value))
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tag_text_roundtrip() {
        let tags = [
            TypeTag::None,
            TypeTag::Str,
            TypeTag::Int,
            TypeTag::Float,
            TypeTag::Bool,
            TypeTag::List,
            TypeTag::Dict,
            TypeTag::Datetime,
            TypeTag::Timedelta,
            TypeTag::Path,
            TypeTag::Enum,
            TypeTag::Pairs,
            TypeTag::Record("Place".to_owned()),
        ];
        for tag in tags {
            assert_eq!(TypeTag::parse(&tag.as_text()), Some(tag));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(TypeTag::parse("complex"), None);
        assert_eq!(TypeTag::parse("record:"), None);
    }

    #[test]
    fn tag_serializes_as_text() {
        let json = serde_json::to_string(&TypeTag::Record("Shift".to_owned())).unwrap();
        assert_eq!(json, "\"record:Shift\"");
    }

    #[test]
    fn step_getters_accept_each_kind() {
        let mut map = FieldMap::new();
        map.insert("a", FieldValue::Int(3));
        map.insert("b", FieldValue::Float(1.5));
        map.insert("c", FieldValue::Null);
        map.insert("d", FieldValue::Str("x".to_owned()));

        assert_eq!(map.step("a").unwrap(), StepValue::Integer(3));
        assert_eq!(map.step("b").unwrap(), StepValue::Float(1.5));
        assert_eq!(map.optional_step("c").unwrap(), None);
        assert!(matches!(map.step("d"), Err(FieldError::Mistyped { .. })));
        assert!(matches!(map.step("zzz"), Err(FieldError::Missing { .. })));
    }

    #[test]
    fn count_rejects_negative_values() {
        let mut map = FieldMap::new();
        map.insert("n", FieldValue::Int(-1));
        assert!(matches!(map.count("n"), Err(FieldError::Malformed { .. })));
    }

    #[test]
    fn descriptor_table_collects_in_order() {
        struct Probe {
            a: i64,
            b: bool,
        }
        const TABLE: &[FieldDescriptor<Probe>] = &[
            FieldDescriptor { name: "a", get: |p| FieldValue::Int(p.a) },
            FieldDescriptor { name: "b", get: |p| FieldValue::Bool(p.b) },
        ];

        let fields = FieldDescriptor::collect(TABLE, &Probe { a: 7, b: true });
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], Field::new("a", FieldValue::Int(7)));
        assert_eq!(fields[1], Field::new("b", FieldValue::Bool(true)));
    }

    #[test]
    fn record_roundtrip_through_map() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Place {
            code: String,
        }
        let value = FieldValue::record("Place", &Place { code: "ID-31".to_owned() }).unwrap();
        let mut map = FieldMap::new();
        map.insert("place", value);
        let place: Place = map.record("place", "Place").unwrap();
        assert_eq!(place.code, "ID-31");
        assert!(map.record::<Place>("place", "Other").is_err());
    }
}
