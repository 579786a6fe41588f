//! The [`Value`] tagged union and its conversion contract.
//!
//!

use crate::error::Error;

/// A single column value as produced or consumed by the engine.
///
/// `Blob` never holds an empty byte sequence: the engine cannot distinguish
/// an empty blob from an absent one, so empty blobs are normalized to `Null`
/// both on write and on read.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Normalizes an empty blob into `Null`, per the engine's historical
    /// inability to represent one.
    pub fn from_blob(bytes: Vec<u8>) -> Value {
        if bytes.is_empty() {
            Value::Null
        } else {
            Value::Blob(bytes)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The Boolean projection of an integer: zero is false, nonzero is true.
    /// Other variants have no Boolean projection.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(r) => Some(*r as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::from_blob(v)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Value::from(v),
            None => Value::Null,
        }
    }
}

/// A capability for producing a [`Value`] from a Rust type.
///
/// Client record layers implement this to plug their own types into the
/// argument-binding path.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// A capability for reconstructing a Rust type from a [`Value`].
///
/// Mirrors the "optional typed"/"required typed" overload distinction from
/// the row access contract: `from_value` returns `None` on a failed
/// conversion (including `Null`) rather than erroring, so callers can choose
/// whether a missing value is fatal.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bytes().map(<[u8]>::to_vec)
    }
}

/// Converts a value into `T`, returning a [`Error::Conversion`] if `value`
/// is `Null` or not representable as `T`. Used by the "required typed"
/// row-access overload.
pub fn require<T: FromValue>(
    value: &Value,
    column: usize,
    row_kind: &'static str,
) -> crate::error::Result<T> {
    T::from_value(value).ok_or(Error::Conversion {
        column,
        expected: std::any::type_name::<T>(),
        row_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_normalizes_to_null() {
        assert_eq!(Value::from_blob(vec![]), Value::Null);
        assert_eq!(Value::from_blob(vec![0x41]), Value::Blob(vec![0x41]));
    }

    #[test]
    fn boolean_projection_of_integer() {
        assert_eq!(Value::Integer(0).as_bool(), Some(false));
        assert_eq!(Value::Integer(7).as_bool(), Some(true));
        assert_eq!(Value::Text("x".into()).as_bool(), None);
    }

    #[test]
    fn numeric_widening() {
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Real(3.9).as_i64(), Some(3));
    }

    #[test]
    fn from_option_none_is_null() {
        let v: Value = Option::<i64>::None.into();
        assert_eq!(v, Value::Null);
        let v: Value = Some(5i64).into();
        assert_eq!(v, Value::Integer(5));
    }
}
