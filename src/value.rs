//! Structured values stored inside containers
//!
//! [`Value`] is the explicit schema every map key, map value, list element
//! and set member is encoded with. Primitive scalars and nested containers
//! have their own tags; anything else goes through [`Value::record`], which
//! stores a `serde`-serialized user type as an opaque, type-tagged byte
//! record.

use crate::envelope;
use crate::error::{RememoryError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// A structured value
///
/// Values are totally ordered so they can key maps and populate sets.
/// Floats compare by IEEE-754 total order, which makes `NaN == NaN` and
/// `-0.0 < 0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<Value, Value>),
    Set(BTreeSet<Value>),
    /// A user type encoded with the payload codec, tagged with its type name
    Record { tag: String, data: Vec<u8> },
}

impl Value {
    /// Encode any serializable type as a record value tagged with its Rust
    /// type name
    ///
    /// `std::any::type_name` is not guaranteed stable across compiler
    /// versions. Processes built by different toolchains should agree on a
    /// tag through [`Value::record_tagged`] instead.
    pub fn record<T: Serialize>(value: &T) -> Result<Self> {
        Self::record_tagged(std::any::type_name::<T>(), value)
    }

    /// Encode a serializable type as a record value under an explicit tag
    pub fn record_tagged<T: Serialize>(tag: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Value::Record {
            tag: tag.into(),
            data: envelope::encode_payload(value)?,
        })
    }

    /// Decode a record value produced by [`Value::record`] for the same type
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T> {
        self.to_record_tagged(std::any::type_name::<T>())
    }

    /// Decode a record value whose tag must equal `expected`
    pub fn to_record_tagged<T: DeserializeOwned>(&self, expected: &str) -> Result<T> {
        match self {
            Value::Record { tag, data } if tag == expected => envelope::decode_payload(data),
            Value::Record { tag, .. } => Err(RememoryError::type_mismatch(expected, tag.as_str())),
            other => Err(RememoryError::type_mismatch(expected, other.type_name())),
        }
    }

    /// Short name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Record { .. } => "record",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
            Value::Set(_) => 8,
            Value::Record { .. } => 9,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (
                Value::Record { tag: ta, data: da },
                Value::Record { tag: tb, data: db },
            ) => ta.cmp(tb).then_with(|| da.cmp(db)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::List(v) => write!(f, "<list of {}>", v.len()),
            Value::Map(v) => write!(f, "<map of {}>", v.len()),
            Value::Set(v) => write!(f, "<set of {}>", v.len()),
            Value::Record { tag, .. } => write!(f, "<record {}>", tag),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    &[u8] => Bytes,
    Vec<Value> => List,
    BTreeMap<Value, Value> => Map,
    BTreeSet<Value> => Set,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

/// Conversion between Rust types and [`Value`] for the typed containers
///
/// Encoding is fallible so that types the codec cannot represent are
/// reported as [`RememoryError::Serialization`] instead of being stored.
pub trait Element: Sized {
    fn into_value(self) -> Result<Value>;
    fn from_value(value: Value) -> Result<Self>;
}

impl Element for Value {
    fn into_value(self) -> Result<Value> {
        Ok(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl Element for bool {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Bool(self))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(RememoryError::type_mismatch("bool", other.type_name())),
        }
    }
}

macro_rules! int_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                fn into_value(self) -> Result<Value> {
                    Ok(Value::Int(self.into()))
                }

                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::Int(v) => <$ty>::try_from(v).map_err(|_| {
                            RememoryError::type_mismatch(stringify!($ty), format!("int {}", v))
                        }),
                        other => Err(RememoryError::type_mismatch(stringify!($ty), other.type_name())),
                    }
                }
            }
        )*
    };
}

int_element!(i8, i16, i32, i64, u8, u16, u32);

impl Element for u64 {
    fn into_value(self) -> Result<Value> {
        i64::try_from(self)
            .map(Value::Int)
            .map_err(|_| RememoryError::type_mismatch("int", format!("u64 {}", self)))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(v) => u64::try_from(v)
                .map_err(|_| RememoryError::type_mismatch("u64", format!("int {}", v))),
            other => Err(RememoryError::type_mismatch("u64", other.type_name())),
        }
    }
}

impl Element for f32 {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Float(self.into()))
    }

    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl Element for f64 {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Float(self))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => Err(RememoryError::type_mismatch("float", other.type_name())),
        }
    }
}

impl Element for String {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Text(self))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(RememoryError::type_mismatch("text", other.type_name())),
        }
    }
}

impl<T: Element> Element for Vec<T> {
    fn into_value(self) -> Result<Value> {
        self.into_iter()
            .map(Element::into_value)
            .collect::<Result<Vec<_>>>()
            .map(Value::List)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(RememoryError::type_mismatch("list", other.type_name())),
        }
    }
}

impl<T: Element> Element for Option<T> {
    fn into_value(self) -> Result<Value> {
        match self {
            Some(v) => v.into_value(),
            None => Ok(Value::Nil),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Raw bytes stored as [`Value::Bytes`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bytes(pub Vec<u8>);

impl Element for Bytes {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Bytes(self.0))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(v) => Ok(Bytes(v)),
            other => Err(RememoryError::type_mismatch("bytes", other.type_name())),
        }
    }
}

/// Any `serde` type stored as [`Value::Record`]
///
/// Tagged with the Rust type name, see [`Value::record`] for the caveat.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Record<T>(pub T);

impl<T: Serialize + DeserializeOwned> Element for Record<T> {
    fn into_value(self) -> Result<Value> {
        Value::record(&self.0)
    }

    fn from_value(value: Value) -> Result<Self> {
        value.to_record().map(Record)
    }
}
