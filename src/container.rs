//! Container values and their logical operations
//!
//! A segment holds exactly one [`ContainerValue`]. The operations here are
//! pure in-memory transformations; [`crate::store::Handle`] wraps each one in
//! the locked read-modify-write cycle.

use crate::error::{RememoryError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;

/// Capacity of text cells created through [`CellValue`] for `String`
pub const DEFAULT_TEXT_CAPACITY: usize = 256;

/// Type of a scalar cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Text { capacity: usize },
    Blob { capacity: usize },
}

impl ScalarKind {
    /// The zero value of this kind
    pub fn zero(&self) -> Scalar {
        match *self {
            ScalarKind::Bool => Scalar::Bool(false),
            ScalarKind::I32 => Scalar::I32(0),
            ScalarKind::I64 => Scalar::I64(0),
            ScalarKind::U32 => Scalar::U32(0),
            ScalarKind::U64 => Scalar::U64(0),
            ScalarKind::F32 => Scalar::F32(0.0),
            ScalarKind::F64 => Scalar::F64(0.0),
            ScalarKind::Text { capacity } => Scalar::Text {
                value: String::new(),
                capacity,
            },
            ScalarKind::Blob { capacity } => Scalar::Blob {
                value: Vec::new(),
                capacity,
            },
        }
    }

    /// Same type, ignoring text and blob capacity
    pub fn same_type(&self, other: &ScalarKind) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKind::Bool => f.write_str("bool"),
            ScalarKind::I32 => f.write_str("i32"),
            ScalarKind::I64 => f.write_str("i64"),
            ScalarKind::U32 => f.write_str("u32"),
            ScalarKind::U64 => f.write_str("u64"),
            ScalarKind::F32 => f.write_str("f32"),
            ScalarKind::F64 => f.write_str("f64"),
            ScalarKind::Text { capacity } => write!(f, "text[{}]", capacity),
            ScalarKind::Blob { capacity } => write!(f, "blob[{}]", capacity),
        }
    }
}

/// Value of a scalar cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Text { value: String, capacity: usize },
    Blob { value: Vec<u8>, capacity: usize },
}

impl Scalar {
    /// Text cell holding `value`, checked against `capacity` bytes
    pub fn text(value: impl Into<String>, capacity: usize) -> Result<Self> {
        let value = value.into();
        check_capacity(value.len(), capacity)?;
        Ok(Scalar::Text { value, capacity })
    }

    /// Blob cell holding `value`, checked against `capacity` bytes
    pub fn blob(value: impl Into<Vec<u8>>, capacity: usize) -> Result<Self> {
        let value = value.into();
        check_capacity(value.len(), capacity)?;
        Ok(Scalar::Blob { value, capacity })
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::I32(_) => ScalarKind::I32,
            Scalar::I64(_) => ScalarKind::I64,
            Scalar::U32(_) => ScalarKind::U32,
            Scalar::U64(_) => ScalarKind::U64,
            Scalar::F32(_) => ScalarKind::F32,
            Scalar::F64(_) => ScalarKind::F64,
            Scalar::Text { capacity, .. } => ScalarKind::Text {
                capacity: *capacity,
            },
            Scalar::Blob { capacity, .. } => ScalarKind::Blob {
                capacity: *capacity,
            },
        }
    }

    /// Replace the value, keeping this cell's kind and capacity
    pub fn assign(&mut self, new: Scalar) -> Result<()> {
        if !self.kind().same_type(&new.kind()) {
            return Err(RememoryError::type_mismatch(
                self.kind().to_string(),
                new.kind().to_string(),
            ));
        }

        match (self, new) {
            (Scalar::Text { value, capacity }, Scalar::Text { value: new, .. }) => {
                check_capacity(new.len(), *capacity)?;
                *value = new;
            }
            (Scalar::Blob { value, capacity }, Scalar::Blob { value: new, .. }) => {
                check_capacity(new.len(), *capacity)?;
                *value = new;
            }
            (slot, new) => *slot = new,
        }
        Ok(())
    }

    /// Add `amount` in place
    ///
    /// Integers wrap at their fixed width; floats follow IEEE-754.
    pub fn increment(&mut self, amount: &Scalar) -> Result<()> {
        match (self, amount) {
            (Scalar::I32(v), Scalar::I32(by)) => *v = v.wrapping_add(*by),
            (Scalar::I64(v), Scalar::I64(by)) => *v = v.wrapping_add(*by),
            (Scalar::U32(v), Scalar::U32(by)) => *v = v.wrapping_add(*by),
            (Scalar::U64(v), Scalar::U64(by)) => *v = v.wrapping_add(*by),
            (Scalar::F32(v), Scalar::F32(by)) => *v += *by,
            (Scalar::F64(v), Scalar::F64(by)) => *v += *by,
            (slot, by) => {
                let kind = slot.kind();
                return Err(match slot {
                    Scalar::Bool(_) | Scalar::Text { .. } | Scalar::Blob { .. } => {
                        RememoryError::UnsupportedOperation {
                            op: "increment",
                            kind: kind.to_string(),
                        }
                    }
                    _ => RememoryError::type_mismatch(kind.to_string(), by.kind().to_string()),
                });
            }
        }
        Ok(())
    }
}

fn check_capacity(len: usize, capacity: usize) -> Result<()> {
    if len > capacity {
        return Err(RememoryError::CapacityExceeded {
            max: capacity,
            got: len,
        });
    }
    Ok(())
}

/// Conversion between Rust types and [`Scalar`] for [`crate::SharedCell`]
pub trait CellValue: Sized {
    fn into_scalar(self) -> Scalar;
    fn from_scalar(scalar: Scalar) -> Result<Self>;
}

macro_rules! cell_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl CellValue for $ty {
                fn into_scalar(self) -> Scalar {
                    Scalar::$variant(self)
                }

                fn from_scalar(scalar: Scalar) -> Result<Self> {
                    match scalar {
                        Scalar::$variant(v) => Ok(v),
                        other => Err(RememoryError::type_mismatch(
                            stringify!($ty),
                            other.kind().to_string(),
                        )),
                    }
                }
            }
        )*
    };
}

cell_value! {
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl CellValue for String {
    fn into_scalar(self) -> Scalar {
        let capacity = self.len().max(DEFAULT_TEXT_CAPACITY);
        Scalar::Text {
            value: self,
            capacity,
        }
    }

    fn from_scalar(scalar: Scalar) -> Result<Self> {
        match scalar {
            Scalar::Text { value, .. } => Ok(value),
            other => Err(RememoryError::type_mismatch("text", other.kind().to_string())),
        }
    }
}

impl CellValue for Vec<u8> {
    fn into_scalar(self) -> Scalar {
        let capacity = self.len().max(DEFAULT_TEXT_CAPACITY);
        Scalar::Blob {
            value: self,
            capacity,
        }
    }

    fn from_scalar(scalar: Scalar) -> Result<Self> {
        match scalar {
            Scalar::Blob { value, .. } => Ok(value),
            other => Err(RememoryError::type_mismatch("blob", other.kind().to_string())),
        }
    }
}

/// Which kind of container a name holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Map,
    Sequence,
    Set,
    Scalar(ScalarKind),
}

impl ContainerKind {
    /// The value a freshly created container of this kind starts with
    pub fn default_value(&self) -> ContainerValue {
        match self {
            ContainerKind::Map => ContainerValue::Map(BTreeMap::new()),
            ContainerKind::Sequence => ContainerValue::Sequence(Vec::new()),
            ContainerKind::Set => ContainerValue::Set(BTreeSet::new()),
            ContainerKind::Scalar(kind) => ContainerValue::Scalar(kind.zero()),
        }
    }

    /// Whether a stored container of kind `other` can serve this kind
    pub fn accepts(&self, other: &ContainerKind) -> bool {
        match (self, other) {
            (ContainerKind::Scalar(a), ContainerKind::Scalar(b)) => a.same_type(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Map => f.write_str("map"),
            ContainerKind::Sequence => f.write_str("sequence"),
            ContainerKind::Set => f.write_str("set"),
            ContainerKind::Scalar(kind) => write!(f, "{} scalar", kind),
        }
    }
}

/// The one logical value stored in a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContainerValue {
    Map(BTreeMap<Value, Value>),
    Sequence(Vec<Value>),
    Set(BTreeSet<Value>),
    Scalar(Scalar),
}

impl ContainerValue {
    pub fn kind(&self) -> ContainerKind {
        match self {
            ContainerValue::Map(_) => ContainerKind::Map,
            ContainerValue::Sequence(_) => ContainerKind::Sequence,
            ContainerValue::Set(_) => ContainerKind::Set,
            ContainerValue::Scalar(s) => ContainerKind::Scalar(s.kind()),
        }
    }

    fn unsupported(&self, op: &'static str) -> RememoryError {
        RememoryError::UnsupportedOperation {
            op,
            kind: self.kind().to_string(),
        }
    }

    /// Map lookup
    pub fn get(&self, key: &Value) -> Result<Value> {
        match self {
            ContainerValue::Map(map) => map
                .get(key)
                .cloned()
                .ok_or_else(|| RememoryError::KeyNotFound(key.to_string())),
            _ => Err(self.unsupported("get")),
        }
    }

    /// Map insert or update; returns the previous value
    pub fn set(&mut self, key: Value, value: Value) -> Result<Option<Value>> {
        match self {
            ContainerValue::Map(map) => Ok(map.insert(key, value)),
            _ => Err(self.unsupported("set")),
        }
    }

    /// Map removal; the key must exist
    pub fn delete(&mut self, key: &Value) -> Result<Value> {
        match self {
            ContainerValue::Map(map) => map
                .remove(key)
                .ok_or_else(|| RememoryError::KeyNotFound(key.to_string())),
            _ => Err(self.unsupported("delete")),
        }
    }

    /// Sequence append
    pub fn append(&mut self, value: Value) -> Result<()> {
        match self {
            ContainerValue::Sequence(seq) => {
                seq.push(value);
                Ok(())
            }
            _ => Err(self.unsupported("append")),
        }
    }

    /// Sequence insert before `index`; `index == len` appends
    pub fn insert(&mut self, index: usize, value: Value) -> Result<()> {
        match self {
            ContainerValue::Sequence(seq) => {
                if index > seq.len() {
                    return Err(RememoryError::IndexOutOfRange {
                        index,
                        len: seq.len(),
                    });
                }
                seq.insert(index, value);
                Ok(())
            }
            _ => Err(self.unsupported("insert")),
        }
    }

    pub fn index_get(&self, index: usize) -> Result<Value> {
        match self {
            ContainerValue::Sequence(seq) => {
                seq.get(index)
                    .cloned()
                    .ok_or(RememoryError::IndexOutOfRange {
                        index,
                        len: seq.len(),
                    })
            }
            _ => Err(self.unsupported("index_get")),
        }
    }

    /// Overwrite an existing element; returns the old one
    pub fn index_set(&mut self, index: usize, value: Value) -> Result<Value> {
        match self {
            ContainerValue::Sequence(seq) => {
                let len = seq.len();
                let slot = seq
                    .get_mut(index)
                    .ok_or(RememoryError::IndexOutOfRange { index, len })?;
                Ok(mem::replace(slot, value))
            }
            _ => Err(self.unsupported("index_set")),
        }
    }

    /// Set insertion; returns whether the element was new
    pub fn add(&mut self, value: Value) -> Result<bool> {
        match self {
            ContainerValue::Set(set) => Ok(set.insert(value)),
            _ => Err(self.unsupported("add")),
        }
    }

    /// Set removal; no-op if absent, returns whether something was removed
    pub fn discard(&mut self, value: &Value) -> Result<bool> {
        match self {
            ContainerValue::Set(set) => Ok(set.remove(value)),
            _ => Err(self.unsupported("discard")),
        }
    }

    /// Removal that requires presence
    ///
    /// On sets this removes the member; on sequences the first equal element.
    pub fn remove(&mut self, value: &Value) -> Result<()> {
        match self {
            ContainerValue::Set(set) => {
                if set.remove(value) {
                    Ok(())
                } else {
                    Err(RememoryError::ElementNotFound(value.to_string()))
                }
            }
            ContainerValue::Sequence(seq) => match seq.iter().position(|v| v == value) {
                Some(pos) => {
                    seq.remove(pos);
                    Ok(())
                }
                None => Err(RememoryError::ElementNotFound(value.to_string())),
            },
            _ => Err(self.unsupported("remove")),
        }
    }

    /// Membership: map key, set member or sequence element
    pub fn contains(&self, value: &Value) -> Result<bool> {
        match self {
            ContainerValue::Map(map) => Ok(map.contains_key(value)),
            ContainerValue::Sequence(seq) => Ok(seq.contains(value)),
            ContainerValue::Set(set) => Ok(set.contains(value)),
            ContainerValue::Scalar(_) => Err(self.unsupported("contains")),
        }
    }

    /// Add to a numeric scalar; returns the new value
    pub fn increment(&mut self, amount: &Scalar) -> Result<Scalar> {
        match self {
            ContainerValue::Scalar(scalar) => {
                scalar.increment(amount)?;
                Ok(scalar.clone())
            }
            _ => Err(self.unsupported("increment")),
        }
    }

    pub fn scalar(&self) -> Result<Scalar> {
        match self {
            ContainerValue::Scalar(scalar) => Ok(scalar.clone()),
            _ => Err(self.unsupported("get_scalar")),
        }
    }

    pub fn set_scalar(&mut self, value: Scalar) -> Result<()> {
        match self {
            ContainerValue::Scalar(scalar) => scalar.assign(value),
            _ => Err(self.unsupported("set_scalar")),
        }
    }

    /// Number of entries, elements or members
    pub fn len(&self) -> Result<usize> {
        match self {
            ContainerValue::Map(map) => Ok(map.len()),
            ContainerValue::Sequence(seq) => Ok(seq.len()),
            ContainerValue::Set(set) => Ok(set.len()),
            ContainerValue::Scalar(_) => Err(self.unsupported("size")),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Remove everything; a scalar goes back to zero
    pub fn clear(&mut self) {
        match self {
            ContainerValue::Map(map) => map.clear(),
            ContainerValue::Sequence(seq) => seq.clear(),
            ContainerValue::Set(set) => set.clear(),
            ContainerValue::Scalar(scalar) => *scalar = scalar.kind().zero(),
        }
    }

    /// Elements in iteration order: map keys, sequence elements, set members
    pub fn into_elements(self) -> Result<Vec<Value>> {
        match self {
            ContainerValue::Map(map) => Ok(map.into_keys().collect()),
            ContainerValue::Sequence(seq) => Ok(seq),
            ContainerValue::Set(set) => Ok(set.into_iter().collect()),
            ContainerValue::Scalar(_) => Err(self.unsupported("iterate")),
        }
    }

    /// Map entries in key order
    pub fn into_items(self) -> Result<Vec<(Value, Value)>> {
        match self {
            ContainerValue::Map(map) => Ok(map.into_iter().collect()),
            _ => Err(self.unsupported("items")),
        }
    }

    pub fn as_map_mut(&mut self) -> Result<&mut BTreeMap<Value, Value>> {
        match self {
            ContainerValue::Map(map) => Ok(map),
            _ => Err(self.unsupported("map access")),
        }
    }

    pub fn as_sequence_mut(&mut self) -> Result<&mut Vec<Value>> {
        match self {
            ContainerValue::Sequence(seq) => Ok(seq),
            _ => Err(self.unsupported("sequence access")),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut BTreeSet<Value>> {
        match self {
            ContainerValue::Set(set) => Ok(set),
            _ => Err(self.unsupported("set access")),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<Value, Value>> {
        match self {
            ContainerValue::Map(map) => Ok(map),
            _ => Err(self.unsupported("map access")),
        }
    }

    pub fn as_sequence(&self) -> Result<&Vec<Value>> {
        match self {
            ContainerValue::Sequence(seq) => Ok(seq),
            _ => Err(self.unsupported("sequence access")),
        }
    }

    pub fn as_set(&self) -> Result<&BTreeSet<Value>> {
        match self {
            ContainerValue::Set(set) => Ok(set),
            _ => Err(self.unsupported("set access")),
        }
    }
}
