//! Public value type for crossing the embedding boundary.
//!
//! [`Object`] is a deep, owned copy of a runtime value: handing one to the
//! embedder never exposes a heap reference, so host code cannot hold a
//! pointer the collector does not know about. Heap-resident values the
//! embedder needs to keep alive (generators) stay inside the VM and are
//! referenced through rooted handles instead.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{
    exceptions::{ExcType, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::{Dict, DictKey, List, LongInt, Str, Tuple},
    value::Value,
};

/// A plain, owned value exchanged with the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    /// The `None` singleton.
    None,
    /// A boolean.
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// An arbitrary-precision integer.
    BigInt(BigInt),
    /// A string.
    Str(String),
    /// A list.
    List(Vec<Object>),
    /// A tuple.
    Tuple(Vec<Object>),
    /// A dict, as insertion-ordered pairs.
    Dict(Vec<(Object, Object)>),
}

impl From<i64> for Object {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Object {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl TryFrom<&Object> for i64 {
    type Error = &'static str;

    fn try_from(obj: &Object) -> Result<Self, Self::Error> {
        match obj {
            Object::Int(i) => Ok(*i),
            Object::Bool(b) => Ok(Self::from(*b)),
            _ => Err("object is not an int"),
        }
    }
}

impl TryFrom<&Object> for String {
    type Error = &'static str;

    fn try_from(obj: &Object) -> Result<Self, Self::Error> {
        match obj {
            Object::Str(s) => Ok(s.clone()),
            _ => Err("object is not a str"),
        }
    }
}

/// Converts a host object into a runtime value, allocating as needed.
pub(crate) fn value_from_object<T: ResourceTracker>(
    obj: &Object,
    heap: &mut Heap<T>,
    interns: &Interns,
) -> RunResult<Value> {
    Ok(match obj {
        Object::None => Value::None,
        Object::Bool(b) => Value::Bool(*b),
        Object::Int(i) => Value::Int(*i),
        Object::BigInt(n) => LongInt::new(n.clone()).into_value(heap)?,
        Object::Str(s) => Value::Ref(heap.allocate(HeapData::Str(Str::new(s.clone())))?),
        Object::List(items) => {
            let values = items
                .iter()
                .map(|item| value_from_object(item, heap, interns))
                .collect::<RunResult<Vec<_>>>()?;
            Value::Ref(heap.allocate(HeapData::List(List::new(values)))?)
        }
        Object::Tuple(items) => {
            let values = items
                .iter()
                .map(|item| value_from_object(item, heap, interns))
                .collect::<RunResult<Vec<_>>>()?;
            Value::Ref(heap.allocate(HeapData::Tuple(Tuple::new(values)))?)
        }
        Object::Dict(pairs) => {
            let mut dict = Dict::new();
            for (key, value) in pairs {
                let key_value = value_from_object(key, heap, interns)?;
                let value_value = value_from_object(value, heap, interns)?;
                let projected = DictKey::from_value(key_value, heap, interns)?;
                dict.insert(projected, key_value, value_value);
            }
            Value::Ref(heap.allocate(HeapData::Dict(dict))?)
        }
    })
}

/// Converts a runtime value into a deep host copy.
///
/// Values with identity or suspended execution state (generators, closures,
/// iterators, cells) cannot cross the boundary as plain data.
pub(crate) fn object_from_value<T: ResourceTracker>(
    value: Value,
    heap: &Heap<T>,
    interns: &Interns,
) -> RunResult<Object> {
    Ok(match value {
        Value::None => Object::None,
        Value::Bool(b) => Object::Bool(b),
        Value::Int(i) => Object::Int(i),
        Value::InternString(id) => Object::Str(interns.get_str(id).to_owned()),
        Value::Ref(id) => match heap.get(id) {
            HeapData::LongInt(n) => Object::BigInt(n.0.clone()),
            HeapData::Str(s) => Object::Str(s.as_str().to_owned()),
            HeapData::List(l) => Object::List(
                l.items()
                    .iter()
                    .map(|&item| object_from_value(item, heap, interns))
                    .collect::<RunResult<Vec<_>>>()?,
            ),
            HeapData::Tuple(t) => Object::Tuple(
                t.items()
                    .iter()
                    .map(|&item| object_from_value(item, heap, interns))
                    .collect::<RunResult<Vec<_>>>()?,
            ),
            HeapData::Dict(d) => {
                let mut pairs = Vec::with_capacity(d.len());
                for (key, val) in d.iter() {
                    pairs.push((
                        object_from_value(key, heap, interns)?,
                        object_from_value(val, heap, interns)?,
                    ));
                }
                Object::Dict(pairs)
            }
            HeapData::Exception(exc) => Object::Str(exc.to_string()),
            _ => {
                return Err(ExcType::type_error(format!(
                    "cannot convert '{}' object to a host value",
                    value.type_name(heap)
                )));
            }
        },
        _ => {
            return Err(ExcType::type_error(format!(
                "cannot convert '{}' object to a host value",
                value.type_name(heap)
            )));
        }
    })
}
