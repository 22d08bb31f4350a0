//! Dict type preserving insertion order.
//!
//! Keys are projected into an owned, hashable [`DictKey`] form at insertion
//! time; `1`, `True` and big integers that fit in i64 all normalize to the
//! same key, matching the language's cross-type key equality for integers.

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::{
    exceptions::{ExcType, RunError, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::Value,
};

/// An owned, hashable projection of a value usable as a dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum DictKey {
    None,
    Int(i64),
    BigInt(BigInt),
    Str(String),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    /// Projects a value into key form, or fails with `TypeError` for
    /// unhashable values (lists, dicts, and other mutable heap objects).
    pub fn from_value<T: ResourceTracker>(
        value: Value,
        heap: &Heap<T>,
        interns: &Interns,
    ) -> RunResult<Self> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Int(i64::from(b))),
            Value::Int(i) => Ok(Self::Int(i)),
            Value::InternString(id) => Ok(Self::Str(interns.get_str(id).to_owned())),
            Value::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => Ok(Self::Str(s.as_str().to_owned())),
                HeapData::LongInt(n) => Ok(n
                    .0
                    .to_i64()
                    .map_or_else(|| Self::BigInt(n.0.clone()), Self::Int)),
                HeapData::Tuple(t) => {
                    let keys = t
                        .items()
                        .iter()
                        .map(|&item| Self::from_value(item, heap, interns))
                        .collect::<RunResult<Vec<_>>>()?;
                    Ok(Self::Tuple(keys))
                }
                other => Err(unhashable(other.layout().py_name())),
            },
            other => Err(unhashable_value(other, heap)),
        }
    }
}

fn unhashable(type_name: &str) -> RunError {
    ExcType::type_error(format!("unhashable type: '{type_name}'"))
}

fn unhashable_value<T: ResourceTracker>(value: Value, heap: &Heap<T>) -> RunError {
    unhashable(value.type_name(heap))
}

/// A dict: insertion-ordered mapping from projected keys to values.
///
/// The original key values are stored alongside the projection so iteration
/// and repr can reproduce what the program inserted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Dict {
    entries: IndexMap<DictKey, (Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &DictKey) -> Option<Value> {
        self.entries.get(key).map(|(_, v)| *v)
    }

    pub fn contains(&self, key: &DictKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: DictKey, key_value: Value, value: Value) {
        self.entries.insert(key, (key_value, value));
    }

    /// Iterates `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.values().map(|&(k, v)| (k, v))
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.entries.len() * (std::mem::size_of::<DictKey>() + 2 * std::mem::size_of::<Value>() + 32)
    }
}
