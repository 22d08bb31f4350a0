//! Immutable sequence type.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An immutable, ordered sequence of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Tuple(Vec<Value>);

impl Tuple {
    pub fn new(items: Vec<Value>) -> Self {
        Self(items)
    }

    pub fn items(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.get(index).copied()
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.capacity() * std::mem::size_of::<Value>()
    }
}
