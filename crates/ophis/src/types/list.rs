//! Mutable sequence type.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A mutable, ordered sequence of values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct List(Vec<Value>);

impl List {
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

    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.capacity() * std::mem::size_of::<Value>()
    }
}
