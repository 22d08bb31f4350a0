//! Global namespace storage.
//!
//! Locals live directly in value-stack slots; only module-level globals need
//! named storage. Names are interned, so lookup is an integer-keyed map hit.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{intern::StringId, value::Value};

/// The module-level global namespace.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Globals {
    map: AHashMap<StringId, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: StringId) -> Option<Value> {
        self.map.get(&name).copied()
    }

    pub fn set(&mut self, name: StringId, value: Value) {
        self.map.insert(name, value);
    }

    /// Visits every global slot as a GC root.
    pub fn visit_roots(&mut self, visit: &mut dyn FnMut(&mut Value)) {
        for value in self.map.values_mut() {
            visit(value);
        }
    }
}
