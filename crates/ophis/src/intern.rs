//! Interned strings and registered functions.
//!
//! Code objects never store strings directly; names, local-variable names and
//! function names are `StringId` indices into the session's [`Interns`] table.
//! Registered functions live here too, so frames and generators can reference
//! bytecode by `FunctionId` instead of holding owned copies.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::Code;

/// Index of an interned string in the [`Interns`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringId(u32);

impl StringId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a registered function in the [`Interns`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId(u32);

impl FunctionId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A registered function: its name plus compiled bytecode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionInfo {
    /// Function name, for tracebacks and repr.
    pub name_id: StringId,
    /// Compiled bytecode body.
    pub code: Code,
}

/// Session-wide table of interned strings and registered functions.
///
/// Strings are deduplicated: interning the same text twice returns the same
/// `StringId`, so name comparisons inside the VM are integer comparisons.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Interns {
    /// Interned string storage, indexed by `StringId`.
    strings: Vec<String>,
    /// Reverse map from text to id, used for deduplication.
    lookup: AHashMap<String, StringId>,
    /// Registered functions, indexed by `FunctionId`.
    functions: Vec<FunctionInfo>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the existing id if already present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("intern table exceeds u32"));
        self.strings.push(s.to_owned());
        self.lookup.insert(s.to_owned(), id);
        id
    }

    /// Returns the text of an interned string.
    pub fn get_str(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Registers a function body, returning its id.
    pub fn add_function(&mut self, name_id: StringId, code: Code) -> FunctionId {
        let id = FunctionId(u32::try_from(self.functions.len()).expect("function table exceeds u32"));
        self.functions.push(FunctionInfo { name_id, code });
        id
    }

    /// Returns a registered function.
    pub fn get_function(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id.index()]
    }

    /// Number of interned strings.
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }
}
