//! Heap-allocated string type.
//!
//! String literals compiled into code objects stay interned
//! (`Value::InternString`); heap strings only arise from runtime
//! construction such as concatenation, `repr()` and character iteration.

use serde::{Deserialize, Serialize};

/// A heap-allocated UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Str(String);

impl Str {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in characters (code points), matching `len()` semantics.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.len()
    }
}

impl From<String> for Str {
    fn from(s: String) -> Self {
        Self(s)
    }
}
