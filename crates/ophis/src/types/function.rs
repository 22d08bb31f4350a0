//! Closure cells and closure objects.
//!
//! Plain functions are the immediate `Value::Function(FunctionId)`; a
//! function only needs a heap object when it captures variables, in which
//! case a [`Closure`] pairs the function id with the captured [`Cell`]s.

use serde::{Deserialize, Serialize};

use crate::{heap::HeapId, intern::FunctionId, value::Value};

/// A mutable box shared between a defining frame and its closures.
///
/// Starts `Unbound` until the owning frame stores into it; loading an
/// unbound cell raises `NameError`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct Cell {
    pub value: Value,
}

impl Cell {
    pub fn empty() -> Self {
        Self { value: Value::Unbound }
    }
}

/// A function with captured variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Closure {
    /// The function body.
    pub func_id: FunctionId,
    /// Captured cells, in the order of the code object's free-variable table.
    pub cells: Vec<HeapId>,
}

impl Closure {
    pub fn new(func_id: FunctionId, cells: Vec<HeapId>) -> Self {
        Self { func_id, cells }
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.cells.capacity() * std::mem::size_of::<HeapId>()
    }
}
