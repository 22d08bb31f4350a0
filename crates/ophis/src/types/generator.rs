//! Generator type: a call frame excised from the shared stack.
//!
//! Calling a generator function does not execute its body; it binds the
//! arguments into a `Generator` heap object and returns it. Each resumption
//! splices the saved frame back onto the VM's stack region and runs until
//! the next `yield` (re-excising the frame) or completion.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{bytecode::vm::TryBlock, heap::HeapId, intern::FunctionId, value::Value};

/// Generator execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum GeneratorState {
    /// Created but never resumed; no bytecode has executed.
    Created,
    /// Currently executing. Resuming again is rejected as an
    /// internal-consistency failure rather than corrupting the shared stack.
    Running,
    /// Suspended at a yield expression; the frame is saved and resumable.
    Suspended,
    /// Returned, raised, or was closed. Further resumption raises
    /// `StopIteration`.
    Completed,
}

/// A generator: owned frame state detached from the shared value stack.
///
/// # Saved frame layout
///
/// While `Created`, `locals` holds the bound parameters padded with unbound
/// slots and `saved_stack` is empty. While `Suspended`, `locals` and
/// `saved_stack` together hold the frame's entire stack region exactly as
/// it was excised, `saved_ip` is the resume point, and `blocks` holds the
/// try-block stack active at the suspension point. The saved instruction
/// pointer addresses the instruction *after* a plain `yield`, but addresses
/// the delegating instruction itself for `yield from`, so resumption
/// re-executes the delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Generator {
    /// The generator function body.
    pub func_id: FunctionId,
    /// Current execution state.
    pub state: GeneratorState,
    /// Local-variable slots (parameters first).
    pub locals: Vec<Value>,
    /// Operand-stack segment above the locals, valid while `Suspended`.
    pub saved_stack: Vec<Value>,
    /// Resume instruction pointer, valid while `Suspended`.
    pub saved_ip: usize,
    /// Try-block stack active at the suspension point.
    pub blocks: SmallVec<[TryBlock; 4]>,
    /// Captured closure cells for the frame.
    pub cells: Vec<HeapId>,
    /// Exceptions claimed by handlers the generator is suspended inside,
    /// restored when the frame is spliced back.
    pub saved_contexts: Vec<Value>,
}

impl Generator {
    /// Creates a generator with bound arguments; the frame stays detached
    /// until the first resumption.
    pub fn new(func_id: FunctionId, locals: Vec<Value>, cells: Vec<HeapId>) -> Self {
        Self {
            func_id,
            state: GeneratorState::Created,
            locals,
            saved_stack: Vec::new(),
            saved_ip: 0,
            blocks: SmallVec::new(),
            cells,
            saved_contexts: Vec::new(),
        }
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + (self.locals.capacity() + self.saved_stack.capacity() + self.saved_contexts.capacity())
                * std::mem::size_of::<Value>()
            + self.cells.capacity() * std::mem::size_of::<HeapId>()
    }
}
