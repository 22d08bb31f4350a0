//! The immutable code object the interpreter executes.

use serde::{Deserialize, Serialize};

use crate::{intern::StringId, value::Value};

/// A compiled function or module body.
///
/// The interpreter only reads code objects, never mutates them: the
/// instruction stream, constant pool and name tables are fixed at build
/// time. Frames reference a `Code` for as long as they execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Code {
    /// Name of the function (or `<module>`), for tracebacks.
    pub(crate) name_id: StringId,
    /// The instruction stream: fixed two-byte (opcode, operand) pairs.
    bytecode: Vec<u8>,
    /// Constant pool, indexed by `LoadConst` operands.
    consts: Vec<Value>,
    /// Global names referenced by `LoadGlobal`/`StoreGlobal` operands.
    names: Vec<StringId>,
    /// Local-variable names by slot, for error messages.
    varnames: Vec<StringId>,
    /// Names of cells created by this frame for inner closures.
    cellvars: Vec<StringId>,
    /// Names of cells captured from an enclosing frame.
    freevars: Vec<StringId>,
    /// Number of leading local slots filled from call arguments.
    param_count: u16,
    /// Total local slots (parameters included).
    num_locals: u16,
    /// Worst-case operand-stack depth, used for the pre-call headroom check.
    max_stack: u16,
    /// True when the body contains `yield`: calls construct a generator
    /// instead of pushing a frame.
    is_generator: bool,
}

impl Code {
    #[expect(clippy::too_many_arguments, reason = "assembled only by CodeBuilder")]
    pub(crate) fn new(
        name_id: StringId,
        bytecode: Vec<u8>,
        consts: Vec<Value>,
        names: Vec<StringId>,
        varnames: Vec<StringId>,
        cellvars: Vec<StringId>,
        freevars: Vec<StringId>,
        param_count: u16,
        max_stack: u16,
        is_generator: bool,
    ) -> Self {
        let num_locals = u16::try_from(varnames.len()).expect("more than u16 locals");
        Self {
            name_id,
            bytecode,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            param_count,
            num_locals,
            max_stack,
            is_generator,
        }
    }

    #[inline]
    pub(crate) fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[inline]
    pub(crate) fn get_const(&self, index: usize) -> Option<Value> {
        self.consts.get(index).copied()
    }

    pub(crate) fn const_count(&self) -> usize {
        self.consts.len()
    }

    pub(crate) fn get_name(&self, index: usize) -> Option<StringId> {
        self.names.get(index).copied()
    }

    pub(crate) fn varname(&self, slot: usize) -> Option<StringId> {
        self.varnames.get(slot).copied()
    }

    pub(crate) fn freevar_count(&self) -> usize {
        self.freevars.len()
    }

    pub(crate) fn cellvar_count(&self) -> usize {
        self.cellvars.len()
    }

    /// Name of the cell at combined `LoadDeref` slot `i` (cell variables
    /// first, then free variables).
    pub(crate) fn deref_name(&self, i: usize) -> Option<StringId> {
        if i < self.cellvars.len() {
            self.cellvars.get(i).copied()
        } else {
            self.freevars.get(i - self.cellvars.len()).copied()
        }
    }

    #[inline]
    pub(crate) fn param_count(&self) -> usize {
        usize::from(self.param_count)
    }

    #[inline]
    pub(crate) fn num_locals(&self) -> usize {
        usize::from(self.num_locals)
    }

    #[inline]
    pub(crate) fn max_stack(&self) -> usize {
        usize::from(self.max_stack)
    }

    #[inline]
    pub(crate) fn is_generator(&self) -> bool {
        self.is_generator
    }
}
