//! Builder for emitting bytecode.
//!
//! `CodeBuilder` handles encoding opcodes and operands into the fixed
//! two-byte instruction format, inserting `ExtendedArg` prefixes for wide
//! operands, managing forward jumps that need patching, and tracking the
//! worst-case stack depth recorded into the finished [`Code`] object.
//!
//! # Usage
//!
//! ```ignore
//! let mut b = CodeBuilder::new(name_id);
//! let k = b.const_int(42);
//! b.emit_arg(Opcode::LoadConst, k);
//! b.emit(Opcode::ReturnValue);
//! let code = b.build(0);
//! ```

use super::{
    code::Code,
    op::{CompareKind, Opcode},
};
use crate::{exceptions::ExcType, intern::{FunctionId, StringId}, value::{NativeFn, Value}};

/// A forward-jump reservation returned by [`CodeBuilder::emit_jump`].
#[derive(Debug, Clone, Copy)]
#[must_use = "unpatched jumps target offset zero"]
pub struct JumpLabel(usize);

/// Builder for emitting bytecode.
#[derive(Debug)]
pub struct CodeBuilder {
    name_id: StringId,
    bytecode: Vec<u8>,
    consts: Vec<Value>,
    names: Vec<StringId>,
    varnames: Vec<StringId>,
    cellvars: Vec<StringId>,
    freevars: Vec<StringId>,
    is_generator: bool,
    /// Current stack depth for tracking max stack usage.
    current_depth: i32,
    /// Maximum stack depth seen during emission.
    max_depth: i32,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name_id: StringId) -> Self {
        Self {
            name_id,
            bytecode: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            is_generator: false,
            current_depth: 0,
            max_depth: 0,
        }
    }

    /// Marks the body as a generator: calling it constructs a generator
    /// object instead of executing the bytecode.
    pub fn mark_generator(&mut self) {
        self.is_generator = true;
    }

    /// Byte offset of the next instruction to be emitted.
    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::try_from(self.bytecode.len()).expect("bytecode exceeds u32 offsets")
    }

    // ------------------------------------------------------------------
    // Constant pool and name tables
    // ------------------------------------------------------------------

    fn push_const(&mut self, value: Value) -> u32 {
        self.consts.push(value);
        u32::try_from(self.consts.len() - 1).expect("constant pool exceeds u32")
    }

    pub fn const_none(&mut self) -> u32 {
        self.push_const(Value::None)
    }

    pub fn const_bool(&mut self, b: bool) -> u32 {
        self.push_const(Value::Bool(b))
    }

    pub fn const_int(&mut self, i: i64) -> u32 {
        self.push_const(Value::Int(i))
    }

    pub fn const_str(&mut self, id: StringId) -> u32 {
        self.push_const(Value::InternString(id))
    }

    pub fn const_function(&mut self, id: FunctionId) -> u32 {
        self.push_const(Value::Function(id))
    }

    pub fn const_native(&mut self, native: NativeFn) -> u32 {
        self.push_const(Value::Native(native))
    }

    pub fn const_exc_class(&mut self, exc_type: ExcType) -> u32 {
        self.push_const(Value::ExcClass(exc_type))
    }

    /// Registers a global name, returning its names-table index.
    pub fn add_name(&mut self, id: StringId) -> u32 {
        if let Some(pos) = self.names.iter().position(|&n| n == id) {
            return u32::try_from(pos).expect("names table exceeds u32");
        }
        self.names.push(id);
        u32::try_from(self.names.len() - 1).expect("names table exceeds u32")
    }

    /// Declares a local variable, returning its slot. Parameters must be
    /// declared first, in order.
    pub fn add_local(&mut self, id: StringId) -> u32 {
        if let Some(pos) = self.varnames.iter().position(|&n| n == id) {
            return u32::try_from(pos).expect("locals exceed u32");
        }
        self.varnames.push(id);
        u32::try_from(self.varnames.len() - 1).expect("locals exceed u32")
    }

    /// Declares a cell variable created by this frame for inner closures.
    /// Cell slots precede free-variable slots in `LoadDeref` numbering.
    pub fn add_cellvar(&mut self, id: StringId) -> u32 {
        self.cellvars.push(id);
        u32::try_from(self.cellvars.len() - 1).expect("cellvars exceed u32")
    }

    /// Declares a free variable captured from an enclosing frame, returning
    /// its `LoadDeref` slot (offset past the cell variables).
    pub fn add_freevar(&mut self, id: StringId) -> u32 {
        self.freevars.push(id);
        u32::try_from(self.cellvars.len() + self.freevars.len() - 1).expect("freevars exceed u32")
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn adjust_stack(&mut self, effect: i32) {
        self.current_depth += effect;
        self.max_depth = self.max_depth.max(self.current_depth);
    }

    fn track_effect(&mut self, op: Opcode, arg: u32) {
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        } else {
            let n = i32::try_from(arg).expect("operand exceeds i32");
            match op {
                // Pops callee + n args, pushes the result.
                Opcode::CallFunction => self.adjust_stack(-n),
                Opcode::BuildList | Opcode::BuildTuple => self.adjust_stack(1 - n),
                Opcode::Raise => self.adjust_stack(-n),
                _ => unreachable!("operand-dependent effect not handled for {op:?}"),
            }
        }
        // Entering a handler pushes the (traceback, value, type) triple.
        if matches!(op, Opcode::SetupExcept | Opcode::SetupFinally) {
            self.max_depth = self.max_depth.max(self.current_depth + 3);
        }
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.emit_arg(op, 0);
    }

    /// Emits an instruction, inserting `ExtendedArg` prefixes as needed for
    /// operands wider than one byte.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) {
        // Emit prefixes from the highest nonzero byte down.
        let mut started = false;
        for shift in [24u32, 16, 8] {
            let byte = ((arg >> shift) & 0xff) as u8;
            if started || byte != 0 {
                self.bytecode.push(Opcode::ExtendedArg as u8);
                self.bytecode.push(byte);
                started = true;
            }
        }
        self.bytecode.push(op as u8);
        self.bytecode.push((arg & 0xff) as u8);
        self.track_effect(op, arg);
    }

    /// Emits an instruction with compare-kind operand.
    pub fn emit_compare(&mut self, kind: CompareKind) {
        self.emit_arg(Opcode::CompareOp, kind as u32);
    }

    /// Emits a jump-family instruction with a fixed-width operand slot and
    /// returns a label for later patching. The slot is an `ExtendedArg`
    /// prefix plus the instruction, so patching never shifts offsets.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let at = self.bytecode.len();
        self.bytecode.push(Opcode::ExtendedArg as u8);
        self.bytecode.push(0);
        self.bytecode.push(op as u8);
        self.bytecode.push(0);
        self.track_effect(op, 0);
        JumpLabel(at)
    }

    /// Points a reserved jump at the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.offset();
        self.patch_jump_to(label, target);
    }

    /// Points a reserved jump at an explicit offset.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        assert!(target <= 0xffff, "jump target exceeds 16 bits");
        self.bytecode[label.0 + 1] = (target >> 8) as u8;
        self.bytecode[label.0 + 3] = (target & 0xff) as u8;
    }

    /// Assembles the final code object.
    ///
    /// `param_count` leading locals are filled from call arguments; it must
    /// not exceed the number of declared locals.
    #[must_use]
    pub fn build(self, param_count: u16) -> Code {
        assert!(
            usize::from(param_count) <= self.varnames.len(),
            "param_count exceeds declared locals"
        );
        let max_stack = u16::try_from(self.max_depth.max(0)).expect("stack depth exceeds u16");
        Code::new(
            self.name_id,
            self.bytecode,
            self.consts,
            self.names,
            self.varnames,
            self.cellvars,
            self.freevars,
            param_count,
            max_stack,
            self.is_generator,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    fn name(interns: &mut Interns, s: &str) -> StringId {
        interns.intern(s)
    }

    #[test]
    fn small_operands_are_two_bytes() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(name(&mut interns, "f"));
        let k = b.const_int(7);
        b.emit_arg(Opcode::LoadConst, k);
        b.emit(Opcode::ReturnValue);
        let code = b.build(0);
        assert_eq!(
            code.bytecode(),
            &[Opcode::LoadConst as u8, 0, Opcode::ReturnValue as u8, 0]
        );
    }

    #[test]
    fn wide_operands_get_extended_arg_prefixes() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(name(&mut interns, "f"));
        b.emit_arg(Opcode::LoadConst, 257);
        let code = b.build(0);
        assert_eq!(
            code.bytecode(),
            &[Opcode::ExtendedArg as u8, 1, Opcode::LoadConst as u8, 1]
        );
    }

    #[test]
    fn jump_patching_is_fixed_width() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(name(&mut interns, "f"));
        let jump = b.emit_jump(Opcode::Jump);
        b.emit(Opcode::Nop);
        b.patch_jump(jump);
        let code = b.build(0);
        // ExtendedArg 0, Jump 6 -- the offset after the Nop.
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::ExtendedArg as u8,
                0,
                Opcode::Jump as u8,
                6,
                Opcode::Nop as u8,
                0
            ]
        );
    }

    #[test]
    fn max_stack_tracks_call_shapes() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(name(&mut interns, "f"));
        let f = b.const_int(0);
        b.emit_arg(Opcode::LoadConst, f);
        b.emit_arg(Opcode::LoadConst, f);
        b.emit_arg(Opcode::LoadConst, f);
        b.emit_arg(Opcode::CallFunction, 2);
        b.emit(Opcode::ReturnValue);
        let code = b.build(0);
        assert_eq!(code.max_stack(), 3);
    }
}
