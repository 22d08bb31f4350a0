//! The bytecode virtual machine.
//!
//! Execution state is one contiguous `Vec<Value>` per VM (the shared
//! operand-stack region) plus a stack of [`Frame`] headers indexing into
//! it. A call writes no heap data: the arguments the caller pushed become
//! the callee's local slots 0..N, the remaining locals are initialized to
//! the unbound sentinel by extending the same region, and return truncates
//! back to the saved depth. Each frame owns its instruction pointer and its
//! try-block stack.
//!
//! The dispatch loop runs against a cached copy of the hot frame fields
//! (code pointer, ip, slot bases) and reloads the cache after any operation
//! that can change the frame stack: calls, returns, exception handling and
//! generator splicing.

mod binary;
mod call;
mod compare;
mod exceptions;
mod generator;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    bytecode::{
        code::Code,
        op::{CompareKind, Opcode},
    },
    exceptions::{RunError, RunResult},
    handle::HandleStack,
    heap::{Heap, HeapData, HeapId},
    intern::Interns,
    io::PrintWriter,
    namespace::Globals,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

pub(crate) use generator::Resume;

/// Kind of a pending unwind target on a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum BlockKind {
    /// A loop body; `handler` is the instruction after the loop.
    Loop,
    /// A try body with an except handler at `handler`.
    Except,
    /// A try body with a finally handler at `handler`.
    Finally,
    /// Pseudo-block marking a claimed exception: pushed when a handler is
    /// entered, popped by `PopExcept` or consumed during further unwinding.
    ExceptHandler,
}

/// One entry on a frame's block stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct TryBlock {
    pub kind: BlockKind,
    /// Bytecode offset to jump to when the block is taken during unwinding.
    pub handler: u32,
    /// Operand-stack depth to restore, relative to the frame's operand base
    /// (relative so generator excision keeps it valid across splices).
    pub level: u32,
}

/// Why-token pushed under a finally body when unwinding for `return`.
pub(super) const UNWIND_RETURN: i64 = 1;
/// Why-token pushed under a finally body when unwinding for `break`.
pub(super) const UNWIND_BREAK: i64 = 2;
/// Why-token pushed under a finally body when unwinding for `continue`.
pub(super) const UNWIND_CONTINUE: i64 = 3;

/// A single function activation record.
///
/// The frame's locals are value-stack slots `stack_base..stack_base+num_locals`;
/// its operand region starts at `operand_base()`. `caller_top` is the stack
/// depth to restore when the frame exits (the slot the callee value occupied
/// before the call).
#[derive(Debug)]
pub(crate) struct Frame<'code> {
    /// Bytecode being executed.
    code: &'code Code,
    /// Instruction pointer within this frame's bytecode.
    ip: usize,
    /// First local slot in the shared stack region.
    stack_base: usize,
    /// Stack depth to restore when this frame exits.
    caller_top: usize,
    /// Pending unwind targets, innermost last.
    blocks: SmallVec<[TryBlock; 4]>,
    /// Closure cells: frame-created cell variables first, then captured
    /// free variables.
    cells: Vec<HeapId>,
    /// Set when this frame belongs to a generator; the frame is excised into
    /// that heap object on suspension.
    generator_id: Option<HeapId>,
}

impl<'code> Frame<'code> {
    /// Creates the frame for module-level code. Module locals occupy the
    /// bottom of the stack region.
    pub fn new_module(code: &'code Code) -> Self {
        Self {
            code,
            ip: 0,
            stack_base: 0,
            caller_top: 0,
            blocks: SmallVec::new(),
            cells: Vec::new(),
            generator_id: None,
        }
    }

    /// First operand slot above the locals.
    #[inline]
    fn operand_base(&self) -> usize {
        self.stack_base + self.code.num_locals()
    }
}

/// Cached hot fields of the current frame.
#[derive(Debug, Copy, Clone)]
struct CachedFrame<'code> {
    code: &'code Code,
    ip: usize,
    stack_base: usize,
}

impl<'code> From<&Frame<'code>> for CachedFrame<'code> {
    fn from(frame: &Frame<'code>) -> Self {
        Self {
            code: frame.code,
            ip: frame.ip,
            stack_base: frame.stack_base,
        }
    }
}

/// Result of running a VM to a stopping point.
#[derive(Debug)]
pub(crate) enum FrameExit {
    /// The outermost frame returned with this value.
    Return(Value),
    /// The outermost frame was a generator frame and suspended at a yield,
    /// producing this value.
    Yielded(Value),
}

/// Reloads cached frame state from the current frame.
///
/// Call this after any operation that modifies the frame stack (calls,
/// returns, exception handling, generator splicing).
macro_rules! reload_cache {
    ($self:expr, $cached:ident) => {{
        $cached = CachedFrame::from($self.current_frame());
    }};
}

/// Raises an error through the block-stack machinery, returning the
/// unhandled error if no handler claims it.
macro_rules! catch {
    ($self:expr, $cached:ident, $err:expr) => {{
        if let Some(unhandled) = $self.raise($err) {
            return Err(unhandled);
        }
        // A handler may live in a different frame; reload the cache.
        reload_cache!($self, $cached);
    }};
}

/// Runs a fallible operation, diverting any error into the unwinding path.
macro_rules! try_catch {
    ($self:expr, $cached:ident, $expr:expr) => {
        if let Err(e) = $expr {
            catch!($self, $cached, e);
        }
    };
}

/// Runs an operation that may exit the frame (return/yield) or error.
macro_rules! try_exit {
    ($self:expr, $cached:ident, $expr:expr) => {
        match $expr {
            Ok(Some(exit)) => return Ok(exit),
            Ok(None) => reload_cache!($self, $cached),
            Err(e) => catch!($self, $cached, e),
        }
    };
}

/// The virtual machine: one logical thread of execution.
///
/// Borrows the heap, interns, globals and handle stack from the machine for
/// the duration of one entry (a module run or a generator resumption); the
/// frame and operand stacks live in the VM itself.
pub(crate) struct Vm<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> {
    /// Shared stack region: operand slots and frame locals.
    stack: Vec<Value>,
    /// Frame headers, outermost first.
    frames: Vec<Frame<'a>>,
    heap: &'a mut Heap<T>,
    interns: &'a Interns,
    globals: &'a mut Globals,
    /// Embedder root slots, part of the GC root set during in-run collections.
    handles: &'a HandleStack,
    print: &'a mut P,
    tracer: &'a mut Tr,
    /// Claimed exceptions, innermost last: `(exception value, frame depth at
    /// claim)`. Used by bare `raise` and implicit context chaining. Entries
    /// belonging to a suspending generator frame travel with the generator.
    exception_stack: Vec<(Value, usize)>,
    /// Pending `ForIter` resumptions of generator frames: `(parent frame
    /// depth, exhaust-jump target)`.
    pending_for_iter: Vec<(usize, usize)>,
    /// Bytecode offset of the opcode currently executing.
    instruction_ip: usize,
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    pub fn new(
        heap: &'a mut Heap<T>,
        interns: &'a Interns,
        globals: &'a mut Globals,
        handles: &'a HandleStack,
        print: &'a mut P,
        tracer: &'a mut Tr,
    ) -> Self {
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            heap,
            interns,
            globals,
            handles,
            print,
            tracer,
            exception_stack: Vec::new(),
            pending_for_iter: Vec::new(),
            instruction_ip: 0,
        }
    }

    // ------------------------------------------------------------------
    // Stack and frame helpers
    // ------------------------------------------------------------------

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow: corrupted stack invariant")
    }

    #[inline]
    fn peek(&self) -> Value {
        *self.stack.last().expect("operand stack underflow: corrupted stack invariant")
    }

    #[inline]
    fn current_frame(&self) -> &Frame<'a> {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    fn current_frame_mut(&mut self) -> &mut Frame<'a> {
        self.frames.last_mut().expect("no active frame")
    }

    /// Drops claimed-exception entries at or above `depth`.
    fn drop_claimed_contexts(&mut self, depth: usize) {
        while self.exception_stack.last().is_some_and(|&(_, d)| d >= depth) {
            self.exception_stack.pop();
        }
    }

    /// Drops `ForIter` resumption entries whose parent frame is gone.
    fn prune_pending_for_iter(&mut self) {
        let depth = self.frames.len();
        self.pending_for_iter.retain(|&(d, _)| d <= depth);
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Executes module-level code to completion.
    pub fn run_module(&mut self, code: &'a Code) -> RunResult<FrameExit> {
        self.heap
            .tracker_mut()
            .check_stack_slots(code.num_locals() + code.max_stack())?;
        self.stack.resize(code.num_locals(), Value::Unbound);
        self.frames.push(Frame::new_module(code));
        self.run()
    }

    /// Calls a callable with arguments from machine level.
    ///
    /// Frame-pushing callees run to completion; natives, exception
    /// constructors and generator construction produce their value without
    /// a frame.
    pub fn run_call(&mut self, callee: Value, args: Vec<Value>) -> RunResult<FrameExit> {
        debug_assert!(self.frames.is_empty(), "run_call on a busy VM");
        let argc = args.len();
        self.push(callee);
        for arg in args {
            self.push(arg);
        }
        self.call_function(argc)?;
        if self.frames.is_empty() {
            let value = self.pop();
            return Ok(FrameExit::Return(value));
        }
        self.run()
    }

    /// Resumes a generator at machine level: splices its frame onto this
    /// (empty) VM and runs until it yields, returns, or raises.
    pub fn resume(&mut self, gen_id: HeapId, resume: Resume) -> RunResult<FrameExit> {
        debug_assert!(self.frames.is_empty(), "resume on a busy VM");
        match self.push_generator_frame(gen_id, resume) {
            Ok(()) => self.run(),
            Err(e) => {
                if self.frames.is_empty() {
                    return Err(e);
                }
                // The frame was restored and the error is raised at the
                // suspension point, where the generator's own handlers get
                // first claim.
                match self.raise(e) {
                    None => self.run(),
                    Some(unhandled) => Err(unhandled),
                }
            }
        }
    }

    /// Collects garbage with the full VM root set.
    fn run_gc(&mut self) {
        let heap = &mut *self.heap;
        let stack = &mut self.stack;
        let globals = &mut *self.globals;
        let exception_stack = &mut self.exception_stack;
        let handles = self.handles;
        let frames = &mut self.frames;
        let freed = heap.collect(|visit| {
            for slot in stack.iter_mut() {
                visit(slot);
            }
            globals.visit_roots(visit);
            for (value, _) in exception_stack.iter_mut() {
                visit(value);
            }
            handles.visit_roots(visit);
            for frame in frames.iter_mut() {
                for &cell in &frame.cells {
                    let mut v = Value::Ref(cell);
                    visit(&mut v);
                }
                if let Some(gen_id) = frame.generator_id {
                    let mut v = Value::Ref(gen_id);
                    visit(&mut v);
                }
            }
        });
        self.tracer.on_gc(freed);
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Main execution loop.
    ///
    /// Fetches two-byte instructions from the current frame's bytecode and
    /// executes them. Returns when the outermost frame returns or yields, or
    /// when an error goes unclaimed.
    pub fn run(&mut self) -> RunResult<FrameExit> {
        let mut cached: CachedFrame<'a> = CachedFrame::from(self.current_frame());
        // EXTENDED_ARG accumulator: high-order operand bits for the next
        // instruction, cleared after every non-prefix instruction.
        let mut ext_arg: u32 = 0;

        loop {
            if let Err(e) = self.heap.tracker_mut().check_operation() {
                catch!(self, cached, RunError::from(e));
                continue;
            }

            if self.heap.should_gc() {
                // Sync the ip so frame state is accurate while collecting.
                self.current_frame_mut().ip = cached.ip;
                self.run_gc();
            }

            let op_ip = cached.ip;
            let byte = cached.code.bytecode()[cached.ip];
            let Some(opcode) = Opcode::from_repr(byte) else {
                // A corrupted or incompatible code object: fatal, never a no-op.
                return Err(RunError::internal(format!(
                    "unknown opcode byte 0x{byte:02x} at offset {op_ip}"
                )));
            };
            let arg_byte = cached.code.bytecode()[cached.ip + 1];
            cached.ip += 2;
            let arg = (ext_arg << 8) | u32::from(arg_byte);

            if opcode == Opcode::ExtendedArg {
                ext_arg = arg;
                continue;
            }
            ext_arg = 0;
            self.instruction_ip = op_ip;

            self.tracer.on_instruction(
                op_ip,
                opcode,
                self.stack.len().saturating_sub(self.current_frame().operand_base()),
                self.frames.len(),
            );

            match opcode {
                Opcode::Nop => {}

                // ====================================================
                // Stack manipulation
                // ====================================================
                Opcode::PopTop => {
                    self.pop();
                }
                Opcode::DupTop => {
                    let top = self.peek();
                    self.push(top);
                }
                Opcode::RotTwo => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                Opcode::RotThree => {
                    let len = self.stack.len();
                    self.stack[len - 3..].rotate_right(1);
                }

                // ====================================================
                // Constants and variables
                // ====================================================
                Opcode::LoadConst => {
                    let Some(value) = cached.code.get_const(arg as usize) else {
                        return Err(RunError::internal(format!(
                            "constant index {arg} out of range (pool has {})",
                            cached.code.const_count()
                        )));
                    };
                    self.push(value);
                }
                Opcode::LoadLocal => {
                    try_catch!(self, cached, self.load_local(&cached, arg as usize));
                }
                Opcode::StoreLocal => {
                    if arg as usize >= cached.code.num_locals() {
                        return Err(RunError::internal(format!("local slot {arg} out of range")));
                    }
                    let value = self.pop();
                    self.stack[cached.stack_base + arg as usize] = value;
                }
                Opcode::DeleteLocal => {
                    try_catch!(self, cached, self.delete_local(&cached, arg as usize));
                }
                Opcode::LoadGlobal => {
                    try_catch!(self, cached, self.load_global(&cached, arg as usize));
                }
                Opcode::StoreGlobal => {
                    let value = self.pop();
                    let Some(name) = cached.code.get_name(arg as usize) else {
                        return Err(RunError::internal(format!("name index {arg} out of range")));
                    };
                    self.globals.set(name, value);
                }

                // ====================================================
                // Closure cells
                // ====================================================
                Opcode::LoadDeref => {
                    try_catch!(self, cached, self.load_deref(&cached, arg as usize));
                }
                Opcode::StoreDeref => {
                    try_catch!(self, cached, self.store_deref(arg as usize));
                }
                Opcode::LoadClosure => {
                    let cell = self.current_frame().cells.get(arg as usize).copied();
                    let Some(cell) = cell else {
                        return Err(RunError::internal(format!("cell index {arg} out of range")));
                    };
                    self.push(Value::Ref(cell));
                }
                Opcode::MakeClosure => {
                    try_catch!(self, cached, self.make_closure(&cached, arg as usize));
                }

                // ====================================================
                // Unary and binary operations
                // ====================================================
                Opcode::UnaryNeg => try_catch!(self, cached, self.unary_neg()),
                Opcode::UnaryNot => try_catch!(self, cached, self.unary_not()),
                Opcode::UnaryInvert => try_catch!(self, cached, self.unary_invert()),
                Opcode::BinaryAdd => try_catch!(self, cached, self.binary_add()),
                Opcode::BinarySub => try_catch!(self, cached, self.binary_sub()),
                Opcode::BinaryMul => try_catch!(self, cached, self.binary_mul()),
                Opcode::BinaryFloorDiv => try_catch!(self, cached, self.binary_floordiv()),
                Opcode::BinaryMod => try_catch!(self, cached, self.binary_mod()),

                Opcode::CompareOp => {
                    let Some(kind) = CompareKind::from_repr((arg & 0xff) as u8) else {
                        return Err(RunError::internal(format!("invalid comparison operand {arg}")));
                    };
                    try_catch!(self, cached, self.compare_op(kind));
                }

                // ====================================================
                // Control flow
                // ====================================================
                Opcode::Jump => {
                    cached.ip = arg as usize;
                }
                Opcode::PopJumpIfFalse => {
                    let value = self.pop();
                    if !value.truthy(self.heap, self.interns) {
                        cached.ip = arg as usize;
                    }
                }
                Opcode::PopJumpIfTrue => {
                    let value = self.pop();
                    if value.truthy(self.heap, self.interns) {
                        cached.ip = arg as usize;
                    }
                }

                // ====================================================
                // Iteration
                // ====================================================
                Opcode::GetIter => {
                    try_catch!(self, cached, self.op_get_iter());
                }
                Opcode::ForIter => {
                    self.current_frame_mut().ip = cached.ip;
                    try_catch!(self, cached, self.op_for_iter(arg as usize));
                    reload_cache!(self, cached);
                }

                // ====================================================
                // Containers
                // ====================================================
                Opcode::BuildList => {
                    try_catch!(self, cached, self.build_list(arg as usize));
                }
                Opcode::BuildTuple => {
                    try_catch!(self, cached, self.build_tuple(arg as usize));
                }

                // ====================================================
                // Calls and returns
                // ====================================================
                Opcode::CallFunction => {
                    self.current_frame_mut().ip = cached.ip;
                    try_catch!(self, cached, self.call_function(arg as usize));
                    reload_cache!(self, cached);
                }
                Opcode::ReturnValue => {
                    let value = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    try_exit!(self, cached, self.unwind_return(value));
                }

                // ====================================================
                // Raising and block management
                // ====================================================
                Opcode::Raise => {
                    self.current_frame_mut().ip = cached.ip;
                    match self.op_raise(arg) {
                        Ok(err) => catch!(self, cached, err),
                        Err(e) => catch!(self, cached, e),
                    }
                }
                Opcode::SetupLoop => self.push_block(BlockKind::Loop, arg),
                Opcode::SetupExcept => self.push_block(BlockKind::Except, arg),
                Opcode::SetupFinally => self.push_block(BlockKind::Finally, arg),
                Opcode::PopBlock => {
                    try_catch!(self, cached, self.pop_block());
                }
                Opcode::PopExcept => {
                    try_catch!(self, cached, self.pop_except());
                }
                Opcode::EndFinally => {
                    self.current_frame_mut().ip = cached.ip;
                    try_exit!(self, cached, self.end_finally());
                }
                Opcode::BreakLoop => {
                    self.current_frame_mut().ip = cached.ip;
                    try_catch!(self, cached, self.unwind_break());
                    reload_cache!(self, cached);
                }
                Opcode::ContinueLoop => {
                    self.current_frame_mut().ip = cached.ip;
                    try_catch!(self, cached, self.unwind_continue(arg as usize));
                    reload_cache!(self, cached);
                }

                // ====================================================
                // Generators
                // ====================================================
                Opcode::YieldValue => {
                    let value = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    try_exit!(self, cached, self.yield_value(value));
                }
                Opcode::YieldFrom => {
                    self.current_frame_mut().ip = cached.ip;
                    try_exit!(self, cached, self.op_yield_from(op_ip));
                }

                Opcode::ExtendedArg => unreachable!("handled before dispatch"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Variable access
    // ------------------------------------------------------------------

    fn load_local(&mut self, cached: &CachedFrame<'a>, slot: usize) -> RunResult<()> {
        if slot >= cached.code.num_locals() {
            return Err(RunError::internal(format!("local slot {slot} out of range")));
        }
        let value = self.stack[cached.stack_base + slot];
        if matches!(value, Value::Unbound) {
            let name = cached
                .code
                .varname(slot)
                .map_or("?", |id| self.interns.get_str(id));
            return Err(crate::exceptions::ExcType::unbound_local_error(name));
        }
        self.push(value);
        Ok(())
    }

    fn delete_local(&mut self, cached: &CachedFrame<'a>, slot: usize) -> RunResult<()> {
        let index = cached.stack_base + slot;
        if matches!(self.stack[index], Value::Unbound) {
            let name = cached
                .code
                .varname(slot)
                .map_or("?", |id| self.interns.get_str(id));
            return Err(crate::exceptions::ExcType::unbound_local_error(name));
        }
        self.stack[index] = Value::Unbound;
        Ok(())
    }

    fn load_global(&mut self, cached: &CachedFrame<'a>, index: usize) -> RunResult<()> {
        let Some(name) = cached.code.get_name(index) else {
            return Err(RunError::internal(format!("name index {index} out of range")));
        };
        match self.globals.get(name) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(crate::exceptions::ExcType::name_error(self.interns.get_str(name))),
        }
    }

    fn load_deref(&mut self, cached: &CachedFrame<'a>, slot: usize) -> RunResult<()> {
        let Some(&cell_id) = self.current_frame().cells.get(slot) else {
            return Err(RunError::internal(format!("cell slot {slot} out of range")));
        };
        let value = self.heap.get_cell(cell_id)?.value;
        if matches!(value, Value::Unbound) {
            let name = cached
                .code
                .deref_name(slot)
                .map_or("?", |id| self.interns.get_str(id));
            return Err(crate::exceptions::ExcType::NameError.raise(format!(
                "free variable '{name}' referenced before assignment in enclosing scope"
            )));
        }
        self.push(value);
        Ok(())
    }

    fn store_deref(&mut self, slot: usize) -> RunResult<()> {
        let value = self.pop();
        let Some(&cell_id) = self.current_frame().cells.get(slot) else {
            return Err(RunError::internal(format!("cell slot {slot} out of range")));
        };
        self.heap.get_cell_mut(cell_id)?.value = value;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    fn build_list(&mut self, count: usize) -> RunResult<()> {
        let base = self.stack.len() - count;
        let items: Vec<Value> = self.stack.drain(base..).collect();
        let id = self.heap.allocate(HeapData::List(crate::types::List::new(items)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    fn build_tuple(&mut self, count: usize) -> RunResult<()> {
        let base = self.stack.len() - count;
        let items: Vec<Value> = self.stack.drain(base..).collect();
        let id = self.heap.allocate(HeapData::Tuple(crate::types::Tuple::new(items)))?;
        self.push(Value::Ref(id));
        Ok(())
    }
}
