//! Call dispatch: frame pushes, natives, closures and iteration.
//!
//! A call never allocates frame storage: the arguments the caller pushed
//! become the callee's leading local slots, the callee slot itself is
//! removed, and the stack is extended with unbound sentinels for the
//! remaining locals. The recursion-depth and stack-headroom checks run
//! before any of that mutation, so a rejected call leaves the caller
//! intact and surfaces as a catchable exception.

use smallvec::SmallVec;

use super::{Frame, Resume, Vm};
use crate::{
    bytecode::code::Code,
    exceptions::{ExcType, RunError, RunResult, SimpleException},
    heap::{HeapData, HeapId, LayoutId},
    intern::FunctionId,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Cell, Closure, GeneratorState, SeqIter, Str, Tuple},
    value::{NativeFn, Value},
};

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    /// Executes `CallFunction` with `argc` positional arguments.
    pub(super) fn call_function(&mut self, argc: usize) -> RunResult<()> {
        let callee = self.stack[self.stack.len() - 1 - argc];
        match callee {
            Value::Function(func_id) => self.call_registered(func_id, None, argc),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(closure) => {
                    let func_id = closure.func_id;
                    let cells = closure.cells.clone();
                    self.call_registered(func_id, Some(cells), argc)
                }
                _ => Err(ExcType::type_error(format!(
                    "'{}' object is not callable",
                    callee.type_name(self.heap)
                ))),
            },
            Value::Native(native) => self.call_native(native, argc),
            Value::ExcClass(exc_type) => self.construct_exception(exc_type, argc),
            _ => Err(ExcType::type_error(format!(
                "'{}' object is not callable",
                callee.type_name(self.heap)
            ))),
        }
    }

    /// Calls a registered function: pushes a frame, or constructs a
    /// generator when the body is a generator.
    fn call_registered(&mut self, func_id: FunctionId, captured: Option<Vec<HeapId>>, argc: usize) -> RunResult<()> {
        let interns: &'a crate::intern::Interns = self.interns;
        let code = &interns.get_function(func_id).code;
        if argc != code.param_count() {
            let name = interns.get_str(interns.get_function(func_id).name_id);
            return Err(ExcType::type_error(format!(
                "{name}() takes {} positional argument(s) but {argc} were given",
                code.param_count()
            )));
        }

        if code.is_generator() {
            // Bind the arguments and detach: no bytecode runs until the
            // first resumption.
            let base = self.stack.len() - argc;
            let mut locals: Vec<Value> = self.stack.drain(base..).collect();
            locals.resize(code.num_locals(), Value::Unbound);
            let cells = self.make_frame_cells(code, captured)?;
            let generator = crate::types::Generator::new(func_id, locals, cells);
            let gen_id = self.heap.allocate(HeapData::Generator(generator))?;
            let _callee = self.pop();
            self.push(Value::Ref(gen_id));
            return Ok(());
        }

        self.push_call_frame(func_id, code, captured, argc)
    }

    /// Pushes a call frame, reusing the argument slots as locals 0..argc.
    fn push_call_frame(
        &mut self,
        func_id: FunctionId,
        code: &'a Code,
        captured: Option<Vec<HeapId>>,
        argc: usize,
    ) -> RunResult<()> {
        // All fallible work (exhaustion checks, cell allocation) runs before
        // any stack mutation, so a rejected call leaves the caller intact.
        let tracker = self.heap.tracker_mut();
        tracker.check_recursion(self.frames.len() + 1)?;
        let needed = self.stack.len() + (code.num_locals() - argc) + code.max_stack();
        tracker.check_stack_slots(needed)?;
        let cells = self.make_frame_cells(code, captured)?;

        let caller_top = self.stack.len() - argc - 1;
        // Remove the callee slot so the arguments become local slots 0..argc.
        self.stack.remove(caller_top);
        let stack_base = caller_top;
        self.stack.resize(stack_base + code.num_locals(), Value::Unbound);

        self.frames.push(Frame {
            code,
            ip: 0,
            stack_base,
            caller_top,
            blocks: SmallVec::new(),
            cells,
            generator_id: None,
        });
        self.tracer.on_call(
            Some(self.interns.get_str(self.interns.get_function(func_id).name_id)),
            self.frames.len(),
        );
        Ok(())
    }

    /// Creates the frame's cell vector: fresh cells for the code's cell
    /// variables followed by the captured free-variable cells.
    pub(super) fn make_frame_cells(&mut self, code: &Code, captured: Option<Vec<HeapId>>) -> RunResult<Vec<HeapId>> {
        let captured = captured.unwrap_or_default();
        if captured.len() != code.freevar_count() {
            return Err(RunError::internal(format!(
                "closure cell count mismatch: expected {}, got {}",
                code.freevar_count(),
                captured.len()
            )));
        }
        let mut cells = Vec::with_capacity(code.cellvar_count() + captured.len());
        for _ in 0..code.cellvar_count() {
            cells.push(self.heap.allocate(HeapData::Cell(Cell::empty()))?);
        }
        cells.extend(captured);
        Ok(cells)
    }

    /// Executes `MakeClosure`: pops the cell tuple, pairs it with the
    /// function constant, pushes the closure object.
    pub(super) fn make_closure(&mut self, cached: &super::CachedFrame<'a>, const_index: usize) -> RunResult<()> {
        let Some(Value::Function(func_id)) = cached.code.get_const(const_index) else {
            return Err(RunError::internal("MakeClosure constant is not a function"));
        };
        let cells_value = self.pop();
        let Value::Ref(tuple_id) = cells_value else {
            return Err(RunError::internal("MakeClosure expects a tuple of cells"));
        };
        let HeapData::Tuple(tuple) = self.heap.get(tuple_id) else {
            return Err(RunError::internal("MakeClosure expects a tuple of cells"));
        };
        let mut cells = Vec::with_capacity(tuple.len());
        for &item in tuple.items() {
            let Value::Ref(cell_id) = item else {
                return Err(RunError::internal("MakeClosure tuple holds a non-cell"));
            };
            cells.push(cell_id);
        }
        for &cell_id in &cells {
            if self.heap.get(cell_id).layout() != LayoutId::Cell {
                return Err(RunError::internal("MakeClosure tuple holds a non-cell"));
            }
        }
        let id = self.heap.allocate(HeapData::Closure(Closure::new(func_id, cells)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Calls an exception class: `ValueError("message")`.
    fn construct_exception(&mut self, exc_type: ExcType, argc: usize) -> RunResult<()> {
        if argc > 1 {
            return Err(ExcType::type_error(format!(
                "{exc_type}() takes at most 1 argument ({argc} given)"
            )));
        }
        let message = if argc == 1 {
            let arg = self.pop();
            Some(arg.py_str(self.heap, self.interns))
        } else {
            None
        };
        let callee = self.pop();
        debug_assert!(matches!(callee, Value::ExcClass(_)));
        let id = self
            .heap
            .allocate(HeapData::Exception(SimpleException::new(exc_type, message)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Natives
    // ------------------------------------------------------------------

    /// Dispatches a native call. Natives receive this VM (the logical
    /// thread) and their argument count; arguments sit on top of the stack.
    fn call_native(&mut self, native: NativeFn, argc: usize) -> RunResult<()> {
        match native {
            NativeFn::Print => {
                let base = self.stack.len() - argc;
                for i in 0..argc {
                    if i > 0 {
                        self.print.stdout_push(' ').map_err(RunError::from)?;
                    }
                    let text = self.stack[base + i].py_str(self.heap, self.interns);
                    self.print.stdout_write(text.into()).map_err(RunError::from)?;
                }
                self.print.stdout_push('\n').map_err(RunError::from)?;
                self.stack.truncate(base);
                let _callee = self.pop();
                self.push(Value::None);
                Ok(())
            }
            NativeFn::Len => {
                let arg = self.expect_one_arg("len", argc)?;
                let len = match arg {
                    Value::InternString(id) => Some(self.interns.get_str(id).chars().count()),
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapData::Str(s) => Some(s.char_len()),
                        HeapData::List(l) => Some(l.len()),
                        HeapData::Tuple(t) => Some(t.len()),
                        HeapData::Dict(d) => Some(d.len()),
                        _ => None,
                    },
                    _ => None,
                };
                match len {
                    Some(n) => {
                        self.push(Value::Int(i64::try_from(n).expect("length exceeds i64")));
                        Ok(())
                    }
                    None => Err(ExcType::type_error(format!(
                        "object of type '{}' has no len()",
                        arg.type_name(self.heap)
                    ))),
                }
            }
            NativeFn::Repr => {
                let arg = self.expect_one_arg("repr", argc)?;
                let text = arg.py_repr(self.heap, self.interns);
                let id = self.heap.allocate(HeapData::Str(Str::new(text)))?;
                self.push(Value::Ref(id));
                Ok(())
            }
            NativeFn::Iter => {
                let arg = self.expect_one_arg("iter", argc)?;
                let iterator = self.iterator_for(arg)?;
                self.push(iterator);
                Ok(())
            }
            NativeFn::Next => {
                let arg = self.expect_one_arg("next", argc)?;
                match arg {
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapData::SeqIter(_) => match self.advance_seq_iter(id)? {
                            Some(value) => {
                                self.push(value);
                                Ok(())
                            }
                            None => Err(ExcType::stop_iteration_empty()),
                        },
                        HeapData::Generator(_) => {
                            // Splices the generator frame in; the yielded
                            // value lands where next()'s result belongs.
                            self.push_generator_frame(id, Resume::Send(Value::None))
                        }
                        _ => Err(ExcType::type_error(format!(
                            "'{}' object is not an iterator",
                            arg.type_name(self.heap)
                        ))),
                    },
                    _ => Err(ExcType::type_error(format!(
                        "'{}' object is not an iterator",
                        arg.type_name(self.heap)
                    ))),
                }
            }
        }
    }

    /// Pops the single argument and the callee for a one-argument native.
    fn expect_one_arg(&mut self, name: &'static str, argc: usize) -> RunResult<Value> {
        if argc != 1 {
            return Err(ExcType::type_error(format!(
                "{name}() takes exactly one argument ({argc} given)"
            )));
        }
        let arg = self.pop();
        let _callee = self.pop();
        Ok(arg)
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Executes `GetIter`.
    pub(super) fn op_get_iter(&mut self) -> RunResult<()> {
        let value = self.pop();
        let iterator = self.iterator_for(value)?;
        self.push(iterator);
        Ok(())
    }

    /// Produces an iterator value for `value`.
    fn iterator_for(&mut self, value: Value) -> RunResult<Value> {
        match value {
            Value::InternString(sid) => {
                // Interned text becomes a heap string first so the iterator
                // has a stable sequence object to index.
                let text = self.interns.get_str(sid).to_owned();
                let str_id = self.heap.allocate(HeapData::Str(Str::new(text)))?;
                let iter_id = self.heap.allocate(HeapData::SeqIter(SeqIter::new(str_id)))?;
                Ok(Value::Ref(iter_id))
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(_) | HeapData::Tuple(_) | HeapData::Str(_) => {
                    let iter_id = self.heap.allocate(HeapData::SeqIter(SeqIter::new(id)))?;
                    Ok(Value::Ref(iter_id))
                }
                HeapData::Dict(d) => {
                    // Iterate a snapshot of the keys, in insertion order.
                    let keys: Vec<Value> = d.iter().map(|(k, _)| k).collect();
                    let tuple_id = self.heap.allocate(HeapData::Tuple(Tuple::new(keys)))?;
                    let iter_id = self.heap.allocate(HeapData::SeqIter(SeqIter::new(tuple_id)))?;
                    Ok(Value::Ref(iter_id))
                }
                HeapData::SeqIter(_) | HeapData::Generator(_) => Ok(value),
                _ => Err(ExcType::type_error(format!(
                    "'{}' object is not iterable",
                    value.type_name(self.heap)
                ))),
            },
            _ => Err(ExcType::type_error(format!(
                "'{}' object is not iterable",
                value.type_name(self.heap)
            ))),
        }
    }

    /// Advances a sequence iterator, returning `None` when exhausted.
    pub(super) fn advance_seq_iter(&mut self, iter_id: HeapId) -> RunResult<Option<Value>> {
        let HeapData::SeqIter(iter) = self.heap.get(iter_id) else {
            return Err(RunError::internal("advance on a non-iterator"));
        };
        let SeqIter { seq, index } = *iter;

        enum Item {
            Value(Value),
            Char(char),
            Done,
        }
        let item = match self.heap.get(seq) {
            HeapData::List(l) => l.get(index).map_or(Item::Done, Item::Value),
            HeapData::Tuple(t) => t.get(index).map_or(Item::Done, Item::Value),
            HeapData::Str(s) => s.as_str().chars().nth(index).map_or(Item::Done, Item::Char),
            _ => return Err(RunError::internal("iterator over a non-sequence")),
        };

        let value = match item {
            Item::Done => return Ok(None),
            Item::Value(v) => v,
            Item::Char(c) => {
                let id = self.heap.allocate(HeapData::Str(Str::new(c.to_string())))?;
                Value::Ref(id)
            }
        };
        let HeapData::SeqIter(iter) = self.heap.get_mut(iter_id) else {
            unreachable!()
        };
        iter.index += 1;
        Ok(Some(value))
    }

    /// Executes `ForIter` with the iterator at top of stack: pushes the next
    /// value, or pops the iterator and jumps to `target` on exhaustion.
    pub(super) fn op_for_iter(&mut self, target: usize) -> RunResult<()> {
        let iter_val = self.peek();
        let Value::Ref(iter_id) = iter_val else {
            return Err(ExcType::type_error(format!(
                "'{}' object is not an iterator",
                iter_val.type_name(self.heap)
            )));
        };
        match self.heap.get(iter_id) {
            HeapData::SeqIter(_) => match self.advance_seq_iter(iter_id)? {
                Some(value) => {
                    self.push(value);
                    Ok(())
                }
                None => {
                    let _iterator = self.pop();
                    self.current_frame_mut().ip = target;
                    Ok(())
                }
            },
            HeapData::Generator(r#gen) => {
                if r#gen.state == GeneratorState::Completed {
                    let _iterator = self.pop();
                    self.current_frame_mut().ip = target;
                    return Ok(());
                }
                let parent_depth = self.frames.len();
                self.push_generator_frame(iter_id, Resume::Send(Value::None))?;
                self.pending_for_iter.push((parent_depth, target));
                Ok(())
            }
            _ => Err(ExcType::type_error(format!(
                "'{}' object is not an iterator",
                iter_val.type_name(self.heap)
            ))),
        }
    }
}
