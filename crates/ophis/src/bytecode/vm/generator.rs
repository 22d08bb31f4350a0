//! Generator suspension and resumption.
//!
//! A generator owns its frame as heap data. Resumption splices that frame
//! onto the VM's shared stack region (locals, saved operand segment, block
//! stack, claimed-exception contexts) and continues the dispatch loop;
//! suspension excises all of it back into the heap object. A yield inside a
//! `yield from` delegation cascades: every delegating generator frame on
//! the way out suspends with its instruction pointer parked on the
//! delegating instruction, so resumption re-enters the delegation.

use super::{Frame, FrameExit, Vm};
use crate::{
    bytecode::op::Opcode,
    exceptions::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::GeneratorState,
    value::Value,
};

/// How a generator is being resumed.
#[derive(Debug)]
pub(crate) enum Resume {
    /// `send(value)` / `__next__()`: the value becomes the result of the
    /// suspended yield expression.
    Send(Value),
    /// `throw(exc)`: the error is raised at the suspension point, after
    /// delegation forwarding.
    Throw(RunError),
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    /// Splices a generator's frame onto the VM stack and applies `resume`.
    ///
    /// On `Ok(())` the frame is live and the dispatch loop may continue.
    /// On `Err` the caller must route the error through `raise`: if the
    /// frame was restored (throw at a suspension point), the generator's
    /// own handlers get first claim; otherwise the error belongs to the
    /// caller (completed generator, invalid send, re-entrant resumption).
    pub(super) fn push_generator_frame(&mut self, gen_id: HeapId, resume: Resume) -> RunResult<()> {
        let state = self.heap.get_generator(gen_id)?.state;
        match state {
            GeneratorState::Running => {
                // Re-entrant resumption would corrupt the shared stack; this
                // is a usage bug, not a program-level condition.
                Err(RunError::internal("generator already executing"))
            }
            GeneratorState::Completed => match resume {
                Resume::Send(_) => Err(ExcType::stop_iteration_empty()),
                Resume::Throw(err) => Err(err),
            },
            GeneratorState::Created => {
                if let Resume::Throw(err) = resume {
                    // Never-started generator: nothing to unwind inside it.
                    self.heap.get_generator_mut(gen_id)?.state = GeneratorState::Completed;
                    return Err(err);
                }
                if let Resume::Send(value) = &resume
                    && !matches!(value, Value::None)
                {
                    return Err(ExcType::type_error(
                        "can't send non-None value to a just-started generator",
                    ));
                }
                self.splice_frame(gen_id)?;
                self.tracer.on_generator_resume(self.frames.len());
                Ok(())
            }
            GeneratorState::Suspended => {
                self.splice_frame(gen_id)?;
                self.tracer.on_generator_resume(self.frames.len());
                match resume {
                    Resume::Send(value) => {
                        // The sent value is the result of the suspended
                        // yield; for a parked `yield from` it is the value
                        // forwarded to the sub-iterator on re-execution.
                        self.push(value);
                        Ok(())
                    }
                    Resume::Throw(err) => self.forward_throw(err),
                }
            }
        }
    }

    /// Restores the excised frame onto the shared stack.
    fn splice_frame(&mut self, gen_id: HeapId) -> RunResult<()> {
        // Exhaustion checks run before the generator is touched, so a
        // rejected splice leaves it resumable.
        let r#gen = self.heap.get_generator(gen_id)?;
        let func_id = r#gen.func_id;
        let frame_slots = r#gen.locals.len() + r#gen.saved_stack.len();
        let interns: &'a crate::intern::Interns = self.interns;
        let code = &interns.get_function(func_id).code;
        let tracker = self.heap.tracker_mut();
        tracker.check_recursion(self.frames.len() + 1)?;
        tracker.check_stack_slots(self.stack.len() + frame_slots + code.max_stack())?;

        let r#gen = self.heap.get_generator_mut(gen_id)?;
        r#gen.state = GeneratorState::Running;
        let locals = std::mem::take(&mut r#gen.locals);
        let saved_stack = std::mem::take(&mut r#gen.saved_stack);
        let blocks = std::mem::take(&mut r#gen.blocks);
        let contexts = std::mem::take(&mut r#gen.saved_contexts);
        let saved_ip = r#gen.saved_ip;
        let cells = r#gen.cells.clone();

        let caller_top = self.stack.len();
        let stack_base = caller_top;
        self.stack.extend(locals);
        self.stack.extend(saved_stack);
        let depth = self.frames.len() + 1;
        for context in contexts {
            self.exception_stack.push((context, depth));
        }
        self.frames.push(Frame {
            code,
            ip: saved_ip,
            stack_base,
            caller_top,
            blocks,
            cells,
            generator_id: Some(gen_id),
        });
        Ok(())
    }

    /// Routes a `throw` into a freshly restored generator frame.
    ///
    /// If the generator is parked on a `yield from` whose sub-iterator can
    /// accept a throw (a generator), the throw is forwarded inward first;
    /// a sub-iterator with no throw support leaves the exception to be
    /// raised at the delegating instruction itself.
    fn forward_throw(&mut self, err: RunError) -> RunResult<()> {
        let frame = self.current_frame();
        let parked_on_yield_from =
            frame.code.bytecode().get(frame.ip).copied() == Some(Opcode::YieldFrom as u8)
                && self.stack.len() > frame.operand_base();
        if parked_on_yield_from
            && let Value::Ref(sub_id) = self.peek()
            && matches!(self.heap.get(sub_id), HeapData::Generator(_))
        {
            return self.push_generator_frame(sub_id, Resume::Throw(err));
        }
        Err(err)
    }

    /// Executes `YieldValue`: excises the current generator frame and
    /// cascades the value out through any delegating frames.
    pub(super) fn yield_value(&mut self, value: Value) -> RunResult<Option<FrameExit>> {
        loop {
            self.suspend_current_frame()?;

            if self.frames.is_empty() {
                // Machine-level resumption boundary.
                return Ok(Some(FrameExit::Yielded(value)));
            }

            // A `ForIter` resumption: the value lands above the iterator in
            // the loop's frame.
            if let Some(&(parent_depth, _)) = self.pending_for_iter.last()
                && parent_depth == self.frames.len()
            {
                self.pending_for_iter.pop();
                self.push(value);
                return Ok(None);
            }

            let parent = self.current_frame();
            let delegating = parent.generator_id.is_some()
                && parent.code.bytecode().get(parent.ip).copied() == Some(Opcode::YieldFrom as u8);
            if delegating {
                // The delegating generator suspends too, propagating the
                // value outward.
                continue;
            }

            // A plain caller (e.g. a `next()` native call site).
            self.push(value);
            return Ok(None);
        }
    }

    /// Excises the current frame into its generator heap object.
    fn suspend_current_frame(&mut self) -> RunResult<()> {
        let depth = self.frames.len();
        let frame = self.frames.pop().expect("yield with no active frame");
        let Some(gen_id) = frame.generator_id else {
            return Err(RunError::internal("yield outside a generator frame"));
        };

        let operand_base = frame.stack_base + frame.code.num_locals();
        let saved_stack: Vec<Value> = self.stack.drain(operand_base..).collect();
        let locals: Vec<Value> = self.stack.drain(frame.stack_base..).collect();
        debug_assert_eq!(self.stack.len(), frame.caller_top);

        // Claimed exceptions belonging to this frame travel with it.
        let mut contexts: Vec<Value> = Vec::new();
        while self.exception_stack.last().is_some_and(|&(_, d)| d == depth) {
            let (value, _) = self.exception_stack.pop().expect("claimed context disappeared");
            contexts.push(value);
        }
        contexts.reverse();

        let r#gen = self.heap.get_generator_mut(gen_id)?;
        r#gen.state = GeneratorState::Suspended;
        r#gen.locals = locals;
        r#gen.saved_stack = saved_stack;
        r#gen.blocks = frame.blocks;
        r#gen.saved_ip = frame.ip;
        r#gen.saved_contexts = contexts;
        self.tracer.on_generator_suspend(self.frames.len());
        Ok(())
    }

    /// Executes `YieldFrom`. The stack holds the sub-iterator under the
    /// value to send; the current frame's ip is parked on this instruction
    /// so every resumption re-enters the delegation.
    pub(super) fn op_yield_from(&mut self, op_ip: usize) -> RunResult<Option<FrameExit>> {
        self.current_frame_mut().ip = op_ip;
        let sent = self.pop();
        let iter_val = self.peek();
        let Value::Ref(iter_id) = iter_val else {
            return Err(ExcType::type_error(format!(
                "cannot 'yield from' a non-iterator of type '{}'",
                iter_val.type_name(self.heap)
            )));
        };
        match self.heap.get(iter_id) {
            HeapData::Generator(_) => {
                // Delegation completion arrives as StopIteration at this
                // parked instruction, which pushes the payload and steps
                // past the delegation.
                self.push_generator_frame(iter_id, Resume::Send(sent))?;
                Ok(None)
            }
            HeapData::SeqIter(_) => match self.advance_seq_iter(iter_id)? {
                Some(value) => self.yield_value(value),
                None => {
                    let _iterator = self.pop();
                    self.current_frame_mut().ip = op_ip + 2;
                    self.push(Value::None);
                    Ok(None)
                }
            },
            _ => Err(ExcType::type_error(format!(
                "cannot 'yield from' a non-iterator of type '{}'",
                iter_val.type_name(self.heap)
            ))),
        }
    }
}
