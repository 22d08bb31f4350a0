//! Raising, block-stack unwinding and cross-frame propagation.
//!
//! The protocol follows the classic block-stack design. `Setup*` opcodes
//! push [`TryBlock`] entries; raising searches the current frame's blocks
//! innermost-first for an `Except`/`Finally` handler, unwinds the operand
//! stack to the recorded level, pushes the `(traceback, value, type)`
//! triple for the handler body, and marks the claim with an
//! `ExceptHandler` pseudo-block. Frames without a handler are popped and
//! the search continues in the caller; an error that reaches the bottom
//! aborts the run and is surfaced to the embedder.
//!
//! Finally bodies run exactly once on every exit path. Non-exception exits
//! (`return`, `break`, `continue`) push a why-token (and payload) before
//! jumping to the finally body; `EndFinally` pops the token and resumes the
//! interrupted exit.

use super::{BlockKind, FrameExit, TryBlock, Vm, UNWIND_BREAK, UNWIND_CONTINUE, UNWIND_RETURN};
use crate::{
    exceptions::{ExcType, ExceptionRaise, RawStackFrame, RunError, RunResult, SimpleException},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::GeneratorState,
    value::Value,
};

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    // ------------------------------------------------------------------
    // Block-stack opcodes
    // ------------------------------------------------------------------

    /// Pushes a try-block recording the current operand depth.
    pub(super) fn push_block(&mut self, kind: BlockKind, handler: u32) {
        let level = u32::try_from(self.stack.len() - self.current_frame().operand_base())
            .expect("operand depth exceeds u32");
        self.current_frame_mut().blocks.push(TryBlock { kind, handler, level });
    }

    /// Pops the innermost block on normal fall-through.
    pub(super) fn pop_block(&mut self) -> RunResult<()> {
        match self.current_frame_mut().blocks.pop() {
            Some(block) if block.kind != BlockKind::ExceptHandler => Ok(()),
            Some(_) => Err(RunError::internal("PopBlock popped an except-handler block")),
            None => Err(RunError::internal("PopBlock with empty block stack")),
        }
    }

    /// Pops the except-handler pseudo-block, releasing the claimed exception
    /// and restoring the operand stack to the pre-handler depth.
    pub(super) fn pop_except(&mut self) -> RunResult<()> {
        let block = match self.current_frame_mut().blocks.pop() {
            Some(block) if block.kind == BlockKind::ExceptHandler => block,
            _ => return Err(RunError::internal("PopExcept without an active except handler")),
        };
        let base = self.current_frame().operand_base() + block.level as usize;
        self.stack.truncate(base);
        if self.exception_stack.pop().is_none() {
            return Err(RunError::internal("PopExcept with no claimed exception"));
        }
        Ok(())
    }

    /// Ends a finally body, resuming whatever exit the body intercepted.
    pub(super) fn end_finally(&mut self) -> RunResult<Option<FrameExit>> {
        match self.pop() {
            // Normal fall-through into the finally body.
            Value::None => Ok(None),
            Value::Int(UNWIND_RETURN) => {
                let value = self.pop();
                self.unwind_return(value)
            }
            Value::Int(UNWIND_BREAK) => {
                self.unwind_break()?;
                Ok(None)
            }
            Value::Int(UNWIND_CONTINUE) => {
                let Value::Int(target) = self.pop() else {
                    return Err(RunError::internal("malformed continue target in finally protocol"));
                };
                self.unwind_continue(usize::try_from(target).expect("continue target underflow"))?;
                Ok(None)
            }
            // The (traceback, value, type) triple: the finally body completed
            // normally while an exception was in flight, so re-raise the
            // original, preserving its identity.
            Value::ExcClass(_) => {
                let value = self.pop();
                let _traceback = self.pop();
                let err = self.reraise_value(value)?;
                match self.raise(err) {
                    None => Ok(None),
                    Some(unhandled) => Err(unhandled),
                }
            }
            other => Err(RunError::internal(format!(
                "malformed finally protocol value: {other:?}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Non-exception unwinding (return / break / continue)
    // ------------------------------------------------------------------

    /// Unwinds for `return`, running pending finally blocks on the way out.
    pub(super) fn unwind_return(&mut self, value: Value) -> RunResult<Option<FrameExit>> {
        loop {
            let operand_base = self.current_frame().operand_base();
            let Some(block) = self.current_frame_mut().blocks.pop() else {
                return self.do_return(value);
            };
            let level = operand_base + block.level as usize;
            match block.kind {
                BlockKind::Loop | BlockKind::Except => self.stack.truncate(level),
                BlockKind::ExceptHandler => {
                    self.exception_stack.pop();
                    self.stack.truncate(level);
                }
                BlockKind::Finally => {
                    self.stack.truncate(level);
                    self.push(value);
                    self.push(Value::Int(UNWIND_RETURN));
                    self.current_frame_mut().ip = block.handler as usize;
                    return Ok(None);
                }
            }
        }
    }

    /// Unwinds for `break`: runs finally blocks, then jumps past the loop.
    pub(super) fn unwind_break(&mut self) -> RunResult<()> {
        loop {
            let operand_base = self.current_frame().operand_base();
            let Some(block) = self.current_frame_mut().blocks.pop() else {
                return Err(RunError::internal("break outside of a loop block"));
            };
            let level = operand_base + block.level as usize;
            match block.kind {
                BlockKind::Loop => {
                    self.stack.truncate(level);
                    self.current_frame_mut().ip = block.handler as usize;
                    return Ok(());
                }
                BlockKind::Except => self.stack.truncate(level),
                BlockKind::ExceptHandler => {
                    self.exception_stack.pop();
                    self.stack.truncate(level);
                }
                BlockKind::Finally => {
                    self.stack.truncate(level);
                    self.push(Value::Int(UNWIND_BREAK));
                    self.current_frame_mut().ip = block.handler as usize;
                    return Ok(());
                }
            }
        }
    }

    /// Unwinds for `continue`: runs finally blocks, then jumps to the loop
    /// head. The loop block itself stays pushed.
    pub(super) fn unwind_continue(&mut self, target: usize) -> RunResult<()> {
        loop {
            let operand_base = self.current_frame().operand_base();
            let Some(&block) = self.current_frame().blocks.last() else {
                return Err(RunError::internal("continue outside of a loop block"));
            };
            let level = operand_base + block.level as usize;
            match block.kind {
                BlockKind::Loop => {
                    self.current_frame_mut().ip = target;
                    return Ok(());
                }
                BlockKind::Except => {
                    self.current_frame_mut().blocks.pop();
                    self.stack.truncate(level);
                }
                BlockKind::ExceptHandler => {
                    self.current_frame_mut().blocks.pop();
                    self.exception_stack.pop();
                    self.stack.truncate(level);
                }
                BlockKind::Finally => {
                    self.current_frame_mut().blocks.pop();
                    self.stack.truncate(level);
                    self.push(Value::Int(i64::try_from(target).expect("target exceeds i64")));
                    self.push(Value::Int(UNWIND_CONTINUE));
                    self.current_frame_mut().ip = block.handler as usize;
                    return Ok(());
                }
            }
        }
    }

    /// Pops the current frame and delivers the return value to the caller.
    pub(super) fn do_return(&mut self, value: Value) -> RunResult<Option<FrameExit>> {
        let depth = self.frames.len();
        let frame = self.frames.pop().expect("return with no active frame");
        self.drop_claimed_contexts(depth);
        self.stack.truncate(frame.caller_top);
        self.prune_pending_for_iter();
        self.tracer.on_return(self.frames.len());

        if let Some(gen_id) = frame.generator_id {
            let r#gen = self.heap.get_generator_mut(gen_id)?;
            r#gen.state = GeneratorState::Completed;
            r#gen.locals.clear();
            r#gen.saved_stack.clear();
            r#gen.blocks.clear();
            if self.frames.is_empty() {
                return Ok(Some(FrameExit::Return(value)));
            }
            // A nested resumption site observes generator completion as
            // StopIteration carrying the return value.
            let err: RunError = SimpleException::stop_iteration(value).into();
            return match self.raise(err) {
                None => Ok(None),
                Some(unhandled) => Err(unhandled),
            };
        }

        if self.frames.is_empty() {
            return Ok(Some(FrameExit::Return(value)));
        }
        self.push(value);
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Raising
    // ------------------------------------------------------------------

    /// Executes the `Raise` opcode, producing the error to propagate.
    pub(super) fn op_raise(&mut self, argc: u32) -> RunResult<RunError> {
        match argc {
            0 => {
                let Some(&(context, _)) = self.exception_stack.last() else {
                    return Ok(ExcType::RuntimeError.raise("No active exception to re-raise"));
                };
                self.reraise_value(context)
            }
            1 => {
                let exc = self.pop();
                self.make_raise(exc, None)
            }
            2 => {
                let cause = self.pop();
                let exc = self.pop();
                self.make_raise(exc, Some(cause))
            }
            other => Err(RunError::internal(format!("invalid raise operand {other}"))),
        }
    }

    /// Builds the error for re-raising an existing exception value,
    /// preserving its identity.
    pub(super) fn reraise_value(&mut self, value: Value) -> RunResult<RunError> {
        let Value::Ref(id) = value else {
            return Err(RunError::internal("re-raise target is not an exception object"));
        };
        let HeapData::Exception(exc) = self.heap.get(id) else {
            return Err(RunError::internal("re-raise target is not an exception object"));
        };
        let mut raise = ExceptionRaise::new(exc.clone());
        raise.original_value = Some(value);
        Ok(RunError::Exc(Box::new(raise)))
    }

    /// Converts a raised value (and optional cause) into a `RunError`,
    /// attaching the implicit context chain.
    fn make_raise(&mut self, exc_value: Value, cause_value: Option<Value>) -> RunResult<RunError> {
        let (mut exc, original_value) = match self.coerce_exception(exc_value) {
            Some(pair) => pair,
            None => {
                return Ok(ExcType::type_error("exceptions must derive from BaseException"));
            }
        };

        if let Some(cause_value) = cause_value {
            match cause_value {
                Value::None => exc.set_cause(None),
                other => match self.coerce_exception(other) {
                    Some((cause, _)) => exc.set_cause(Some(cause)),
                    None => {
                        return Ok(ExcType::type_error("exception causes must derive from BaseException"));
                    }
                },
            }
        }

        // Implicit chaining: raising while an exception is being handled
        // records it as __context__, unless that is the same object.
        if let Some(&(context_value, _)) = self.exception_stack.last()
            && original_value.is_none_or(|v| !v.is_identical(context_value))
            && let Value::Ref(ctx_id) = context_value
            && let HeapData::Exception(ctx) = self.heap.get(ctx_id)
        {
            exc.set_context(ctx.clone());
        }

        let mut raise = ExceptionRaise::new(exc);
        raise.original_value = original_value;
        Ok(RunError::Exc(Box::new(raise)))
    }

    /// Extracts a `SimpleException` from a raisable value: an exception
    /// class (instantiated with no message) or an exception object.
    fn coerce_exception(&self, value: Value) -> Option<(SimpleException, Option<Value>)> {
        match value {
            Value::ExcClass(exc_type) => Some((SimpleException::new_none(exc_type), None)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Exception(exc) => Some((exc.clone(), Some(value))),
                _ => None,
            },
            _ => None,
        }
    }

    /// Materializes the heap value handlers receive for this error.
    ///
    /// Reuses the original raised object when there is one, so identity is
    /// preserved through catch and re-raise.
    fn exception_value(&mut self, error: &RunError) -> RunResult<Value> {
        let RunError::Exc(raise) = error else {
            return Err(RunError::internal("exception_value on a non-raisable error"));
        };
        if let Some(original) = raise.original_value {
            return Ok(original);
        }
        // Untracked: a resource-limit exception must be materializable even
        // though the budget is already exhausted.
        let id = self.heap.allocate_untracked(HeapData::Exception(raise.exc.clone()));
        Ok(Value::Ref(id))
    }

    /// Records the innermost traceback frame if the error has none yet.
    fn attach_frame(&self, error: &mut RunError) {
        let frame_info = self.frames.last().map(|frame| RawStackFrame {
            name_id: frame.code.name_id,
            ip: self.instruction_ip,
        });
        let Some(frame_info) = frame_info else { return };
        match error {
            RunError::Exc(raise) | RunError::Uncatchable(raise) => {
                if raise.frames.is_empty() {
                    raise.frames.push(frame_info);
                }
            }
            RunError::Internal(_) => {}
        }
    }

    /// Handles a pending error against the block stack.
    ///
    /// Returns `None` when a handler claimed the error (execution continues
    /// at the handler), or `Some(error)` when it propagated past the
    /// outermost frame and the run must abort.
    pub(super) fn raise(&mut self, mut error: RunError) -> Option<RunError> {
        // An error can arrive here twice: once from the operation that
        // produced it and once from the dispatch loop observing the
        // unhandled result. With no frames left there is nothing to search.
        if self.frames.is_empty() {
            return Some(error);
        }
        self.attach_frame(&mut error);
        if let RunError::Exc(raise) | RunError::Uncatchable(raise) = &error {
            self.tracer.on_raise(raise.exc.exc_type());
        }

        // Internal-consistency failures and uncatchable limits bypass the
        // block stack entirely; only the traceback is collected.
        if matches!(error, RunError::Internal(_) | RunError::Uncatchable(_)) {
            return Some(self.unwind_for_traceback(error));
        }

        // A generator resumed by `ForIter` finished: pop the iterator from
        // the parent frame and jump past the loop.
        if error.is_stop_iteration()
            && let Some(&(parent_depth, target)) = self.pending_for_iter.last()
            && parent_depth == self.frames.len()
        {
            self.pending_for_iter.pop();
            let _iterator = self.pop();
            self.current_frame_mut().ip = target;
            return None;
        }

        // A delegated sub-iterator finished: the StopIteration payload is
        // the value of the `yield from` expression.
        if error.is_stop_iteration()
            && let Some(frame) = self.frames.last()
            && frame.code.bytecode().get(frame.ip).copied() == Some(crate::bytecode::Opcode::YieldFrom as u8)
            && self.stack.len() > frame.operand_base()
        {
            let payload = match &error {
                RunError::Exc(raise) => raise.exc.take_payload(),
                _ => Value::None,
            };
            let _iterator = self.pop();
            self.push(payload);
            self.current_frame_mut().ip += 2;
            return None;
        }

        loop {
            // Search the current frame's block stack, innermost first.
            while let Some(block) = self.current_frame_mut().blocks.pop() {
                let level = self.current_frame().operand_base() + block.level as usize;
                match block.kind {
                    BlockKind::Loop => self.stack.truncate(level),
                    BlockKind::ExceptHandler => {
                        self.exception_stack.pop();
                        self.stack.truncate(level);
                    }
                    BlockKind::Except | BlockKind::Finally => {
                        let exc_value = match self.exception_value(&error) {
                            Ok(v) => v,
                            Err(e) => return Some(e),
                        };
                        let exc_type = match &error {
                            RunError::Exc(raise) => raise.exc.exc_type(),
                            _ => unreachable!("only raisable errors reach handler claim"),
                        };
                        self.stack.truncate(level);
                        // Handler body receives (traceback, value, type).
                        self.push(Value::None);
                        self.push(exc_value);
                        self.push(Value::ExcClass(exc_type));
                        self.current_frame_mut().blocks.push(TryBlock {
                            kind: BlockKind::ExceptHandler,
                            handler: 0,
                            level: block.level,
                        });
                        let depth = self.frames.len();
                        self.exception_stack.push((exc_value, depth));
                        self.pending_for_iter.retain(|&(d, _)| d < depth);
                        self.current_frame_mut().ip = block.handler as usize;
                        self.tracer.on_catch(exc_type, block.handler as usize);
                        return None;
                    }
                }
            }

            // No handler here: pop the frame and continue in the caller.
            let depth = self.frames.len();
            let frame = self.frames.pop().expect("raise with no active frame");
            self.drop_claimed_contexts(depth);
            self.stack.truncate(frame.caller_top);
            self.prune_pending_for_iter();

            if let Some(gen_id) = frame.generator_id {
                if let Ok(r#gen) = self.heap.get_generator_mut(gen_id) {
                    r#gen.state = GeneratorState::Completed;
                    r#gen.locals.clear();
                    r#gen.saved_stack.clear();
                    r#gen.blocks.clear();
                }
                // PEP 479: StopIteration escaping a generator body would be
                // indistinguishable from normal exhaustion, so it becomes
                // RuntimeError.
                if error.is_stop_iteration() {
                    error = ExcType::generator_raised_stop_iteration();
                    self.attach_frame(&mut error);
                }
            }

            if self.frames.is_empty() {
                return Some(error);
            }

            let caller = self.current_frame();
            let frame_info = RawStackFrame {
                name_id: caller.code.name_id,
                ip: caller.ip,
            };
            match &mut error {
                RunError::Exc(raise) | RunError::Uncatchable(raise) => raise.add_caller_frame(frame_info),
                RunError::Internal(_) => {}
            }
            self.instruction_ip = self.current_frame().ip;
        }
    }

    /// Unwinds the whole call stack to collect a traceback for an error the
    /// block stack is not allowed to claim.
    fn unwind_for_traceback(&mut self, mut error: RunError) -> RunError {
        while let Some(frame) = self.frames.pop() {
            let depth = self.frames.len() + 1;
            self.drop_claimed_contexts(depth);
            self.stack.truncate(frame.caller_top);
            if let Some(gen_id) = frame.generator_id
                && let Ok(r#gen) = self.heap.get_generator_mut(gen_id)
            {
                r#gen.state = GeneratorState::Completed;
                r#gen.locals.clear();
                r#gen.saved_stack.clear();
                r#gen.blocks.clear();
            }
            if let Some(caller) = self.frames.last() {
                let frame_info = RawStackFrame {
                    name_id: caller.code.name_id,
                    ip: caller.ip,
                };
                match &mut error {
                    RunError::Exc(raise) | RunError::Uncatchable(raise) => raise.add_caller_frame(frame_info),
                    RunError::Internal(_) => {}
                }
            }
        }
        self.pending_for_iter.clear();
        error
    }
}
