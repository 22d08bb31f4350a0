//! The embedding surface.
//!
//! A [`Machine`] owns one logical thread's heap, interned names, global
//! namespace and handle stack. Each entry point (running a code object,
//! calling a function, resuming a generator) constructs a VM borrowing
//! those parts, runs it to a stopping point, and converts the outcome to
//! host types. The last uncaught exception is retained and can be read or
//! cleared, which is the minimal primitive an extension-compatibility
//! layer needs.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{Code, FrameExit, Resume, Vm},
    exceptions::{ExcType, Exception, RunError, SimpleException},
    handle::{Handle, HandleScope, HandleStack},
    heap::{Heap, HeapData, HeapEntry, HeapStats},
    intern::{FunctionId, Interns, StringId},
    io::{PrintWriter, StdPrint},
    namespace::Globals,
    object::{object_from_value, value_from_object, Object},
    resource::{LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    types::GeneratorState,
    value::Value,
};

/// Result of one generator resumption step.
#[derive(Debug, Clone, PartialEq)]
pub enum GenStep {
    /// The generator suspended at a yield, producing this value.
    Yielded(Object),
    /// The generator completed, returning this value.
    Done(Object),
}

/// Result of calling a function from the embedder.
#[derive(Debug)]
pub enum CallOutcome<'h> {
    /// The call completed with a plain value.
    Value(Object),
    /// The call constructed a generator; it is rooted in the caller's
    /// handle scope and resumable via the `generator_*` methods.
    Generator(Handle<'h>),
}

/// Serialized machine state: heap slots, globals and interned tables.
///
/// Suspended generators are heap objects, so a snapshot taken between
/// resumptions captures them mid-execution.
#[derive(Serialize, Deserialize)]
struct MachineSnapshot {
    heap_entries: Vec<HeapEntry>,
    globals: Globals,
    interns: Interns,
}

/// One logical thread of the runtime: heap, names, globals, roots.
pub struct Machine<T: ResourceTracker = NoLimitTracker> {
    heap: Heap<T>,
    interns: Interns,
    globals: Globals,
    handles: Rc<HandleStack>,
    pending_exception: Option<Exception>,
}

impl Machine<NoLimitTracker> {
    /// Creates a machine with no resource limits beyond the sanity
    /// recursion bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker)
    }

    /// Restores a machine from a snapshot produced by [`Machine::snapshot`].
    pub fn restore(bytes: &[u8]) -> Result<Self, postcard::Error> {
        let snapshot: MachineSnapshot = postcard::from_bytes(bytes)?;
        Ok(Self {
            heap: Heap::from_entries(snapshot.heap_entries, NoLimitTracker),
            interns: snapshot.interns,
            globals: snapshot.globals,
            handles: Rc::new(HandleStack::new()),
            pending_exception: None,
        })
    }
}

impl Default for Machine<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine<LimitedTracker> {
    /// Creates a machine enforcing the given limits.
    #[must_use]
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self::with_tracker(LimitedTracker::new(limits))
    }
}

impl<T: ResourceTracker> Machine<T> {
    /// Creates a machine with a custom resource tracker.
    pub fn with_tracker(tracker: T) -> Self {
        Self {
            heap: Heap::new(tracker),
            interns: Interns::new(),
            globals: Globals::new(),
            handles: Rc::new(HandleStack::new()),
            pending_exception: None,
        }
    }

    /// Interns a string, for building code objects.
    pub fn intern(&mut self, s: &str) -> StringId {
        self.interns.intern(s)
    }

    /// Registers a function body under a name, making it callable.
    pub fn register_function(&mut self, name: &str, code: Code) -> FunctionId {
        let name_id = self.interns.intern(name);
        self.interns.add_function(name_id, code)
    }

    /// The machine's handle stack, for creating root scopes.
    #[must_use]
    pub fn handles(&self) -> Rc<HandleStack> {
        Rc::clone(&self.handles)
    }

    /// Sets the allocation-pressure threshold for in-run collections.
    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.heap.set_gc_threshold(threshold);
    }

    /// The last uncaught exception, if any.
    #[must_use]
    pub fn pending_exception(&self) -> Option<&Exception> {
        self.pending_exception.as_ref()
    }

    /// Clears and returns the last uncaught exception.
    pub fn take_exception(&mut self) -> Option<Exception> {
        self.pending_exception.take()
    }

    /// Heap statistics.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Forces a collection with the machine's root set (globals and
    /// handles), returning the number of freed objects.
    pub fn collect(&mut self) -> usize {
        let globals = &mut self.globals;
        let handles = &self.handles;
        self.heap.collect(|visit| {
            globals.visit_roots(visit);
            handles.visit_roots(visit);
        })
    }

    /// Serializes heap, globals and interned tables.
    pub fn snapshot(&self) -> Result<Vec<u8>, postcard::Error> {
        let snapshot = MachineSnapshot {
            heap_entries: self.heap.export_entries().to_vec(),
            globals: self.globals.clone(),
            interns: self.interns.clone(),
        };
        postcard::to_allocvec(&snapshot)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Executes module-level code to completion, printing to stdout.
    pub fn run_code(&mut self, code: &Code) -> Result<Object, Exception> {
        self.run_code_with(code, &mut StdPrint, &mut NoopTracer)
    }

    /// Executes module-level code with a custom print writer and tracer.
    pub fn run_code_with<P: PrintWriter, Tr: VmTracer>(
        &mut self,
        code: &Code,
        print: &mut P,
        tracer: &mut Tr,
    ) -> Result<Object, Exception> {
        let handles = Rc::clone(&self.handles);
        let mut vm = Vm::new(
            &mut self.heap,
            &self.interns,
            &mut self.globals,
            &handles,
            print,
            tracer,
        );
        let exit = vm.run_module(code);
        self.finish_plain(exit)
    }

    /// Calls a registered function with host arguments.
    ///
    /// A generator function call returns [`CallOutcome::Generator`] with the
    /// new generator rooted in `scope`.
    pub fn call_function<'h>(
        &mut self,
        func: FunctionId,
        args: &[Object],
        scope: &'h HandleScope<'h>,
    ) -> Result<CallOutcome<'h>, Exception> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = value_from_object(arg, &mut self.heap, &self.interns)
                .map_err(|e| self.surface(e))?;
            values.push(value);
        }
        let handles = Rc::clone(&self.handles);
        let mut print = StdPrint;
        let mut tracer = NoopTracer;
        let mut vm = Vm::new(
            &mut self.heap,
            &self.interns,
            &mut self.globals,
            &handles,
            &mut print,
            &mut tracer,
        );
        match vm.run_call(Value::Function(func), values) {
            Ok(FrameExit::Return(value)) => {
                if let Value::Ref(id) = value
                    && matches!(self.heap.get(id), HeapData::Generator(_))
                {
                    return Ok(CallOutcome::Generator(scope.root(value)));
                }
                let object = object_from_value(value, &self.heap, &self.interns)
                    .map_err(|e| self.surface(e))?;
                Ok(CallOutcome::Value(object))
            }
            Ok(FrameExit::Yielded(_)) => {
                Err(self.surface(RunError::internal("function call yielded without a generator")))
            }
            Err(e) => Err(self.surface(e)),
        }
    }

    /// Sets a module-level global from a host value.
    pub fn set_global(&mut self, name: &str, value: &Object) -> Result<(), Exception> {
        let name_id = self.interns.intern(name);
        let converted = value_from_object(value, &mut self.heap, &self.interns)
            .map_err(|e| self.surface(e))?;
        self.globals.set(name_id, converted);
        Ok(())
    }

    /// Reads a module-level global.
    ///
    /// Plain data comes back as an owned [`Object`]; a generator comes back
    /// as a handle rooted in `scope`, resumable via the `generator_*`
    /// methods. Returns `Ok(None)` when the name is not defined.
    pub fn get_global<'h>(
        &mut self,
        name: &str,
        scope: &'h HandleScope<'h>,
    ) -> Result<Option<CallOutcome<'h>>, Exception> {
        let name_id = self.interns.intern(name);
        let Some(value) = self.globals.get(name_id) else {
            return Ok(None);
        };
        if let Value::Ref(id) = value
            && matches!(self.heap.get(id), HeapData::Generator(_))
        {
            return Ok(Some(CallOutcome::Generator(scope.root(value))));
        }
        let object = object_from_value(value, &self.heap, &self.interns)
            .map_err(|e| self.surface(e))?;
        Ok(Some(CallOutcome::Value(object)))
    }

    // ------------------------------------------------------------------
    // Generator surface
    // ------------------------------------------------------------------

    /// Resumes a generator with `send(value)` (`__next__` is
    /// `send(Object::None)`).
    pub fn generator_send(&mut self, r#gen: &Handle<'_>, value: Object) -> Result<GenStep, Exception> {
        let gen_id = self.generator_id(r#gen)?;
        let sent = value_from_object(&value, &mut self.heap, &self.interns)
            .map_err(|e| self.surface(e))?;
        self.resume_step(gen_id, Resume::Send(sent))
    }

    /// Raises an exception at the generator's suspension point.
    ///
    /// When the generator is suspended at a `yield from` of a sub-generator,
    /// the throw is forwarded to the sub-generator first; a sub-iterator
    /// without throw support sees the exception raised at the delegating
    /// site instead.
    pub fn generator_throw(
        &mut self,
        r#gen: &Handle<'_>,
        exc_type: ExcType,
        message: Option<&str>,
    ) -> Result<GenStep, Exception> {
        let gen_id = self.generator_id(r#gen)?;
        let err: RunError = SimpleException::new(exc_type, message.map(ToOwned::to_owned)).into();
        self.resume_step(gen_id, Resume::Throw(err))
    }

    /// Closes a generator: throws `GeneratorExit` at the suspension point
    /// and expects it (or `StopIteration`) to escape.
    pub fn generator_close(&mut self, r#gen: &Handle<'_>) -> Result<(), Exception> {
        let gen_id = self.generator_id(r#gen)?;
        let state = self.gen_state(gen_id)?;
        match state {
            GeneratorState::Completed => Ok(()),
            GeneratorState::Created => {
                // Never started: nothing to unwind, no bytecode runs.
                match self.heap.get_generator_mut(gen_id) {
                    Ok(r#gen) => r#gen.state = GeneratorState::Completed,
                    Err(e) => return Err(self.surface(e)),
                }
                Ok(())
            }
            GeneratorState::Running => {
                Err(self.surface(RunError::internal("generator already executing")))
            }
            GeneratorState::Suspended => {
                let err: RunError = SimpleException::new_none(ExcType::GeneratorExit).into();
                match self.resume_raw(gen_id, Resume::Throw(err)) {
                    Ok(FrameExit::Yielded(_)) => Err(self.surface(
                        ExcType::RuntimeError.raise("generator ignored GeneratorExit"),
                    )),
                    Ok(FrameExit::Return(_)) => Ok(()),
                    Err(e)
                        if e.is_exception_type(ExcType::GeneratorExit)
                            || e.is_exception_type(ExcType::StopIteration) =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(self.surface(e)),
                }
            }
        }
    }

    /// The execution state of a generator handle.
    pub fn generator_state(&mut self, r#gen: &Handle<'_>) -> Result<GeneratorStatus, Exception> {
        let gen_id = self.generator_id(r#gen)?;
        let state = self.gen_state(gen_id)?;
        Ok(match state {
            GeneratorState::Created => GeneratorStatus::Created,
            GeneratorState::Running => GeneratorStatus::Running,
            GeneratorState::Suspended => GeneratorStatus::Suspended,
            GeneratorState::Completed => GeneratorStatus::Completed,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn gen_state(&mut self, gen_id: crate::heap::HeapId) -> Result<GeneratorState, Exception> {
        match self.heap.get_generator(gen_id) {
            Ok(r#gen) => Ok(r#gen.state),
            Err(e) => Err(self.surface(e)),
        }
    }

    fn generator_id(&mut self, r#gen: &Handle<'_>) -> Result<crate::heap::HeapId, Exception> {
        let value = r#gen.get();
        let Value::Ref(id) = value else {
            return Err(self.surface(ExcType::type_error("handle does not hold a generator")));
        };
        if !matches!(self.heap.get(id), HeapData::Generator(_)) {
            return Err(self.surface(ExcType::type_error("handle does not hold a generator")));
        }
        Ok(id)
    }

    fn resume_raw(&mut self, gen_id: crate::heap::HeapId, resume: Resume) -> Result<FrameExit, RunError> {
        let handles = Rc::clone(&self.handles);
        let mut print = StdPrint;
        let mut tracer = NoopTracer;
        let mut vm = Vm::new(
            &mut self.heap,
            &self.interns,
            &mut self.globals,
            &handles,
            &mut print,
            &mut tracer,
        );
        vm.resume(gen_id, resume)
    }

    fn resume_step(&mut self, gen_id: crate::heap::HeapId, resume: Resume) -> Result<GenStep, Exception> {
        match self.resume_raw(gen_id, resume) {
            Ok(FrameExit::Yielded(value)) => {
                let object = object_from_value(value, &self.heap, &self.interns)
                    .map_err(|e| self.surface(e))?;
                Ok(GenStep::Yielded(object))
            }
            Ok(FrameExit::Return(value)) => {
                let object = object_from_value(value, &self.heap, &self.interns)
                    .map_err(|e| self.surface(e))?;
                Ok(GenStep::Done(object))
            }
            Err(e) if e.is_stop_iteration() => {
                let payload = match &e {
                    RunError::Exc(raise) => raise.exc.take_payload(),
                    _ => Value::None,
                };
                let object = object_from_value(payload, &self.heap, &self.interns)
                    .map_err(|err| self.surface(err))?;
                Ok(GenStep::Done(object))
            }
            Err(e) => Err(self.surface(e)),
        }
    }

    fn finish_plain(&mut self, exit: Result<FrameExit, RunError>) -> Result<Object, Exception> {
        match exit {
            Ok(FrameExit::Return(value)) => object_from_value(value, &self.heap, &self.interns)
                .map_err(|e| self.surface(e)),
            Ok(FrameExit::Yielded(_)) => {
                Err(self.surface(RunError::internal("module-level code yielded")))
            }
            Err(e) => Err(self.surface(e)),
        }
    }

    /// Converts an error-channel value to a public exception and records it
    /// as the machine's pending exception.
    fn surface(&mut self, error: RunError) -> Exception {
        let exception = match &error {
            RunError::Exc(raise) | RunError::Uncatchable(raise) => {
                Exception::from_raise(raise, |id| self.interns.get_str(id).to_owned())
            }
            RunError::Internal(msg) => Exception::internal(msg.clone()),
        };
        self.pending_exception = Some(exception.clone());
        exception
    }
}

/// Public view of a generator's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    /// Constructed; no bytecode has run.
    Created,
    /// Currently executing.
    Running,
    /// Suspended at a yield.
    Suspended,
    /// Finished (returned, raised, or closed).
    Completed,
}
