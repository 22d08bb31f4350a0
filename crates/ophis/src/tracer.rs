//! VM execution tracing.
//!
//! Trait-based hooks at key execution events with zero-cost abstraction:
//! the VM is monomorphized over its tracer, so with [`NoopTracer`] every
//! hook compiles away, the same way [`crate::resource::NoLimitTracker`]
//! eliminates resource checking.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortem |

use crate::{bytecode::Opcode, exceptions::ExcType};

/// Trace event emitted during VM execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched at the given ip.
    Instruction {
        /// Byte offset of the opcode in the frame's bytecode.
        ip: usize,
        /// The opcode that was executed.
        opcode: Opcode,
        /// Operand depth relative to the frame base at dispatch time.
        stack_depth: usize,
        /// Call-stack depth at dispatch time.
        frame_depth: usize,
    },
    /// A call pushed a new frame.
    Call {
        /// Callee name, when known.
        name: Option<String>,
        /// Call-stack depth after the push.
        depth: usize,
    },
    /// A return popped a frame.
    Return {
        /// Call-stack depth after the pop.
        depth: usize,
    },
    /// An exception was raised.
    Raise {
        /// The raised exception type.
        exc_type: ExcType,
    },
    /// A handler block claimed an exception.
    Catch {
        /// The claimed exception type.
        exc_type: ExcType,
        /// Handler bytecode offset.
        handler: usize,
    },
    /// A generator frame was excised from the stack.
    GeneratorSuspend {
        /// Call-stack depth after the excision.
        depth: usize,
    },
    /// A generator frame was spliced back onto the stack.
    GeneratorResume {
        /// Call-stack depth after the splice.
        depth: usize,
    },
    /// A collection ran.
    Gc {
        /// Number of objects freed.
        freed: usize,
    },
}

/// Hooks invoked by the VM at key execution events.
///
/// All hooks default to no-ops; implement only what you need.
pub trait VmTracer {
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}
    fn on_call(&mut self, _name: Option<&str>, _depth: usize) {}
    fn on_return(&mut self, _depth: usize) {}
    fn on_raise(&mut self, _exc_type: ExcType) {}
    fn on_catch(&mut self, _exc_type: ExcType, _handler: usize) {}
    fn on_generator_suspend(&mut self, _depth: usize) {}
    fn on_generator_resume(&mut self, _depth: usize) {}
    fn on_gc(&mut self, _freed: usize) {}
}

/// Zero-cost tracer: every hook is an empty default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that logs a human-readable line per event to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        eprintln!("[vm] {ip:>5}  {opcode:?}  stack={stack_depth} frames={frame_depth}");
    }

    fn on_call(&mut self, name: Option<&str>, depth: usize) {
        eprintln!("[vm] call {} depth={depth}", name.unwrap_or("<anonymous>"));
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[vm] return depth={depth}");
    }

    fn on_raise(&mut self, exc_type: ExcType) {
        eprintln!("[vm] raise {exc_type}");
    }

    fn on_catch(&mut self, exc_type: ExcType, handler: usize) {
        eprintln!("[vm] catch {exc_type} -> {handler}");
    }

    fn on_generator_suspend(&mut self, depth: usize) {
        eprintln!("[vm] generator suspend depth={depth}");
    }

    fn on_generator_resume(&mut self, depth: usize) {
        eprintln!("[vm] generator resume depth={depth}");
    }

    fn on_gc(&mut self, freed: usize) {
        eprintln!("[vm] gc freed={freed}");
    }
}

/// Tracer that records every event for inspection after the run.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded events, in execution order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        self.events.push(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
            frame_depth,
        });
    }

    fn on_call(&mut self, name: Option<&str>, depth: usize) {
        self.events.push(TraceEvent::Call {
            name: name.map(ToOwned::to_owned),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }

    fn on_raise(&mut self, exc_type: ExcType) {
        self.events.push(TraceEvent::Raise { exc_type });
    }

    fn on_catch(&mut self, exc_type: ExcType, handler: usize) {
        self.events.push(TraceEvent::Catch { exc_type, handler });
    }

    fn on_generator_suspend(&mut self, depth: usize) {
        self.events.push(TraceEvent::GeneratorSuspend { depth });
    }

    fn on_generator_resume(&mut self, depth: usize) {
        self.events.push(TraceEvent::GeneratorResume { depth });
    }

    fn on_gc(&mut self, freed: usize) {
        self.events.push(TraceEvent::Gc { freed });
    }
}
