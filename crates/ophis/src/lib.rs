#![doc = include_str!("../../../README.md")]

mod bytecode;
mod exceptions;
mod handle;
mod heap;
mod intern;
mod io;
mod namespace;
mod object;
mod resource;
mod runner;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    bytecode::{Code, CodeBuilder, CompareKind, JumpLabel, Opcode},
    exceptions::{ChainKind, ExcType, Exception, StackFrame},
    handle::{Handle, HandleScope, HandleStack},
    heap::HeapStats,
    intern::{FunctionId, StringId},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, DEFAULT_MAX_VALUE_STACK, LimitedTracker, NoLimitTracker,
        ResourceError, ResourceLimits, ResourceTracker,
    },
    runner::{CallOutcome, GenStep, GeneratorStatus, Machine},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::NativeFn,
};
