//! Bytecode representation and the virtual machine.
//!
//! - `op` - opcode and comparison-kind enums
//! - `code` - the immutable code object the interpreter executes
//! - `builder` - `CodeBuilder` for emitting bytecode
//! - `vm` - the dispatch loop, frames and unwinding machinery

pub use builder::{CodeBuilder, JumpLabel};
pub use code::Code;
pub use op::{CompareKind, Opcode};
pub(crate) use vm::{FrameExit, Resume, Vm};

mod builder;
mod code;
mod op;
pub(crate) mod vm;
