//! Opcode definitions.
//!
//! Instructions are a fixed two bytes: one opcode byte and one operand byte.
//! Operands wider than eight bits are encoded with [`Opcode::ExtendedArg`]
//! prefixes, each contributing eight high-order bits to the following
//! instruction's operand. Jump operands are absolute byte offsets into the
//! instruction stream.

use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

/// One bytecode operation.
///
/// Decoding an unknown opcode byte is a fatal internal-consistency failure:
/// it means the code object is corrupted or was produced for an incompatible
/// revision, so the interpreter aborts rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,

    // Stack manipulation
    PopTop,
    DupTop,
    RotTwo,
    RotThree,

    // Constants and variables
    /// Push constant pool entry `arg`.
    LoadConst,
    /// Push local slot `arg`; raises `UnboundLocalError` on unbound slots.
    LoadLocal,
    /// Pop into local slot `arg`.
    StoreLocal,
    /// Unbind local slot `arg`.
    DeleteLocal,
    /// Push the global named by names-table entry `arg`.
    LoadGlobal,
    /// Pop into the global named by names-table entry `arg`.
    StoreGlobal,

    // Closure cells
    /// Push the value inside cell `arg` of the current frame.
    LoadDeref,
    /// Pop into cell `arg` of the current frame.
    StoreDeref,
    /// Push cell `arg` itself (for building closure tuples).
    LoadClosure,
    /// Pop a tuple of cells, combine with the function constant at pool
    /// entry `arg`, push a closure object.
    MakeClosure,

    // Unary operations
    UnaryNeg,
    UnaryNot,
    UnaryInvert,

    // Binary operations
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryFloorDiv,
    BinaryMod,

    /// Pop rhs and lhs, compare per the [`CompareKind`] operand, push the result.
    CompareOp,

    // Control flow (absolute byte-offset targets)
    Jump,
    PopJumpIfFalse,
    PopJumpIfTrue,

    // Iteration
    /// Pop a value, push an iterator over it.
    GetIter,
    /// With an iterator on top of the stack, push its next value; when the
    /// iterator is exhausted, pop it and jump to `arg`.
    ForIter,

    // Container construction
    /// Pop `arg` values, push a list of them.
    BuildList,
    /// Pop `arg` values, push a tuple of them.
    BuildTuple,

    // Calls
    /// Call the object under `arg` positional arguments.
    CallFunction,
    /// Pop the return value and leave the current frame.
    ReturnValue,

    /// Raise an exception: `arg` is 0 (bare re-raise), 1 (`raise X`) or
    /// 2 (`raise X from Y`).
    Raise,

    // Block stack
    /// Push a loop block; `arg` is the instruction after the loop.
    SetupLoop,
    /// Push an except block; `arg` is the handler offset.
    SetupExcept,
    /// Push a finally block; `arg` is the finally-body offset.
    SetupFinally,
    /// Pop the innermost block on normal fall-through.
    PopBlock,
    /// Pop the except-handler pseudo-block, releasing the claimed exception.
    PopExcept,
    /// End a finally body: resume whatever exit the body intercepted.
    EndFinally,
    /// Unwind to the innermost loop block and jump past the loop.
    BreakLoop,
    /// Unwind to the innermost loop block and jump to `arg` (the loop head).
    ContinueLoop,

    // Generators
    /// Suspend the current generator frame, yielding the popped value.
    YieldValue,
    /// Delegate to the iterator under the sent value, yielding everything it
    /// yields; pushes the sub-iterator's return value when it completes.
    YieldFrom,

    /// Prefix: accumulate eight high-order bits into the next operand.
    ExtendedArg,
}

impl Opcode {
    /// Stack effect for opcodes whose effect does not depend on the operand.
    ///
    /// Operand-dependent opcodes (`CallFunction`, `BuildList`, `BuildTuple`,
    /// `Raise`) return `None` and are handled by the builder directly.
    #[must_use]
    pub fn stack_effect(self) -> Option<i32> {
        match self {
            Self::Nop
            | Self::DeleteLocal
            | Self::RotTwo
            | Self::RotThree
            | Self::Jump
            | Self::PopBlock
            | Self::PopExcept
            | Self::BreakLoop
            | Self::ContinueLoop
            | Self::GetIter
            | Self::ExtendedArg => Some(0),
            Self::PopTop
            | Self::StoreLocal
            | Self::StoreGlobal
            | Self::StoreDeref
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::ReturnValue
            | Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryFloorDiv
            | Self::BinaryMod
            | Self::CompareOp
            | Self::EndFinally
            | Self::YieldFrom => Some(-1),
            Self::DupTop
            | Self::LoadConst
            | Self::LoadLocal
            | Self::LoadGlobal
            | Self::LoadDeref
            | Self::LoadClosure
            | Self::ForIter => Some(1),
            // A yield pops the value and resumption pushes the sent result.
            Self::UnaryNeg | Self::UnaryNot | Self::UnaryInvert | Self::MakeClosure | Self::YieldValue => Some(0),
            // Handler entry pushes the (traceback, value, type) triple; the
            // builder reserves for that explicitly.
            Self::SetupLoop | Self::SetupExcept | Self::SetupFinally => Some(0),
            Self::CallFunction | Self::BuildList | Self::BuildTuple | Self::Raise => None,
        }
    }
}

/// Operand of [`Opcode::CompareOp`].
///
/// Relational kinds dispatch through dynamic-type comparison; `In`/`NotIn`
/// use container membership, `Is`/`IsNot` compare identity without touching
/// the heap, and `ExcMatch` implements handler-filter matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompareKind {
    Lt = 0,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExcMatch,
}

impl CompareKind {
    /// The operator text used in error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::ExcMatch => "exception match",
        }
    }
}
