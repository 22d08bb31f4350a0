//! Exception types and the error channel threaded through the interpreter.
//!
//! Raised exceptions travel as [`RunError`] through `Result` returns rather
//! than through hidden global state: every opcode handler and native function
//! returns `RunResult<T>`, and the VM's unwinding machinery decides whether a
//! pending error is claimed by a handler block or propagates to the caller
//! frame. [`Exception`] is the public, fully rendered form handed to the
//! embedder when nothing claimed the error.

use std::fmt::{self, Display, Write};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::{intern::StringId, value::Value};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Builtin exception types raised by the runtime core.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// Primary exception class - matches any standard exception in handler checks.
    Exception,

    /// Root of the exception hierarchy.
    BaseException,
    /// Raised into a generator when its `close()` method is called.
    /// Inherits from BaseException, not Exception.
    GeneratorExit,

    // --- ArithmeticError hierarchy ---
    /// Intermediate class for arithmetic errors.
    ArithmeticError,
    /// Subclass of ArithmeticError.
    OverflowError,
    /// Subclass of ArithmeticError.
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    /// Intermediate class for lookup errors.
    LookupError,
    /// Subclass of LookupError.
    IndexError,
    /// Subclass of LookupError.
    KeyError,

    // --- RuntimeError hierarchy ---
    /// Intermediate class for runtime errors.
    RuntimeError,
    /// Subclass of RuntimeError, raised when a resource limit is exceeded.
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    /// Subclass of NameError - for accessing a local variable before assignment.
    UnboundLocalError,

    // --- Standalone exception types ---
    AttributeError,
    MemoryError,
    StopIteration,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Implements the builtin exception hierarchy for handler matching:
    /// - `BaseException` catches everything
    /// - `Exception` catches everything except `BaseException` and `GeneratorExit`
    /// - `LookupError` is the base for `KeyError` and `IndexError`
    /// - `ArithmeticError` is the base for `ZeroDivisionError` and `OverflowError`
    /// - `RuntimeError` is the base for `RecursionError`
    /// - `NameError` is the base for `UnboundLocalError`
    ///
    /// Returns true if `self` would be caught by a handler for `handler_type`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit),
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::RuntimeError => matches!(self, Self::RecursionError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            _ => false,
        }
    }
}

/// A lightweight raised exception: type, optional message, chaining links.
///
/// For `StopIteration`, `payload` carries the generator's return value so it
/// can be recovered at a delegation site without string round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    message: Option<String>,
    /// Exception value payload (currently only used by `StopIteration`).
    payload: Option<Value>,
    /// Explicit chain set by `raise X from Y`.
    cause: Option<Box<SimpleException>>,
    /// Implicit chain: the exception being handled when this one was raised.
    context: Option<Box<SimpleException>>,
    /// True when `raise ... from ...` suppressed the implicit context.
    suppress_context: bool,
}

impl SimpleException {
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            message,
            payload: None,
            cause: None,
            context: None,
            suppress_context: false,
        }
    }

    pub fn new_msg(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self::new(exc_type, Some(message.into()))
    }

    pub fn new_none(exc_type: ExcType) -> Self {
        Self::new(exc_type, None)
    }

    /// Creates a `StopIteration` carrying a generator return value.
    pub fn stop_iteration(payload: Value) -> Self {
        let mut exc = Self::new_none(ExcType::StopIteration);
        if !matches!(payload, Value::None) {
            exc.payload = Some(payload);
        }
        exc
    }

    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the `StopIteration` payload, defaulting to none.
    pub fn take_payload(&self) -> Value {
        self.payload.unwrap_or(Value::None)
    }

    pub fn payload(&self) -> Option<Value> {
        self.payload
    }

    pub fn set_cause(&mut self, cause: Option<SimpleException>) {
        self.cause = cause.map(Box::new);
        self.suppress_context = true;
    }

    pub fn set_context(&mut self, context: SimpleException) {
        if self.context.is_none() && !self.suppress_context {
            self.context = Some(Box::new(context));
        }
    }

    pub fn cause(&self) -> Option<&SimpleException> {
        self.cause.as_deref()
    }

    pub fn context(&self) -> Option<&SimpleException> {
        if self.suppress_context {
            None
        } else {
            self.context.as_deref()
        }
    }
}

impl Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.exc_type, msg),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

/// One traceback frame captured while an exception propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RawStackFrame {
    /// Name of the executing function (`<module>` for module-level code).
    pub name_id: StringId,
    /// Bytecode offset of the faulting instruction.
    pub ip: usize,
}

/// A raised exception in flight, with traceback frames accumulated while
/// unwinding (innermost first).
#[derive(Debug, Clone)]
pub(crate) struct ExceptionRaise {
    pub exc: SimpleException,
    pub frames: Vec<RawStackFrame>,
    /// The heap value this exception was raised from, if any.
    ///
    /// Preserved so that catching and re-raising keeps exception identity:
    /// the handler sees the same heap object the `raise` popped.
    pub original_value: Option<Value>,
}

impl ExceptionRaise {
    pub fn new(exc: SimpleException) -> Self {
        Self {
            exc,
            frames: Vec::new(),
            original_value: None,
        }
    }

    /// Appends a caller frame to the traceback.
    pub fn add_caller_frame(&mut self, frame: RawStackFrame) {
        self.frames.push(frame);
    }
}

/// Error channel for bytecode execution.
///
/// `Exc` is a normal raised exception, claimable by handler blocks.
/// `Uncatchable` is a resource-limit violation the configuration marks as
/// non-claimable (it still collects a traceback). `Internal` is a fatal
/// internal-consistency failure (unknown opcode, corrupted frame invariant,
/// re-entrant generator resumption); it bypasses the block stack entirely and
/// aborts the embedding call with a diagnostic.
#[derive(Debug)]
pub(crate) enum RunError {
    Exc(Box<ExceptionRaise>),
    Uncatchable(Box<ExceptionRaise>),
    Internal(String),
}

impl RunError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_stop_iteration(&self) -> bool {
        matches!(self, Self::Exc(exc) if exc.exc.exc_type() == ExcType::StopIteration)
    }

    pub fn is_exception_type(&self, exc_type: ExcType) -> bool {
        matches!(self, Self::Exc(exc) if exc.exc.exc_type() == exc_type)
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(ExceptionRaise::new(exc)))
    }
}

impl From<Exception> for RunError {
    /// Re-enters the error channel from a host-surfaced exception (e.g. a
    /// `PrintWriter` failure).
    fn from(exc: Exception) -> Self {
        SimpleException::new(exc.exc_type, exc.message).into()
    }
}

impl ExcType {
    /// Raises this type with a message, as a `RunError`.
    pub(crate) fn raise(self, message: impl Into<String>) -> RunError {
        SimpleException::new_msg(self, message).into()
    }

    pub(crate) fn type_error(message: impl Into<String>) -> RunError {
        Self::TypeError.raise(message)
    }

    pub(crate) fn name_error(name: &str) -> RunError {
        Self::NameError.raise(format!("name '{name}' is not defined"))
    }

    pub(crate) fn unbound_local_error(name: &str) -> RunError {
        Self::UnboundLocalError.raise(format!(
            "cannot access local variable '{name}' where it is not associated with a value"
        ))
    }

    pub(crate) fn zero_division(message: &'static str) -> RunError {
        Self::ZeroDivisionError.raise(message)
    }

    pub(crate) fn stop_iteration_empty() -> RunError {
        SimpleException::new_none(Self::StopIteration).into()
    }

    /// PEP 479: a `StopIteration` escaping a generator body becomes RuntimeError.
    pub(crate) fn generator_raised_stop_iteration() -> RunError {
        Self::RuntimeError.raise("generator raised StopIteration")
    }
}

/// One rendered traceback frame of a public [`Exception`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Name of the function the frame was executing.
    pub function: String,
    /// Bytecode offset of the faulting instruction within that function.
    pub ip: usize,
}

/// A fully rendered uncaught exception, as surfaced to the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    /// Traceback frames, innermost first.
    frames: Vec<StackFrame>,
    /// Rendered `__cause__` / `__context__` chain, innermost link first.
    chain: Vec<(ChainKind, String)>,
}

/// How a chained exception relates to the one that followed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainKind {
    /// `raise X from Y` - Y is the direct cause.
    Cause,
    /// X was raised while handling Y.
    Context,
}

impl Exception {
    pub(crate) fn from_raise(raise: &ExceptionRaise, frame_name: impl Fn(StringId) -> String) -> Self {
        let mut chain = Vec::new();
        let mut current = &raise.exc;
        loop {
            if let Some(cause) = current.cause() {
                chain.push((ChainKind::Cause, cause.to_string()));
                current = cause;
            } else if let Some(context) = current.context() {
                chain.push((ChainKind::Context, context.to_string()));
                current = context;
            } else {
                break;
            }
        }
        Self {
            exc_type: raise.exc.exc_type(),
            message: raise.exc.message().map(ToOwned::to_owned),
            frames: raise
                .frames
                .iter()
                .map(|f| StackFrame {
                    function: frame_name(f.name_id),
                    ip: f.ip,
                })
                .collect(),
            chain,
        }
    }

    pub(crate) fn internal(msg: String) -> Self {
        Self {
            exc_type: ExcType::RuntimeError,
            message: Some(format!("internal interpreter error: {msg}")),
            frames: Vec::new(),
            chain: Vec::new(),
        }
    }

    /// The builtin exception type.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// The exception message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Traceback frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render outermost chain links first, like CPython's traceback output.
        for (kind, text) in self.chain.iter().rev() {
            writeln!(f, "{text}")?;
            match kind {
                ChainKind::Cause => {
                    writeln!(f, "\nThe above exception was the direct cause of the following exception:\n")?;
                }
                ChainKind::Context => {
                    writeln!(f, "\nDuring handling of the above exception, another exception occurred:\n")?;
                }
            }
        }
        if !self.frames.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in self.frames.iter().rev() {
                writeln!(f, "  Function {}, instruction {}", frame.function, frame.ip)?;
            }
        }
        let mut line = String::new();
        write!(line, "{}", self.exc_type)?;
        if let Some(msg) = &self.message {
            write!(line, ": {msg}")?;
        }
        write!(f, "{line}")
    }
}

impl std::error::Error for Exception {}
