//! Resource limits for sandboxed execution.
//!
//! The heap and the VM consult a [`ResourceTracker`] before the operation
//! that would exceed a limit, never after: call-frame pushes check recursion
//! depth and value-stack headroom up front, and allocations check count and
//! memory budgets before touching the arena. With [`NoLimitTracker`] every
//! check is an inlined no-op that compiles away.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::exceptions::{ExcType, ExceptionRaise, RunError, SimpleException};

/// Default maximum call-frame depth, matching CPython's recursion limit.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Default maximum number of value-stack slots per thread.
pub const DEFAULT_MAX_VALUE_STACK: usize = 64 * 1024;

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone)]
pub enum ResourceError {
    /// Maximum number of heap allocations exceeded.
    Allocation {
        /// Configured allocation budget.
        limit: usize,
        /// Allocations performed so far.
        count: usize,
    },
    /// Maximum executed instruction count exceeded.
    Operation {
        /// Configured instruction budget.
        limit: usize,
        /// Instructions executed so far.
        count: usize,
    },
    /// Maximum execution time exceeded.
    Time {
        /// Configured wall-clock budget.
        limit: Duration,
        /// Time elapsed so far.
        elapsed: Duration,
    },
    /// Maximum estimated heap memory exceeded.
    Memory {
        /// Configured memory budget in bytes.
        limit: usize,
        /// Estimated bytes in use.
        used: usize,
    },
    /// Maximum call-frame recursion depth exceeded.
    Recursion {
        /// Configured frame-depth budget.
        limit: usize,
        /// Frame depth the call would have reached.
        depth: usize,
    },
    /// Maximum value-stack slots exceeded.
    StackSlots {
        /// Configured slot budget.
        limit: usize,
        /// Slot count the operation would have reached.
        needed: usize,
    },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Operation { limit, count } => {
                write!(f, "operation limit exceeded: {count} > {limit}")
            }
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::Recursion { .. } => {
                write!(f, "maximum recursion depth exceeded")
            }
            Self::StackSlots { limit, needed } => {
                write!(f, "value stack exhausted: {needed} slots > {limit}")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    /// Converts a resource error into the error channel.
    ///
    /// Stack and memory exhaustion are recoverable raised exceptions
    /// (`RecursionError` / `MemoryError`): they are detected before the
    /// operation that would exceed the limit, so the interpreter state is
    /// intact and handler blocks may claim them. Instruction and time budgets
    /// exist to bound hostile code and are not claimable.
    fn from(err: ResourceError) -> Self {
        let msg = err.to_string();
        match err {
            ResourceError::Recursion { .. } | ResourceError::StackSlots { .. } => {
                Self::Exc(Box::new(ExceptionRaise::new(SimpleException::new_msg(
                    ExcType::RecursionError,
                    msg,
                ))))
            }
            ResourceError::Allocation { .. } | ResourceError::Memory { .. } => Self::Exc(Box::new(
                ExceptionRaise::new(SimpleException::new_msg(ExcType::MemoryError, msg)),
            )),
            ResourceError::Operation { .. } | ResourceError::Time { .. } => Self::Uncatchable(Box::new(
                ExceptionRaise::new(SimpleException::new_msg(ExcType::TimeoutError, msg)),
            )),
        }
    }
}

/// Configurable execution limits applied by [`LimitedTracker`].
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of heap allocations, if any.
    pub max_allocations: Option<usize>,
    /// Maximum estimated heap memory in bytes, if any.
    pub max_memory: Option<usize>,
    /// Maximum number of executed instructions, if any.
    pub max_operations: Option<usize>,
    /// Maximum wall-clock execution time, if any.
    pub max_duration: Option<Duration>,
    /// Maximum call-frame depth.
    pub max_recursion_depth: usize,
    /// Maximum value-stack slots.
    pub max_value_stack: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_allocations: None,
            max_memory: None,
            max_operations: None,
            max_duration: None,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_value_stack: DEFAULT_MAX_VALUE_STACK,
        }
    }
}

/// Tracks resource consumption during execution.
///
/// Implementations must be cheap: the VM calls `check_operation` on every
/// instruction and `check_recursion`/`check_stack_slots` on every call.
pub trait ResourceTracker {
    /// Records a heap allocation of an estimated size, checking budgets.
    fn track_allocation(&mut self, bytes: usize) -> Result<(), ResourceError>;

    /// Records a heap free of an estimated size.
    fn track_free(&mut self, bytes: usize);

    /// Checks instruction-count and wall-clock budgets. Called per instruction.
    fn check_operation(&mut self) -> Result<(), ResourceError>;

    /// Checks that a call reaching `depth` frames is within the recursion limit.
    fn check_recursion(&self, depth: usize) -> Result<(), ResourceError>;

    /// Checks that growing the value stack to `needed` slots is permitted.
    fn check_stack_slots(&self, needed: usize) -> Result<(), ResourceError>;
}

/// Tracker that applies [`ResourceLimits`].
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    allocations: usize,
    memory_used: usize,
    operations: usize,
    started: Instant,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocations: 0,
            memory_used: 0,
            operations: 0,
            started: Instant::now(),
        }
    }

    /// Number of allocations performed so far.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Estimated bytes currently in use.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }
}

impl ResourceTracker for LimitedTracker {
    fn track_allocation(&mut self, bytes: usize) -> Result<(), ResourceError> {
        self.allocations += 1;
        if let Some(limit) = self.limits.max_allocations
            && self.allocations > limit
        {
            return Err(ResourceError::Allocation {
                limit,
                count: self.allocations,
            });
        }
        self.memory_used = self.memory_used.saturating_add(bytes);
        if let Some(limit) = self.limits.max_memory
            && self.memory_used > limit
        {
            return Err(ResourceError::Memory {
                limit,
                used: self.memory_used,
            });
        }
        Ok(())
    }

    fn track_free(&mut self, bytes: usize) {
        self.memory_used = self.memory_used.saturating_sub(bytes);
    }

    fn check_operation(&mut self) -> Result<(), ResourceError> {
        self.operations += 1;
        if let Some(limit) = self.limits.max_operations
            && self.operations > limit
        {
            return Err(ResourceError::Operation {
                limit,
                count: self.operations,
            });
        }
        // Checking the clock on every instruction would dominate execution
        // time, so only sample it every 1024 operations.
        if let Some(limit) = self.limits.max_duration
            && self.operations.is_multiple_of(1024)
        {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion(&self, depth: usize) -> Result<(), ResourceError> {
        if depth > self.limits.max_recursion_depth {
            return Err(ResourceError::Recursion {
                limit: self.limits.max_recursion_depth,
                depth,
            });
        }
        Ok(())
    }

    fn check_stack_slots(&self, needed: usize) -> Result<(), ResourceError> {
        if needed > self.limits.max_value_stack {
            return Err(ResourceError::StackSlots {
                limit: self.limits.max_value_stack,
                needed,
            });
        }
        Ok(())
    }
}

/// Tracker that enforces nothing beyond a sanity recursion bound.
///
/// The recursion and stack-slot checks keep their defaults so runaway
/// recursion still surfaces as `RecursionError` instead of exhausting the
/// process; everything else is unbounded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn track_allocation(&mut self, _bytes: usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn track_free(&mut self, _bytes: usize) {}

    #[inline]
    fn check_operation(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion(&self, depth: usize) -> Result<(), ResourceError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth,
            });
        }
        Ok(())
    }

    #[inline]
    fn check_stack_slots(&self, needed: usize) -> Result<(), ResourceError> {
        if needed > DEFAULT_MAX_VALUE_STACK {
            return Err(ResourceError::StackSlots {
                limit: DEFAULT_MAX_VALUE_STACK,
                needed,
            });
        }
        Ok(())
    }
}
