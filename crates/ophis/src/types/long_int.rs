//! LongInt wrapper for arbitrary precision integer support.
//!
//! There is one integer type at the language level; the runtime uses
//! `Value::Int(i64)` while values fit and promotes to a heap-allocated
//! `LongInt` on overflow. The `into_value()` method demotes back to i64
//! whenever the result fits, keeping arithmetic on the immediate fast path.

use std::fmt::{self, Display};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

use crate::{
    heap::{Heap, HeapData},
    resource::{ResourceError, ResourceTracker},
    value::Value,
};

/// Wrapper around `num_bigint::BigInt` for arbitrary precision integers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct LongInt(pub BigInt);

impl LongInt {
    pub fn new(bi: BigInt) -> Self {
        Self(bi)
    }

    /// Converts to a `Value`, demoting to i64 if it fits.
    pub fn into_value<T: ResourceTracker>(self, heap: &mut Heap<T>) -> Result<Value, ResourceError> {
        if let Some(i) = self.0.to_i64() {
            Ok(Value::Int(i))
        } else {
            let heap_id = heap.allocate(HeapData::LongInt(self))?;
            Ok(Value::Ref(heap_id))
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Floor division, matching Python `//` semantics for negatives.
    pub fn div_floor(&self, rhs: &Self) -> Self {
        Self(self.0.div_floor(&rhs.0))
    }

    /// Modulo with the sign of the divisor, matching Python `%`.
    pub fn mod_floor(&self, rhs: &Self) -> Self {
        Self(self.0.mod_floor(&rhs.0))
    }

    /// Estimated memory size in bytes, for resource tracking.
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.bits().div_ceil(8) as usize
    }
}

impl From<i64> for LongInt {
    fn from(i: i64) -> Self {
        Self(BigInt::from(i))
    }
}

impl std::ops::Add for LongInt {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::Sub for LongInt {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::Mul for LongInt {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self(self.0 * rhs.0)
    }
}

impl std::ops::Neg for LongInt {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl Display for LongInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
