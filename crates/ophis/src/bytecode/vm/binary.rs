//! Unary and binary arithmetic.
//!
//! Small-integer arithmetic runs on `i64` immediates and detects overflow,
//! promoting to the heap-allocated arbitrary-precision representation
//! instead of wrapping. Results are demoted back to immediates whenever
//! they fit.

use num_integer::Integer;

use super::Vm;
use crate::{
    exceptions::{ExcType, RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{List, LongInt, Str, Tuple},
    value::Value,
};

/// A numeric operand widened for slow-path arithmetic.
enum Wide {
    Int(i64),
    Long(LongInt),
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    /// Widens a value for big-integer arithmetic, or returns `None` when the
    /// value is not an integer.
    fn widen(&self, value: Value) -> Option<Wide> {
        match value {
            Value::Int(i) => Some(Wide::Int(i)),
            Value::Bool(b) => Some(Wide::Int(i64::from(b))),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::LongInt(n) => Some(Wide::Long(n.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    fn long_of(wide: Wide) -> LongInt {
        match wide {
            Wide::Int(i) => LongInt::from(i),
            Wide::Long(n) => n,
        }
    }

    fn binary_type_error(&self, op: &'static str, lhs: Value, rhs: Value) -> RunError {
        ExcType::type_error(format!(
            "unsupported operand type(s) for {op}: '{}' and '{}'",
            lhs.type_name(self.heap),
            rhs.type_name(self.heap)
        ))
    }

    /// Reads string content from either an interned or heap string.
    fn str_content(&self, value: Value) -> Option<&str> {
        match value {
            Value::InternString(id) => Some(self.interns.get_str(id)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    pub(super) fn binary_add(&mut self) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();

        // Hot path: small-integer addition with overflow promotion.
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            let result = match a.checked_add(b) {
                Some(v) => Value::Int(v),
                None => (LongInt::from(a) + LongInt::from(b)).into_value(self.heap)?,
            };
            self.push(result);
            return Ok(());
        }

        if let (Some(a), Some(b)) = (self.widen(lhs), self.widen(rhs)) {
            let result = (Self::long_of(a) + Self::long_of(b)).into_value(self.heap)?;
            self.push(result);
            return Ok(());
        }

        // String concatenation.
        if let (Some(a), Some(b)) = (self.str_content(lhs), self.str_content(rhs)) {
            let joined = format!("{a}{b}");
            let id = self.heap.allocate(HeapData::Str(Str::new(joined)))?;
            self.push(Value::Ref(id));
            return Ok(());
        }

        // Sequence concatenation.
        if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
            match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::List(x), HeapData::List(y)) => {
                    let mut items = x.items().to_vec();
                    items.extend_from_slice(y.items());
                    let id = self.heap.allocate(HeapData::List(List::new(items)))?;
                    self.push(Value::Ref(id));
                    return Ok(());
                }
                (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                    let mut items = x.items().to_vec();
                    items.extend_from_slice(y.items());
                    let id = self.heap.allocate(HeapData::Tuple(Tuple::new(items)))?;
                    self.push(Value::Ref(id));
                    return Ok(());
                }
                _ => {}
            }
        }

        Err(self.binary_type_error("+", lhs, rhs))
    }

    pub(super) fn binary_sub(&mut self) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            let result = match a.checked_sub(b) {
                Some(v) => Value::Int(v),
                None => (LongInt::from(a) - LongInt::from(b)).into_value(self.heap)?,
            };
            self.push(result);
            return Ok(());
        }
        if let (Some(a), Some(b)) = (self.widen(lhs), self.widen(rhs)) {
            let result = (Self::long_of(a) - Self::long_of(b)).into_value(self.heap)?;
            self.push(result);
            return Ok(());
        }
        Err(self.binary_type_error("-", lhs, rhs))
    }

    pub(super) fn binary_mul(&mut self) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            let result = match a.checked_mul(b) {
                Some(v) => Value::Int(v),
                None => (LongInt::from(a) * LongInt::from(b)).into_value(self.heap)?,
            };
            self.push(result);
            return Ok(());
        }
        if let (Some(a), Some(b)) = (self.widen(lhs), self.widen(rhs)) {
            let result = (Self::long_of(a) * Self::long_of(b)).into_value(self.heap)?;
            self.push(result);
            return Ok(());
        }
        Err(self.binary_type_error("*", lhs, rhs))
    }

    pub(super) fn binary_floordiv(&mut self) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            // i64::MIN // -1 is the single overflowing pair.
            let result = match a.checked_div_euclid(b) {
                Some(_) => Value::Int(a.div_floor(&b)),
                None => LongInt::from(a).div_floor(&LongInt::from(b)).into_value(self.heap)?,
            };
            self.push(result);
            return Ok(());
        }
        if let (Some(a), Some(b)) = (self.widen(lhs), self.widen(rhs)) {
            let b = Self::long_of(b);
            if b.is_zero() {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let result = Self::long_of(a).div_floor(&b).into_value(self.heap)?;
            self.push(result);
            return Ok(());
        }
        Err(self.binary_type_error("//", lhs, rhs))
    }

    pub(super) fn binary_mod(&mut self) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            self.push(Value::Int(a.mod_floor(&b)));
            return Ok(());
        }
        if let (Some(a), Some(b)) = (self.widen(lhs), self.widen(rhs)) {
            let b = Self::long_of(b);
            if b.is_zero() {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let result = Self::long_of(a).mod_floor(&b).into_value(self.heap)?;
            self.push(result);
            return Ok(());
        }
        Err(self.binary_type_error("%", lhs, rhs))
    }

    pub(super) fn unary_neg(&mut self) -> RunResult<()> {
        let value = self.pop();
        match value {
            Value::Int(i) => {
                let result = match i.checked_neg() {
                    Some(v) => Value::Int(v),
                    None => (-LongInt::from(i)).into_value(self.heap)?,
                };
                self.push(result);
                Ok(())
            }
            Value::Bool(b) => {
                self.push(Value::Int(-i64::from(b)));
                Ok(())
            }
            Value::Ref(id) => {
                if let HeapData::LongInt(n) = self.heap.get(id) {
                    let result = (-n.clone()).into_value(self.heap)?;
                    self.push(result);
                    return Ok(());
                }
                Err(ExcType::type_error(format!(
                    "bad operand type for unary -: '{}'",
                    value.type_name(self.heap)
                )))
            }
            _ => Err(ExcType::type_error(format!(
                "bad operand type for unary -: '{}'",
                value.type_name(self.heap)
            ))),
        }
    }

    pub(super) fn unary_not(&mut self) -> RunResult<()> {
        let value = self.pop();
        let truthy = value.truthy(self.heap, self.interns);
        self.push(Value::Bool(!truthy));
        Ok(())
    }

    pub(super) fn unary_invert(&mut self) -> RunResult<()> {
        let value = self.pop();
        match value {
            // ~x == -x - 1; only i64::MIN needs promotion.
            Value::Int(i) => {
                let result = match i.checked_neg().and_then(|n| n.checked_sub(1)) {
                    Some(v) => Value::Int(v),
                    None => (-(LongInt::from(i) + LongInt::from(1))).into_value(self.heap)?,
                };
                self.push(result);
                Ok(())
            }
            Value::Bool(b) => {
                self.push(Value::Int(-i64::from(b) - 1));
                Ok(())
            }
            Value::Ref(id) => {
                if let HeapData::LongInt(n) = self.heap.get(id) {
                    let result = (-(n.clone() + LongInt::from(1))).into_value(self.heap)?;
                    self.push(result);
                    return Ok(());
                }
                Err(ExcType::type_error(format!(
                    "bad operand type for unary ~: '{}'",
                    value.type_name(self.heap)
                )))
            }
            _ => Err(ExcType::type_error(format!(
                "bad operand type for unary ~: '{}'",
                value.type_name(self.heap)
            ))),
        }
    }
}
