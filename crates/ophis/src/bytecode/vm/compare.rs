//! Comparison dispatch.
//!
//! One opcode with an enumerated comparison-kind operand, dispatched
//! through the dynamic types of both operands: relational kinds order
//! numbers, strings and sequences; `In`/`NotIn` use container membership;
//! `Is`/`IsNot` compare identity without touching the heap; `ExcMatch`
//! implements except-clause filter matching.

use std::cmp::Ordering;

use num_bigint::BigInt;

use super::Vm;
use crate::{
    bytecode::op::CompareKind,
    exceptions::{ExcType, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::DictKey,
    value::Value,
};

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    pub(super) fn compare_op(&mut self, kind: CompareKind) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        let result = match kind {
            CompareKind::Is => lhs.is_identical(rhs),
            CompareKind::IsNot => !lhs.is_identical(rhs),
            CompareKind::Eq => self.value_eq(lhs, rhs),
            CompareKind::Ne => !self.value_eq(lhs, rhs),
            CompareKind::In => self.contains(rhs, lhs)?,
            CompareKind::NotIn => !self.contains(rhs, lhs)?,
            CompareKind::ExcMatch => self.check_exc_match(lhs, rhs)?,
            CompareKind::Lt | CompareKind::Le | CompareKind::Gt | CompareKind::Ge => {
                let Some(ordering) = self.try_order(lhs, rhs) else {
                    return Err(ExcType::type_error(format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        kind.symbol(),
                        lhs.type_name(self.heap),
                        rhs.type_name(self.heap)
                    )));
                };
                match kind {
                    CompareKind::Lt => ordering == Ordering::Less,
                    CompareKind::Le => ordering != Ordering::Greater,
                    CompareKind::Gt => ordering == Ordering::Greater,
                    CompareKind::Ge => ordering != Ordering::Less,
                    _ => unreachable!(),
                }
            }
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    /// Numeric view of a value for cross-representation comparison.
    fn as_bigint(&self, value: Value) -> Option<BigInt> {
        match value {
            Value::Int(i) => Some(BigInt::from(i)),
            Value::Bool(b) => Some(BigInt::from(i64::from(b))),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::LongInt(n) => Some(n.0.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn str_view(&self, value: Value) -> Option<&str> {
        match value {
            Value::InternString(id) => Some(self.interns.get_str(id)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Attempts a total order between two values of comparable types.
    fn try_order(&self, lhs: Value, rhs: Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_bigint(lhs), self.as_bigint(rhs)) {
            return Some(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (self.str_view(lhs), self.str_view(rhs)) {
            return Some(a.cmp(b));
        }
        if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
            let items = match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::List(x), HeapData::List(y)) => Some((x.items().to_vec(), y.items().to_vec())),
                (HeapData::Tuple(x), HeapData::Tuple(y)) => Some((x.items().to_vec(), y.items().to_vec())),
                _ => None,
            };
            if let Some((xs, ys)) = items {
                return self.order_sequences(&xs, &ys);
            }
        }
        None
    }

    /// Lexicographic ordering over sequence items.
    fn order_sequences(&self, xs: &[Value], ys: &[Value]) -> Option<Ordering> {
        for (&x, &y) in xs.iter().zip(ys.iter()) {
            if self.value_eq(x, y) {
                continue;
            }
            return self.try_order(x, y);
        }
        Some(xs.len().cmp(&ys.len()))
    }

    /// Deep equality across representations. Values of unrelated types are
    /// unequal rather than an error, per `==` semantics.
    pub(super) fn value_eq(&self, lhs: Value, rhs: Value) -> bool {
        if lhs.is_identical(rhs) {
            return true;
        }
        if let (Some(a), Some(b)) = (self.as_bigint(lhs), self.as_bigint(rhs)) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.str_view(lhs), self.str_view(rhs)) {
            return a == b;
        }
        if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
            let items = match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::List(x), HeapData::List(y)) => Some((x.items().to_vec(), y.items().to_vec())),
                (HeapData::Tuple(x), HeapData::Tuple(y)) => Some((x.items().to_vec(), y.items().to_vec())),
                _ => None,
            };
            if let Some((xs, ys)) = items {
                return xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(&x, &y)| self.value_eq(x, y));
            }
        }
        false
    }

    /// Membership test: `item in container`.
    fn contains(&self, container: Value, item: Value) -> RunResult<bool> {
        if let Some(haystack) = self.str_view(container) {
            let Some(needle) = self.str_view(item) else {
                return Err(ExcType::type_error(format!(
                    "'in <string>' requires string as left operand, not '{}'",
                    item.type_name(self.heap)
                )));
            };
            return Ok(haystack.contains(needle));
        }
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    return Ok(l.items().iter().any(|&v| self.value_eq(v, item)));
                }
                HeapData::Tuple(t) => {
                    return Ok(t.items().iter().any(|&v| self.value_eq(v, item)));
                }
                HeapData::Dict(_) => {
                    let key = DictKey::from_value(item, self.heap, self.interns)?;
                    let HeapData::Dict(d) = self.heap.get(id) else {
                        unreachable!()
                    };
                    return Ok(d.contains(&key));
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name(self.heap)
        )))
    }

    /// Except-clause filter matching: `exc` against a class or a tuple of
    /// classes. Anything else is an invalid filter.
    pub(super) fn check_exc_match(&self, exc: Value, filter: Value) -> RunResult<bool> {
        match filter {
            Value::ExcClass(handler_type) => {
                let exc_type = match exc {
                    Value::ExcClass(t) => Some(t),
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapData::Exception(e) => Some(e.exc_type()),
                        _ => None,
                    },
                    _ => None,
                };
                Ok(exc_type.is_some_and(|t| t.is_subclass_of(handler_type)))
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Tuple(t) => {
                    let filters = t.items().to_vec();
                    for f in filters {
                        if self.check_exc_match(exc, f)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(ExcType::type_error(
                    "catching classes that do not inherit from BaseException is not allowed",
                )),
            },
            _ => Err(ExcType::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }
}
