//! The tagged value type manipulated by every opcode handler.
//!
//! A [`Value`] is one machine word of payload plus a discriminant: immediate
//! kinds (small integer, boolean, none, the unbound sentinel, interned
//! strings, function and native-function references, builtin exception
//! classes) are decoded without touching the heap, and `Ref` carries a
//! [`HeapId`] into the arena. Classification is a branch on the discriminant,
//! never a dereference.
//!
//! `Value` is `Copy`: copies are plain words, and liveness across a
//! collection point is the job of the handle stack and the VM's own stack
//! and frame roots, not of the value itself (see `handle.rs`).

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, IntoStaticStr};

use crate::{
    exceptions::ExcType,
    heap::{Heap, HeapData, HeapId},
    intern::{FunctionId, Interns, StringId},
    resource::ResourceTracker,
};

/// Primary value type representing runtime objects.
///
/// Immediate values are stored inline; everything else lives in the heap
/// arena and is referenced via `Ref(HeapId)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum Value {
    /// The `None` singleton.
    None,
    /// Sentinel for unbound local slots and deleted names.
    ///
    /// Never escapes to user code: loading an unbound local raises
    /// `UnboundLocalError` instead of producing this value.
    Unbound,
    /// Returned by comparison dispatch to signal an unsupported pairing.
    NotImplemented,
    Bool(bool),
    Int(i64),
    /// An interned string literal; the text lives in the session's `Interns`.
    InternString(StringId),
    /// A plain function (no captured variables). Closures live on the heap.
    Function(FunctionId),
    /// A native function provided by the runtime.
    Native(NativeFn),
    /// A builtin exception class, usable as a handler filter or constructor.
    ExcClass(ExcType),
    /// Reference into the heap arena.
    Ref(HeapId),
}

/// Native functions callable from bytecode.
///
/// Natives receive the executing VM (the logical thread) and their argument
/// count; they return a value or signal an exception through the error
/// channel. They never block: host I/O goes through the `PrintWriter`
/// supplied by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, IntoStaticStr, Serialize, Deserialize)]
pub enum NativeFn {
    /// `print(*args)` - writes through the host `PrintWriter`.
    Print,
    /// `len(obj)`.
    Len,
    /// `iter(obj)`.
    Iter,
    /// `next(iterator)` - resumes generators through the frame-splice path.
    Next,
    /// `repr(obj)`.
    Repr,
}

impl Value {
    /// True when this value is a heap reference.
    #[inline]
    pub fn is_heap_ref(self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// Identity comparison (`is`): immediates compare by bits, heap
    /// references by arena id. Never touches the heap.
    #[inline]
    pub fn is_identical(self, other: Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Unbound, Self::Unbound) | (Self::NotImplemented, Self::NotImplemented) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::InternString(a), Self::InternString(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Native(a), Self::Native(b)) => a == b,
            (Self::ExcClass(a), Self::ExcClass(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Truthiness following Python semantics: zero, empty containers and
    /// `None` are false, everything else true.
    pub fn truthy<T: ResourceTracker>(self, heap: &Heap<T>, interns: &Interns) -> bool {
        match self {
            Self::None | Self::Unbound => false,
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::InternString(id) => !interns.get_str(id).is_empty(),
            Self::NotImplemented | Self::Function(_) | Self::Native(_) | Self::ExcClass(_) => true,
            Self::Ref(id) => match heap.get(id) {
                HeapData::LongInt(n) => !n.is_zero(),
                HeapData::Str(s) => !s.as_str().is_empty(),
                HeapData::Tuple(t) => !t.items().is_empty(),
                HeapData::List(l) => !l.items().is_empty(),
                HeapData::Dict(d) => !d.is_empty(),
                HeapData::Cell(_)
                | HeapData::Closure(_)
                | HeapData::SeqIter(_)
                | HeapData::Generator(_)
                | HeapData::Exception(_) => true,
            },
        }
    }

    /// The Python-style type name, for error messages.
    pub fn type_name<T: ResourceTracker>(self, heap: &Heap<T>) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Unbound => "unbound",
            Self::NotImplemented => "NotImplementedType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::InternString(_) => "str",
            Self::Function(_) => "function",
            Self::Native(_) => "builtin_function_or_method",
            Self::ExcClass(_) => "type",
            Self::Ref(id) => heap.get(id).layout().py_name(),
        }
    }

    /// Renders the value the way `repr()` would.
    pub fn py_repr<T: ResourceTracker>(self, heap: &Heap<T>, interns: &Interns) -> String {
        let mut out = String::new();
        self.repr_into(heap, interns, &mut out);
        out
    }

    /// Renders the value the way `str()` would: strings are unquoted,
    /// everything else matches `repr()`.
    pub fn py_str<T: ResourceTracker>(self, heap: &Heap<T>, interns: &Interns) -> String {
        match self {
            Self::InternString(id) => interns.get_str(id).to_owned(),
            Self::Ref(id) => {
                if let HeapData::Str(s) = heap.get(id) {
                    return s.as_str().to_owned();
                }
                self.py_repr(heap, interns)
            }
            _ => self.py_repr(heap, interns),
        }
    }

    fn repr_into<T: ResourceTracker>(self, heap: &Heap<T>, interns: &Interns, out: &mut String) {
        match self {
            Self::None => out.push_str("None"),
            Self::Unbound => out.push_str("<unbound>"),
            Self::NotImplemented => out.push_str("NotImplemented"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::InternString(id) => str_repr_into(interns.get_str(id), out),
            Self::Function(id) => {
                let name = interns.get_str(interns.get_function(id).name_id);
                let _ = write!(out, "<function {name}>");
            }
            Self::Native(nf) => {
                let _ = write!(out, "<built-in function {nf}>");
            }
            Self::ExcClass(et) => {
                let _ = write!(out, "<class '{et}'>");
            }
            Self::Ref(id) => match heap.get(id) {
                HeapData::LongInt(n) => {
                    let _ = write!(out, "{n}");
                }
                HeapData::Str(s) => str_repr_into(s.as_str(), out),
                HeapData::Tuple(t) => {
                    out.push('(');
                    for (i, item) in t.items().iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        item.repr_into(heap, interns, out);
                    }
                    if t.items().len() == 1 {
                        out.push(',');
                    }
                    out.push(')');
                }
                HeapData::List(l) => {
                    out.push('[');
                    for (i, item) in l.items().iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        item.repr_into(heap, interns, out);
                    }
                    out.push(']');
                }
                HeapData::Dict(d) => {
                    out.push('{');
                    for (i, (key, value)) in d.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        key.repr_into(heap, interns, out);
                        out.push_str(": ");
                        value.repr_into(heap, interns, out);
                    }
                    out.push('}');
                }
                HeapData::Cell(_) => out.push_str("<cell>"),
                HeapData::Closure(c) => {
                    let name = interns.get_str(interns.get_function(c.func_id).name_id);
                    let _ = write!(out, "<function {name}>");
                }
                HeapData::SeqIter(_) => out.push_str("<iterator>"),
                HeapData::Generator(g) => {
                    let name = interns.get_str(interns.get_function(g.func_id).name_id);
                    let _ = write!(out, "<generator object {name}>");
                }
                HeapData::Exception(exc) => {
                    let _ = write!(out, "{}(", exc.exc_type());
                    if let Some(msg) = exc.message() {
                        str_repr_into(msg, out);
                    }
                    out.push(')');
                }
            },
        }
    }
}

/// Writes a Python-style single-quoted string repr.
fn str_repr_into(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn immediates_classify_without_heap_access() {
        assert!(!Value::Int(7).is_heap_ref());
        assert!(!Value::Bool(true).is_heap_ref());
        assert!(Value::Int(3).is_identical(Value::Int(3)));
        assert!(!Value::Int(3).is_identical(Value::Bool(true)));
    }

    #[test]
    fn truthiness_of_immediates() {
        let heap: Heap<NoLimitTracker> = Heap::new(NoLimitTracker);
        let interns = Interns::new();
        assert!(!Value::None.truthy(&heap, &interns));
        assert!(!Value::Int(0).truthy(&heap, &interns));
        assert!(Value::Int(-1).truthy(&heap, &interns));
        assert!(!Value::Bool(false).truthy(&heap, &interns));
    }

    #[test]
    fn repr_of_immediates() {
        let heap: Heap<NoLimitTracker> = Heap::new(NoLimitTracker);
        let interns = Interns::new();
        assert_eq!(Value::Int(42).py_repr(&heap, &interns), "42");
        assert_eq!(Value::Bool(true).py_repr(&heap, &interns), "True");
        assert_eq!(Value::None.py_repr(&heap, &interns), "None");
    }
}
