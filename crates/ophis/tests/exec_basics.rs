use ophis::{
    CodeBuilder, CompareKind, ExcType, Machine, NativeFn, NoopTracer, Object, Opcode,
    CollectStringPrint,
};
use pretty_assertions::assert_eq;

/// A code object that loads one constant and returns it must produce
/// exactly that constant.
#[test]
fn load_const_return() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let k = b.const_int(42);
    b.emit_arg(Opcode::LoadConst, k);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    assert_eq!(m.run_code(&code).unwrap(), Object::Int(42));
}

/// Repeated runs on the same machine leave no residue: the value stack is
/// rebuilt per entry and the heap stays stable once garbage is collected.
#[test]
fn repeated_runs_leave_no_residue() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let k = b.const_int(7);
    b.emit_arg(Opcode::LoadConst, k);
    b.emit_arg(Opcode::LoadConst, k);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    for _ in 0..50 {
        assert_eq!(m.run_code(&code).unwrap(), Object::Int(14));
    }
    m.collect();
    assert_eq!(m.heap_stats().live_objects, 0);
}

/// The concrete scenario from the dispatch contract: two constants added
/// and returned.
#[test]
fn binary_add_of_constants() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let a = b.const_int(1111);
    let c = b.const_int(2222);
    b.emit_arg(Opcode::LoadConst, a);
    b.emit_arg(Opcode::LoadConst, c);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    assert_eq!(m.run_code(&code).unwrap(), Object::Int(3333));
}

/// `ExtendedArg 1; LoadConst 1` against a 258-entry constant pool must
/// index constant 257.
#[test]
fn extended_arg_widens_operands() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    for i in 0..258 {
        b.const_int(i);
    }
    b.emit_arg(Opcode::LoadConst, 257);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    assert_eq!(m.run_code(&code).unwrap(), Object::Int(257));
}

/// Small-integer overflow promotes to the arbitrary-precision
/// representation instead of wrapping.
#[test]
fn integer_overflow_promotes_to_bigint() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let a = b.const_int(i64::MAX);
    let one = b.const_int(1);
    b.emit_arg(Opcode::LoadConst, a);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    match m.run_code(&code).unwrap() {
        Object::BigInt(n) => assert_eq!(n.to_string(), "9223372036854775808"),
        other => panic!("expected BigInt, got {other:?}"),
    }
}

/// Floor division and modulo follow floor semantics for negatives.
#[test]
fn floor_division_semantics() {
    let mut m = Machine::new();

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let a = b.const_int(-7);
    let c = b.const_int(2);
    b.emit_arg(Opcode::LoadConst, a);
    b.emit_arg(Opcode::LoadConst, c);
    b.emit(Opcode::BinaryFloorDiv);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(-4));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let a = b.const_int(-7);
    let c = b.const_int(2);
    b.emit_arg(Opcode::LoadConst, a);
    b.emit_arg(Opcode::LoadConst, c);
    b.emit(Opcode::BinaryMod);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(1));
}

/// Division by zero is a catchable ZeroDivisionError.
#[test]
fn division_by_zero_raises() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let a = b.const_int(1);
    let z = b.const_int(0);
    b.emit_arg(Opcode::LoadConst, a);
    b.emit_arg(Opcode::LoadConst, z);
    b.emit(Opcode::BinaryFloorDiv);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);
}

/// Calling a registered function reuses the pushed arguments as the
/// callee's local slots and restores the caller's stack on return.
#[test]
fn function_call_binds_arguments_as_locals() {
    let mut m = Machine::new();

    let a_name = m.intern("a");
    let b_name = m.intern("b");
    let mut fb = CodeBuilder::new(m.intern("add"));
    let a = fb.add_local(a_name);
    let b_slot = fb.add_local(b_name);
    fb.emit_arg(Opcode::LoadLocal, a);
    fb.emit_arg(Opcode::LoadLocal, b_slot);
    fb.emit(Opcode::BinaryAdd);
    fb.emit(Opcode::ReturnValue);
    let add = m.register_function("add", fb.build(2));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let f = b.const_function(add);
    let x = b.const_int(10);
    let y = b.const_int(20);
    b.emit_arg(Opcode::LoadConst, f);
    b.emit_arg(Opcode::LoadConst, x);
    b.emit_arg(Opcode::LoadConst, y);
    b.emit_arg(Opcode::CallFunction, 2);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(30));
}

/// Wrong arity is a TypeError raised before any frame state changes.
#[test]
fn arity_mismatch_raises_type_error() {
    let mut m = Machine::new();
    let x_name = m.intern("x");
    let mut fb = CodeBuilder::new(m.intern("one_arg"));
    let x = fb.add_local(x_name);
    fb.emit_arg(Opcode::LoadLocal, x);
    fb.emit(Opcode::ReturnValue);
    let f = m.register_function("one_arg", fb.build(1));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let fk = b.const_function(f);
    b.emit_arg(Opcode::LoadConst, fk);
    b.emit_arg(Opcode::CallFunction, 0);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
}

/// Recursion through a global binding: fib(10) = 55 exercises jumps,
/// comparison dispatch and nested frames.
#[test]
fn recursive_fibonacci() {
    let mut m = Machine::new();

    let n_name = m.intern("n");
    let fib_name = m.intern("fib");
    let mut fb = CodeBuilder::new(fib_name);
    let n = fb.add_local(n_name);
    let fib_global = fb.add_name(fib_name);
    let two = fb.const_int(2);
    let one = fb.const_int(1);

    fb.emit_arg(Opcode::LoadLocal, n);
    fb.emit_arg(Opcode::LoadConst, two);
    fb.emit_compare(CompareKind::Lt);
    let recurse = fb.emit_jump(Opcode::PopJumpIfFalse);
    fb.emit_arg(Opcode::LoadLocal, n);
    fb.emit(Opcode::ReturnValue);
    fb.patch_jump(recurse);
    fb.emit_arg(Opcode::LoadGlobal, fib_global);
    fb.emit_arg(Opcode::LoadLocal, n);
    fb.emit_arg(Opcode::LoadConst, one);
    fb.emit(Opcode::BinarySub);
    fb.emit_arg(Opcode::CallFunction, 1);
    fb.emit_arg(Opcode::LoadGlobal, fib_global);
    fb.emit_arg(Opcode::LoadLocal, n);
    fb.emit_arg(Opcode::LoadConst, two);
    fb.emit(Opcode::BinarySub);
    fb.emit_arg(Opcode::CallFunction, 1);
    fb.emit(Opcode::BinaryAdd);
    fb.emit(Opcode::ReturnValue);
    let fib = m.register_function("fib", fb.build(1));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let fib_global = b.add_name(fib_name);
    let fk = b.const_function(fib);
    let ten = b.const_int(10);
    b.emit_arg(Opcode::LoadConst, fk);
    b.emit_arg(Opcode::StoreGlobal, fib_global);
    b.emit_arg(Opcode::LoadGlobal, fib_global);
    b.emit_arg(Opcode::LoadConst, ten);
    b.emit_arg(Opcode::CallFunction, 1);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(55));
}

/// Iterating a list with ForIter accumulates every item.
#[test]
fn for_loop_over_list() {
    let mut m = Machine::new();
    let s_name = m.intern("s");
    let item_name = m.intern("item");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let s = b.add_local(s_name);
    let item = b.add_local(item_name);
    let zero = b.const_int(0);
    let one = b.const_int(1);
    let two = b.const_int(2);
    let three = b.const_int(3);

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreLocal, s);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit_arg(Opcode::LoadConst, three);
    b.emit_arg(Opcode::BuildList, 3);
    b.emit(Opcode::GetIter);
    let loop_start = b.offset();
    let end = b.emit_jump(Opcode::ForIter);
    b.emit_arg(Opcode::StoreLocal, item);
    b.emit_arg(Opcode::LoadLocal, s);
    b.emit_arg(Opcode::LoadLocal, item);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreLocal, s);
    b.emit_arg(Opcode::Jump, loop_start);
    b.patch_jump(end);
    b.emit_arg(Opcode::LoadLocal, s);
    b.emit(Opcode::ReturnValue);

    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(6));
}

/// Membership dispatches through the container's dynamic type.
#[test]
fn membership_compare() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let two = b.const_int(2);
    let one = b.const_int(1);
    let three = b.const_int(3);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit_arg(Opcode::LoadConst, three);
    b.emit_arg(Opcode::BuildTuple, 3);
    b.emit_compare(CompareKind::In);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Bool(true));
}

/// String concatenation and len().
#[test]
fn string_concat_and_len() {
    let mut m = Machine::new();
    let foo = m.intern("foo");
    let bar = m.intern("bar");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let len_k = b.const_native(NativeFn::Len);
    let foo_k = b.const_str(foo);
    let bar_k = b.const_str(bar);
    b.emit_arg(Opcode::LoadConst, len_k);
    b.emit_arg(Opcode::LoadConst, foo_k);
    b.emit_arg(Opcode::LoadConst, bar_k);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::CallFunction, 1);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(6));
}

/// print() routes through the host writer, separators and newline included.
#[test]
fn print_writes_through_host_writer() {
    let mut m = Machine::new();
    let two = m.intern("two");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let print_k = b.const_native(NativeFn::Print);
    let one_k = b.const_int(1);
    let two_k = b.const_str(two);
    let none_k = b.const_none();
    b.emit_arg(Opcode::LoadConst, print_k);
    b.emit_arg(Opcode::LoadConst, one_k);
    b.emit_arg(Opcode::LoadConst, two_k);
    b.emit_arg(Opcode::CallFunction, 2);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none_k);
    b.emit(Opcode::ReturnValue);
    let code = b.build(0);

    let mut out = CollectStringPrint::new();
    let result = m.run_code_with(&code, &mut out, &mut NoopTracer).unwrap();
    assert_eq!(result, Object::None);
    assert_eq!(out.output(), "1 two\n");
}

/// Loading a local before assignment raises UnboundLocalError; a missing
/// global raises NameError.
#[test]
fn unbound_names_raise() {
    let mut m = Machine::new();
    let x_name = m.intern("x");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let x = b.add_local(x_name);
    b.emit_arg(Opcode::LoadLocal, x);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::UnboundLocalError);

    let missing = m.intern("missing");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let name = b.add_name(missing);
    b.emit_arg(Opcode::LoadGlobal, name);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::NameError);
    assert_eq!(err.message(), Some("name 'missing' is not defined"));
}

/// Closures: an inner function reads and writes an enclosing cell.
#[test]
fn closures_share_cells() {
    let mut m = Machine::new();

    // inner(): return x + 1   (x is a free variable)
    let x_name = m.intern("x");
    let mut ib = CodeBuilder::new(m.intern("inner"));
    let x_deref = ib.add_freevar(x_name);
    let one = ib.const_int(1);
    ib.emit_arg(Opcode::LoadDeref, x_deref);
    ib.emit_arg(Opcode::LoadConst, one);
    ib.emit(Opcode::BinaryAdd);
    ib.emit(Opcode::ReturnValue);
    let inner = m.register_function("inner", ib.build(0));

    // outer(): x = 41; f = closure(inner, (cell x,)); return f()
    let mut ob = CodeBuilder::new(m.intern("outer"));
    let x_cell = ob.add_cellvar(x_name);
    let val = ob.const_int(41);
    let inner_k = ob.const_function(inner);
    ob.emit_arg(Opcode::LoadConst, val);
    ob.emit_arg(Opcode::StoreDeref, x_cell);
    ob.emit_arg(Opcode::LoadClosure, x_cell);
    ob.emit_arg(Opcode::BuildTuple, 1);
    ob.emit_arg(Opcode::MakeClosure, inner_k);
    ob.emit_arg(Opcode::CallFunction, 0);
    ob.emit(Opcode::ReturnValue);
    let outer = m.register_function("outer", ob.build(0));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let outer_k = b.const_function(outer);
    b.emit_arg(Opcode::LoadConst, outer_k);
    b.emit_arg(Opcode::CallFunction, 0);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(42));
}

/// A corrupted code object (constant index past the pool) is a fatal
/// internal failure that bypasses handler blocks, not a no-op.
#[test]
fn corrupted_code_object_aborts() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("<module>"));
    b.emit_arg(Opcode::LoadConst, 99);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().unwrap().contains("internal interpreter error"));
}
