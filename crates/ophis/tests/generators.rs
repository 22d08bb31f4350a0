use ophis::{
    CallOutcome, CodeBuilder, CompareKind, ExcType, GenStep, GeneratorStatus, HandleScope,
    Machine, Object, Opcode,
};
use pretty_assertions::assert_eq;

/// Registers `def counter(): yield 1; yield 2; return 3`.
fn register_counter(m: &mut Machine) -> ophis::FunctionId {
    let mut b = CodeBuilder::new(m.intern("counter"));
    b.mark_generator();
    let one = b.const_int(1);
    let two = b.const_int(2);
    let three = b.const_int(3);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, three);
    b.emit(Opcode::ReturnValue);
    m.register_function("counter", b.build(0))
}

/// Calling a generator function constructs the generator without running
/// any bytecode; each send runs to the next yield; completion carries the
/// return value.
#[test]
fn generator_lifecycle() {
    let mut m = Machine::new();
    let counter = register_counter(&mut m);
    let handles = m.handles();
    let scope = HandleScope::new(&handles);

    let CallOutcome::Generator(r#gen) = m.call_function(counter, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_state(&r#gen).unwrap(), GeneratorStatus::Created);

    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    assert_eq!(m.generator_state(&r#gen).unwrap(), GeneratorStatus::Suspended);
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(2)));
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Done(Object::Int(3)));
    assert_eq!(m.generator_state(&r#gen).unwrap(), GeneratorStatus::Completed);

    // Resuming a completed generator reports exhaustion.
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Done(Object::None));
}

/// A sent value becomes the result of the suspended yield expression.
#[test]
fn send_delivers_value_to_yield_site() {
    let mut m = Machine::new();
    let x_name = m.intern("x");
    let mut b = CodeBuilder::new(m.intern("echo"));
    b.mark_generator();
    let x = b.add_local(x_name);
    let one = b.const_int(1);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit_arg(Opcode::StoreLocal, x);
    b.emit_arg(Opcode::LoadLocal, x);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let echo = m.register_function("echo", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(echo, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    assert_eq!(m.generator_send(&r#gen, Object::Int(42)).unwrap(), GenStep::Yielded(Object::Int(42)));
}

/// Sending a non-none value into a just-created generator is a TypeError.
#[test]
fn send_into_created_requires_none() {
    let mut m = Machine::new();
    let counter = register_counter(&mut m);
    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(counter, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    let err = m.generator_send(&r#gen, Object::Int(5)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    // The generator is still startable.
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
}

/// Generator arguments are bound at construction time.
#[test]
fn generator_binds_arguments() {
    let mut m = Machine::new();
    let n_name = m.intern("n");
    let mut b = CodeBuilder::new(m.intern("double_up"));
    b.mark_generator();
    let n = b.add_local(n_name);
    let two = b.const_int(2);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadLocal, n);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit(Opcode::BinaryMul);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("double_up", b.build(1));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[Object::Int(21)], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(42)));
}

/// Bytecode-level consumption: a for loop over a generator resumes it per
/// iteration and converts completion into the loop exit.
#[test]
fn for_loop_drives_generator() {
    let mut m = Machine::new();
    let counter = register_counter(&mut m);
    let s_name = m.intern("s");
    let item_name = m.intern("item");

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let s = b.add_local(s_name);
    let item = b.add_local(item_name);
    let zero = b.const_int(0);
    let gen_k = b.const_function(counter);
    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreLocal, s);
    b.emit_arg(Opcode::LoadConst, gen_k);
    b.emit_arg(Opcode::CallFunction, 0);
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

    // 1 + 2; the return value 3 is loop termination, not an item.
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(3));
}

/// `yield from` a sub-generator forwards its yields and evaluates to its
/// return value.
#[test]
fn yield_from_delegates_and_captures_return() {
    let mut m = Machine::new();
    let counter = register_counter(&mut m);
    let r_name = m.intern("r");

    let mut b = CodeBuilder::new(m.intern("outer"));
    b.mark_generator();
    let r = b.add_local(r_name);
    let gen_k = b.const_function(counter);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadConst, gen_k);
    b.emit_arg(Opcode::CallFunction, 0);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::YieldFrom);
    b.emit_arg(Opcode::StoreLocal, r);
    b.emit_arg(Opcode::LoadLocal, r);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let outer = m.register_function("outer", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(outer, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(2)));
    // The sub-generator's return value 3 is the yield-from result.
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(3)));
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Done(Object::None));
}

/// `throw` raises at the suspension point, where the generator's own
/// handlers get first claim.
#[test]
fn throw_caught_inside_generator() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("resilient"));
    b.mark_generator();
    let one = b.const_int(1);
    let recovery = b.const_int(99);
    let filter = b.const_exc_class(ExcType::ValueError);
    let none = b.const_none();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::Jump);
    b.patch_jump(handler);
    b.emit(Opcode::DupTop);
    b.emit_arg(Opcode::LoadConst, filter);
    b.emit_compare(CompareKind::ExcMatch);
    let matched = b.emit_jump(Opcode::PopJumpIfTrue);
    b.emit(Opcode::EndFinally);
    b.patch_jump(matched);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, recovery);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.patch_jump(done);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("resilient", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    // The generator is suspended inside its try body; the thrown exception
    // is claimed there, and the handler itself yields.
    assert_eq!(
        m.generator_throw(&r#gen, ExcType::ValueError, None).unwrap(),
        GenStep::Yielded(Object::Int(99))
    );
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Done(Object::None));
}

/// `throw` into a generator suspended at a `yield from` of a sub-iterator
/// with no throw support raises at the delegating site, not inside the
/// sub-iterator.
#[test]
fn throw_at_yield_from_of_plain_iterator() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("delegate"));
    b.mark_generator();
    let ten = b.const_int(10);
    let twenty = b.const_int(20);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadConst, ten);
    b.emit_arg(Opcode::LoadConst, twenty);
    b.emit_arg(Opcode::BuildList, 2);
    b.emit(Opcode::GetIter);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::YieldFrom);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("delegate", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(10)));
    let err = m.generator_throw(&r#gen, ExcType::ValueError, Some("boom")).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("boom"));
    assert_eq!(m.generator_state(&r#gen).unwrap(), GeneratorStatus::Completed);
}

/// The same throw is claimable by a handler around the delegating site.
#[test]
fn throw_at_yield_from_claimed_by_delegating_frame() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("guarded"));
    b.mark_generator();
    let ten = b.const_int(10);
    let recovery = b.const_int(7);
    let filter = b.const_exc_class(ExcType::ValueError);
    let none = b.const_none();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadConst, ten);
    b.emit_arg(Opcode::BuildList, 1);
    b.emit(Opcode::GetIter);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::YieldFrom);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::Jump);
    b.patch_jump(handler);
    b.emit(Opcode::DupTop);
    b.emit_arg(Opcode::LoadConst, filter);
    b.emit_compare(CompareKind::ExcMatch);
    let matched = b.emit_jump(Opcode::PopJumpIfTrue);
    b.emit(Opcode::EndFinally);
    b.patch_jump(matched);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, recovery);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.patch_jump(done);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("guarded", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(10)));
    assert_eq!(
        m.generator_throw(&r#gen, ExcType::ValueError, None).unwrap(),
        GenStep::Yielded(Object::Int(7))
    );
}

/// `close()` throws GeneratorExit at the suspension point; a finally on the
/// way out still runs.
#[test]
fn close_runs_finally() {
    let mut m = Machine::new();
    let closed_name = m.intern("closed");
    let mut b = CodeBuilder::new(m.intern("careful"));
    b.mark_generator();
    let closed = b.add_name(closed_name);
    let one = b.const_int(1);
    let t = b.const_bool(true);
    let none = b.const_none();
    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    // Normal fall-through pushes the no-pending marker and runs the finally
    // body in line; unwinding jumps straight to the body.
    b.emit_arg(Opcode::LoadConst, none);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadConst, t);
    b.emit_arg(Opcode::StoreGlobal, closed);
    b.emit(Opcode::EndFinally);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("careful", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    m.generator_close(&r#gen).unwrap();
    assert_eq!(m.generator_state(&r#gen).unwrap(), GeneratorStatus::Completed);

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let closed = b.add_name(closed_name);
    b.emit_arg(Opcode::LoadGlobal, closed);
    b.emit(Opcode::ReturnValue);
    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Bool(true));
}

/// A generator that yields in response to GeneratorExit is an error.
#[test]
fn close_rejects_ignored_exit() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("stubborn"));
    b.mark_generator();
    let one = b.const_int(1);
    let two = b.const_int(2);
    let none = b.const_none();
    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::Jump);
    b.patch_jump(handler);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.patch_jump(done);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    let f = m.register_function("stubborn", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    let err = m.generator_close(&r#gen).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().unwrap().contains("ignored GeneratorExit"));
}

/// Re-entrant resumption (a generator resuming itself) is rejected as an
/// internal-consistency failure, not silent stack corruption.
#[test]
fn reentrant_resumption_is_fatal() {
    let mut m = Machine::new();
    let g_name = m.intern("G");

    let mut fb = CodeBuilder::new(m.intern("selfish"));
    fb.mark_generator();
    let g_global = fb.add_name(g_name);
    let next_k = fb.const_native(ophis::NativeFn::Next);
    fb.emit_arg(Opcode::LoadConst, next_k);
    fb.emit_arg(Opcode::LoadGlobal, g_global);
    fb.emit_arg(Opcode::CallFunction, 1);
    fb.emit(Opcode::YieldValue);
    fb.emit(Opcode::PopTop);
    let none = fb.const_none();
    fb.emit_arg(Opcode::LoadConst, none);
    fb.emit(Opcode::ReturnValue);
    let f = m.register_function("selfish", fb.build(0));

    let mut b = CodeBuilder::new(m.intern("<module>"));
    let g_global = b.add_name(g_name);
    let fk = b.const_function(f);
    let next_k = b.const_native(ophis::NativeFn::Next);
    b.emit_arg(Opcode::LoadConst, fk);
    b.emit_arg(Opcode::CallFunction, 0);
    b.emit_arg(Opcode::StoreGlobal, g_global);
    b.emit_arg(Opcode::LoadConst, next_k);
    b.emit_arg(Opcode::LoadGlobal, g_global);
    b.emit_arg(Opcode::CallFunction, 1);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert!(err.message().unwrap().contains("generator already executing"));
}

/// PEP 479: a StopIteration escaping a generator body becomes RuntimeError.
#[test]
fn stop_iteration_escaping_generator_is_runtime_error() {
    let mut m = Machine::new();
    let mut b = CodeBuilder::new(m.intern("leaky"));
    b.mark_generator();
    let one = b.const_int(1);
    let exc = b.const_exc_class(ExcType::StopIteration);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, exc);
    b.emit_arg(Opcode::Raise, 1);
    let f = m.register_function("leaky", b.build(0));

    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(f, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
    let err = m.generator_send(&r#gen, Object::None).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().unwrap().contains("generator raised StopIteration"));
}
