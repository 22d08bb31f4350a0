use ophis::{
    CallOutcome, CodeBuilder, ExcType, GenStep, HandleScope, Machine, Object, Opcode,
};
use pretty_assertions::assert_eq;

/// Registers `def noisy(): ran = True (global); yield 1`.
fn register_noisy(m: &mut Machine) -> ophis::FunctionId {
    let ran = m.intern("ran");
    let mut b = CodeBuilder::new(m.intern("noisy"));
    b.mark_generator();
    let ran_global = b.add_name(ran);
    let t = b.const_bool(true);
    let one = b.const_int(1);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadConst, t);
    b.emit_arg(Opcode::StoreGlobal, ran_global);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::YieldValue);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    m.register_function("noisy", b.build(0))
}

/// Handle scopes nest and release in LIFO order; the final depth equals
/// the depth at the outermost scope's entry.
#[test]
fn handle_scopes_release_lifo() {
    let mut m = Machine::new();
    let noisy = register_noisy(&mut m);
    let handles = m.handles();
    assert_eq!(handles.depth(), 0);
    {
        let outer = HandleScope::new(&handles);
        let CallOutcome::Generator(_a) = m.call_function(noisy, &[], &outer).unwrap() else {
            panic!("expected a generator");
        };
        assert_eq!(handles.depth(), 1);
        {
            let inner = HandleScope::new(&handles);
            let CallOutcome::Generator(_b) = m.call_function(noisy, &[], &inner).unwrap() else {
                panic!("expected a generator");
            };
            assert_eq!(handles.depth(), 2);
        }
        assert_eq!(handles.depth(), 1);
    }
    assert_eq!(handles.depth(), 0);
}

/// A generator constructed but never resumed executes no bytecode, and
/// once unrooted it is collected in the created state.
#[test]
fn created_generator_collected_without_running() {
    let mut m = Machine::new();
    let noisy = register_noisy(&mut m);
    let handles = m.handles();
    {
        let scope = HandleScope::new(&handles);
        let CallOutcome::Generator(_gen) = m.call_function(noisy, &[], &scope).unwrap() else {
            panic!("expected a generator");
        };
        assert!(m.heap_stats().objects_by_layout.contains_key("Generator"));
    }
    let freed = m.collect();
    assert!(freed >= 1);
    assert!(!m.heap_stats().objects_by_layout.contains_key("Generator"));

    // The generator body never ran: its first statement would have defined
    // the global.
    let ran = m.intern("ran");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let ran_global = b.add_name(ran);
    b.emit_arg(Opcode::LoadGlobal, ran_global);
    b.emit(Opcode::ReturnValue);
    let err = m.run_code(&b.build(0)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::NameError);
}

/// A rooted generator survives collection and stays resumable.
#[test]
fn rooted_generator_survives_collection() {
    let mut m = Machine::new();
    let noisy = register_noisy(&mut m);
    let handles = m.handles();
    let scope = HandleScope::new(&handles);
    let CallOutcome::Generator(r#gen) = m.call_function(noisy, &[], &scope).unwrap() else {
        panic!("expected a generator");
    };
    let freed = m.collect();
    assert_eq!(freed, 0);
    assert_eq!(m.generator_send(&r#gen, Object::None).unwrap(), GenStep::Yielded(Object::Int(1)));
}

/// Globals are part of the root set; temporaries with no remaining
/// references are reclaimed.
#[test]
fn globals_are_roots_and_garbage_is_reclaimed() {
    let mut m = Machine::new();
    let keep = m.intern("keep");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let keep_global = b.add_name(keep);
    let one = b.const_int(1);
    let two = b.const_int(2);
    // keep = [1, 2]; then build and discard another list.
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit_arg(Opcode::BuildList, 2);
    b.emit_arg(Opcode::StoreGlobal, keep_global);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::BuildList, 1);
    b.emit(Opcode::PopTop);
    let none = b.const_none();
    b.emit_arg(Opcode::LoadConst, none);
    b.emit(Opcode::ReturnValue);
    m.run_code(&b.build(0)).unwrap();

    let before = m.heap_stats().live_objects;
    let freed = m.collect();
    assert_eq!(freed, 1);
    assert_eq!(m.heap_stats().live_objects, before - 1);

    // The kept list is intact.
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let keep_global = b.add_name(keep);
    b.emit_arg(Opcode::LoadGlobal, keep_global);
    b.emit(Opcode::ReturnValue);
    assert_eq!(
        m.run_code(&b.build(0)).unwrap(),
        Object::List(vec![Object::Int(1), Object::Int(2)])
    );
}

/// With an aggressive collection threshold, allocation pressure triggers
/// collections inside the dispatch loop; stack slots and locals are roots,
/// so the computation is unaffected.
#[test]
fn in_run_collection_preserves_live_state() {
    let mut m = Machine::new();
    m.set_gc_threshold(2);
    let s_name = m.intern("s");
    let item_name = m.intern("item");
    let mut b = CodeBuilder::new(m.intern("<module>"));
    let s = b.add_local(s_name);
    let item = b.add_local(item_name);
    let zero = b.const_int(0);
    let mut consts = Vec::new();
    for i in 1..=10 {
        consts.push(b.const_int(i));
    }

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreLocal, s);
    for &k in &consts {
        b.emit_arg(Opcode::LoadConst, k);
    }
    b.emit_arg(Opcode::BuildList, 10);
    b.emit(Opcode::GetIter);
    let loop_start = b.offset();
    let end = b.emit_jump(Opcode::ForIter);
    b.emit_arg(Opcode::StoreLocal, item);
    // Allocate a throwaway list every iteration to force collections.
    b.emit_arg(Opcode::LoadLocal, item);
    b.emit_arg(Opcode::BuildList, 1);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadLocal, s);
    b.emit_arg(Opcode::LoadLocal, item);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreLocal, s);
    b.emit_arg(Opcode::Jump, loop_start);
    b.patch_jump(end);
    b.emit_arg(Opcode::LoadLocal, s);
    b.emit(Opcode::ReturnValue);

    assert_eq!(m.run_code(&b.build(0)).unwrap(), Object::Int(55));
    m.collect();
    assert_eq!(m.heap_stats().live_objects, 0);
}
