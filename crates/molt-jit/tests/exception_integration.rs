//! Exception-handling tests: compile-time handler shapes and the runtime
//! helper protocol (prepare / match / unwind / re-raise).

mod common;

use common::{compile, compile_text, helper};
use molt_jit::helpers::id;
use molt_jit::helpers::intrins;
use molt_jit::vm::exc;
use molt_jit::vm::value::{
    exc_type_object, new_exception, new_tuple, none_value, value_is_true, ExcKind, ValueRef,
};
use molt_jit::vm::{CodeBuilder, Opcode};

fn none_const(b: &mut CodeBuilder) -> u32 {
    let n = none_value();
    n.incref();
    b.add_const(n)
}

/// try: raise Exception()
/// except: return 42
fn try_except_code() -> molt_jit::vm::CodeObject {
    let mut b = CodeBuilder::new("catch");
    let exc_c = b.add_const(new_exception(ExcKind::Exception, "boom"));
    let answer = b.add_const(ValueRef::from_int(42));
    b.emit(Opcode::SetupFinally, 4); // 0 -> handler at 6
    b.emit(Opcode::LoadConst, exc_c); // 2
    b.emit(Opcode::RaiseVarargs, 1); // 4
    b.op(Opcode::PopTop); // 6 (handler entry: traceback/value/type)
    b.op(Opcode::PopTop); // 8
    b.op(Opcode::PopTop); // 10
    b.op(Opcode::PopExcept); // 12
    b.emit(Opcode::LoadConst, answer); // 14
    b.op(Opcode::ReturnValue); // 16
    b.build()
}

#[test]
fn test_try_except_compiles_with_handler_protocol() {
    let code = try_except_code();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::DO_RAISE)));
    assert!(text.contains(&helper(id::PREPARE_EXCEPTION)));
    assert!(text.contains(&helper(id::UNWIND_EXCEPTION)));
    // The raise path runs before the handler entry in the instruction
    // stream only as a branch; preparation happens out of line.
    let prepare = text.find(&helper(id::PREPARE_EXCEPTION)).unwrap();
    let raise = text.find(&helper(id::DO_RAISE)).unwrap();
    assert!(raise < prepare);
}

#[test]
fn test_except_match_chain() {
    // try: raise 5-as-exception
    // except Exception: return 42
    // (unmatched falls into a re-raise)
    let mut b = CodeBuilder::new("match");
    let exc_c = b.add_const(new_exception(ExcKind::ValueError, "v"));
    let ty = exc_type_object(ExcKind::Exception);
    ty.incref();
    let ty_c = b.add_const(ty);
    let answer = b.add_const(ValueRef::from_int(42));
    let n = none_const(&mut b);
    b.emit(Opcode::SetupFinally, 8); // 0 -> handler at 10
    b.emit(Opcode::LoadConst, exc_c); // 2
    b.emit(Opcode::RaiseVarargs, 1); // 4
    b.op(Opcode::PopBlock); // 6 (normal path, unreached)
    b.emit(Opcode::JumpForward, 24); // 8 -> 34
    b.op(Opcode::DupTop); // 10 (handler entry)
    b.emit(Opcode::LoadConst, ty_c); // 12
    b.emit(Opcode::CompareOp, 6); // 14 ExcMatch
    b.emit(Opcode::PopJumpIfFalse, 32); // 16
    b.op(Opcode::PopTop); // 18
    b.op(Opcode::PopTop); // 20
    b.op(Opcode::PopTop); // 22
    b.op(Opcode::PopExcept); // 24
    b.emit(Opcode::LoadConst, answer); // 26
    b.op(Opcode::ReturnValue); // 28
    b.op(Opcode::Nop); // 30
    b.op(Opcode::Reraise); // 32
    b.emit(Opcode::LoadConst, n); // 34
    b.op(Opcode::ReturnValue); // 36
    let code = b.build();

    let text = compile_text(&code);
    assert!(text.contains(&helper(id::COMPARE_EXCEPTIONS)));
    assert!(text.contains(&helper(id::ERR_RESTORE)));
    assert!(text.contains(&helper(id::UNWIND_EXCEPTION)));
}

#[test]
fn test_loop_try_finally_break() {
    // for x in (1,2,3,4,5):
    //     try: break
    //     finally: pass
    // return None
    let mut b = CodeBuilder::new("brk").local_count(1);
    let items = new_tuple((1..6).map(ValueRef::from_int).collect());
    let t = b.add_const(items);
    let n = none_const(&mut b);
    b.emit(Opcode::LoadConst, t); // 0
    b.op(Opcode::GetIter); // 2
    b.emit(Opcode::ForIter, 16); // 4 -> exhaust 22
    b.emit(Opcode::StoreFast, 0); // 6
    b.emit(Opcode::SetupFinally, 8); // 8 -> finally at 18
    b.op(Opcode::PopBlock); // 10 (break leaves the try)
    b.op(Opcode::Nop); // 12 (inlined finally body)
    b.op(Opcode::PopTop); // 14 (drop the iterator)
    b.emit(Opcode::JumpForward, 4); // 16 -> 22
    b.op(Opcode::Nop); // 18 (finally body, exception path)
    b.op(Opcode::Reraise); // 20
    b.emit(Opcode::LoadConst, n); // 22
    b.op(Opcode::ReturnValue); // 24
    let code = b.build();

    let method = compile(&code).expect("try/finally with break compiles");
    let text = molt_jit::il::display::disassemble(&method.il);
    // The function-exit path leaves through the handler-aware branch.
    assert!(text.contains("leave"));
    assert!(text.contains(&helper(id::ERR_RESTORE)));
    // Propagating past the handler releases the loop iterator.
    assert!(text.contains(&helper(id::DECREF)));
}

#[test]
fn test_return_inside_except_unwinds() {
    let code = try_except_code();
    let text = compile_text(&code);
    // The return at offset 16 runs with the except scope active and must
    // restore the previous exception state on the way out.
    let unwind_count = text.matches(&helper(id::UNWIND_EXCEPTION)).count();
    assert!(unwind_count >= 1);
    assert!(text.contains("leave"));
}

#[test]
fn test_runtime_exception_protocol_roundtrip() {
    // The flow the compiled code drives at runtime for try_except_code.
    exc::clear_pending();

    // RaiseVarargs(1)
    let exc_value = new_exception(ExcKind::Exception, "boom");
    assert_eq!(intrins::do_raise(exc_value, ValueRef::NULL), -1);
    assert!(exc::pending());

    // Handler entry: prepare captures the triple and saves prior state.
    let mut slots = [ValueRef::NULL; 6];
    unsafe {
        intrins::prepare_exception(
            &mut slots[0],
            &mut slots[1],
            &mut slots[2],
            &mut slots[3],
            &mut slots[4],
            &mut slots[5],
        );
    }
    assert!(!exc::pending());
    let (exc_t, exc_v, exc_tb) = (slots[0], slots[1], slots[2]);
    assert!(!exc_t.is_null());

    // except Exception: matches.
    exc_v.incref();
    let pattern = exc_type_object(ExcKind::Exception);
    pattern.incref();
    let matched = intrins::compare_exceptions(exc_v, pattern);
    assert!(value_is_true(matched));
    matched.decref();

    // Body pops the triple, PopExcept restores the previous state.
    exc_tb.decref();
    exc_v.decref();
    exc_t.decref();
    intrins::unwind_exception(slots[3], slots[4], slots[5]);
    assert!(!exc::pending());

    // The function then returns 42.
    let result = ValueRef::from_int(42);
    assert_eq!(result.int_value(), Some(42));
}

#[test]
fn test_reraise_with_no_active_exception() {
    exc::clear_pending();
    assert_eq!(intrins::do_raise(ValueRef::NULL, ValueRef::NULL), -1);
    assert_eq!(exc::pending_kind(), Some(ExcKind::RuntimeError));
    exc::clear_pending();
}

#[test]
fn test_unmatched_pattern_type_error() {
    let raised = new_exception(ExcKind::KeyError, "k");
    let not_a_type = ValueRef::from_int(3);
    let res = intrins::compare_exceptions(raised, not_a_type);
    assert!(res.is_null());
    assert_eq!(exc::pending_kind(), Some(ExcKind::TypeError));
    exc::clear_pending();

    let raised = new_exception(ExcKind::KeyError, "k");
    let pattern = exc_type_object(ExcKind::TypeError);
    pattern.incref();
    let res = intrins::compare_exceptions(raised, pattern);
    assert!(!value_is_true(res));
    res.decref();
}
