//! End-to-end pipeline tests: bytecode in, analyzed and lowered IL out.
//!
//! Each case assembles a small function the way a front end would emit it
//! and checks both the analysis results and the shape of the emitted IL
//! (which helpers are called, which guards and fast paths appear).

mod common;

use common::{compile, compile_specialized, compile_text, helper};
use molt_jit::absint::AbstractInterpreter;
use molt_jit::helpers::id;
use molt_jit::il::display::disassemble;
use molt_jit::lattice::AbstractValueKind as K;
use molt_jit::vm::value::{new_str, new_tuple, none_value};
use molt_jit::vm::{CodeBuilder, Opcode, ValueRef};

fn none_const(b: &mut CodeBuilder) -> u32 {
    let n = none_value();
    n.incref();
    b.add_const(n)
}

#[test]
fn test_simple_return_compiles() {
    let mut b = CodeBuilder::new("f");
    let c = b.add_const(ValueRef::from_int(1));
    b.emit(Opcode::LoadConst, c);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let method = compile(&code).unwrap();
    assert!(!method.il.is_empty());
    // The stub backend produces a single trap byte.
    assert_eq!(method.native.size(), 1);
    let text = disassemble(&method.il);
    assert!(text.contains(&helper(id::PUSH_FRAME)));
    assert!(text.contains(&helper(id::POP_FRAME)));
    assert!(text.contains("ret"));
}

#[test]
fn test_augmented_int_arithmetic() {
    // x = 1; x += 1; return x
    let mut b = CodeBuilder::new("f").local_count(1);
    let one = b.add_const(ValueRef::from_int(1));
    b.emit(Opcode::LoadConst, one);
    b.emit(Opcode::StoreFast, 0);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadConst, one);
    b.op(Opcode::InplaceAdd);
    b.emit(Opcode::StoreFast, 0);
    b.emit(Opcode::LoadFast, 0);
    b.op(Opcode::ReturnValue);
    let code = b.build();

    let mut ai = AbstractInterpreter::new(&code).unwrap();
    ai.interpret().unwrap();
    assert_eq!(ai.get_return_info().kind(), K::Integer);

    // Proven integer pair: the overflow-aware fast path is used instead
    // of the generic add.
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::TAGGED_ADD)));
}

#[test]
fn test_float_arithmetic_unboxes() {
    // return a + b with float arguments
    let mut b = CodeBuilder::new("f").arg_count(2);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadFast, 1);
    b.op(Opcode::BinaryAdd);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let method = compile_specialized(&code, &[K::Float, K::Float]).unwrap();
    let text = disassemble(&method.il);
    assert!(text.contains(&helper(id::FLOAT_TO_DOUBLE)));
    assert!(text.contains(&helper(id::FLOAT_FROM_DOUBLE)));
    assert!(text.contains("add"));
    // No generic helper dispatch on this path.
    assert!(!text.contains(&helper(id::TAGGED_ADD)));
}

#[test]
fn test_float_division_guards_zero() {
    let mut b = CodeBuilder::new("f").arg_count(2);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadFast, 1);
    b.op(Opcode::BinaryTrueDivide);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let method = compile_specialized(&code, &[K::Float, K::Float]).unwrap();
    let text = disassemble(&method.il);
    // Divide-by-zero is raised before the native divide.
    assert!(text.contains(&helper(id::FLOAT_ZERO_DIVISION)));
    assert!(text.contains("div"));
    let guard = text.find(&helper(id::FLOAT_ZERO_DIVISION)).unwrap();
    let div = text.rfind("div").unwrap();
    assert!(guard < div);
}

#[test]
fn test_unbound_check_emitted_and_elided() {
    // Argument locals are always bound: no check.
    let mut b = CodeBuilder::new("arg_load").arg_count(1);
    b.emit(Opcode::LoadFast, 0);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    assert!(!compile_text(&code).contains(&helper(id::UNBOUND_LOCAL)));

    // A conditionally assigned local keeps the check.
    let mut b = CodeBuilder::new("maybe").arg_count(1).local_count(2);
    let one = b.add_const(ValueRef::from_int(1));
    b.emit(Opcode::LoadFast, 0); // 0
    b.emit(Opcode::PopJumpIfFalse, 8); // 2
    b.emit(Opcode::LoadConst, one); // 4
    b.emit(Opcode::StoreFast, 1); // 6
    b.emit(Opcode::LoadFast, 1); // 8
    b.op(Opcode::ReturnValue); // 10
    let code = b.build();
    assert!(compile_text(&code).contains(&helper(id::UNBOUND_LOCAL)));
}

#[test]
fn test_store_fast_store_then_release() {
    // x = 1; x = 2; return x — the second store must write the slot
    // before releasing the old occupant.
    let mut b = CodeBuilder::new("f").local_count(1);
    let one = b.add_const(ValueRef::from_int(1));
    let two = b.add_const(ValueRef::from_int(2));
    b.emit(Opcode::LoadConst, one);
    b.emit(Opcode::StoreFast, 0);
    b.emit(Opcode::LoadConst, two);
    b.emit(Opcode::StoreFast, 0);
    b.emit(Opcode::LoadFast, 0);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let text = compile_text(&code);
    let decref = text.find(&helper(id::DECREF)).expect("second store releases");
    assert!(text[..decref].contains("stind.ptr"));
}

#[test]
fn test_loop_emits_periodic_work_on_backedge() {
    // for x in (1, 2, 3): pass
    let mut b = CodeBuilder::new("loop").local_count(1);
    let items = new_tuple(vec![
        ValueRef::from_int(1),
        ValueRef::from_int(2),
        ValueRef::from_int(3),
    ]);
    let t = b.add_const(items);
    let n = none_const(&mut b);
    b.emit(Opcode::LoadConst, t); // 0
    b.op(Opcode::GetIter); // 2
    b.emit(Opcode::ForIter, 4); // 4 -> exhaust 10
    b.emit(Opcode::StoreFast, 0); // 6
    b.emit(Opcode::JumpAbsolute, 4); // 8
    b.emit(Opcode::LoadConst, n); // 10
    b.op(Opcode::ReturnValue); // 12
    let code = b.build();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::ITER_NEXT)));
    assert!(text.contains(&helper(id::PERIODIC_WORK)));
    assert!(text.contains(&helper(id::GET_ITER)));
}

#[test]
fn test_list_accumulation_loop() {
    // out = []
    // for x in (0, 1, 2, 3, 4, 5): out.append(x)
    // return out
    let mut b = CodeBuilder::new("collect");
    let items = new_tuple((0..6).map(ValueRef::from_int).collect());
    let t = b.add_const(items);
    b.emit(Opcode::BuildList, 0); // 0
    b.emit(Opcode::LoadConst, t); // 2
    b.op(Opcode::GetIter); // 4
    b.emit(Opcode::ForIter, 4); // 6 -> exhaust 12
    b.emit(Opcode::ListAppend, 2); // 8
    b.emit(Opcode::JumpAbsolute, 6); // 10
    b.op(Opcode::ReturnValue); // 12
    let code = b.build();

    let mut ai = AbstractInterpreter::new(&code).unwrap();
    ai.interpret().unwrap();
    assert_eq!(ai.get_return_info().kind(), K::List);

    let text = compile_text(&code);
    assert!(text.contains(&helper(id::LIST_APPEND)));
    assert!(text.contains(&helper(id::LIST_FROM_ARRAY)));
}

#[test]
fn test_unpack_ex_star_target() {
    // a, *b, c = (1, 2, 3, 4); return b
    let mut b = CodeBuilder::new("unpack").local_count(3);
    let items = new_tuple((1..5).map(ValueRef::from_int).collect());
    let t = b.add_const(items);
    b.emit(Opcode::LoadConst, t);
    b.emit(Opcode::UnpackEx, 0x101); // one before, one after
    b.emit(Opcode::StoreFast, 0);
    b.emit(Opcode::StoreFast, 1);
    b.emit(Opcode::StoreFast, 2);
    b.emit(Opcode::LoadFast, 1);
    b.op(Opcode::ReturnValue);
    let code = b.build();

    let mut ai = AbstractInterpreter::new(&code).unwrap();
    ai.interpret().unwrap();
    // The starred target is a list.
    assert_eq!(ai.get_return_info().kind(), K::List);
    assert!(compile_text(&code).contains(&helper(id::UNPACK_EX)));
}

#[test]
fn test_call_shapes() {
    // return f(21) via a global
    let mut b = CodeBuilder::new("call");
    let f = b.add_name("f");
    let c = b.add_const(ValueRef::from_int(21));
    b.emit(Opcode::LoadGlobal, f);
    b.emit(Opcode::LoadConst, c);
    b.emit(Opcode::CallFunction, 1);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::CALL_1)));
    assert!(text.contains(&helper(id::LOAD_GLOBAL)));

    // Method calls go through the load-method pair.
    let mut b = CodeBuilder::new("meth");
    let obj = b.add_name("obj");
    let m = b.add_name("run");
    b.emit(Opcode::LoadGlobal, obj);
    b.emit(Opcode::LoadMethod, m);
    b.emit(Opcode::CallMethod, 0);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::LOAD_METHOD)));
    assert!(text.contains(&helper(id::METH_CALL_0)));
}

#[test]
fn test_wide_call_builds_tuple() {
    let mut b = CodeBuilder::new("wide");
    let f = b.add_name("f");
    b.emit(Opcode::LoadGlobal, f);
    for i in 0..6 {
        let c = b.add_const(ValueRef::from_int(i));
        b.emit(Opcode::LoadConst, c);
    }
    b.emit(Opcode::CallFunction, 6);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::TUPLE_FROM_ARRAY)));
    assert!(text.contains(&helper(id::CALL_N)));
}

#[test]
fn test_fstring_formatting_pipeline() {
    // f'abc {42:3}' == 'abc ' + format(42, '3') joined
    let mut b = CodeBuilder::new("fmt");
    let lit = b.add_const(new_str("abc "));
    let n = b.add_const(ValueRef::from_int(42));
    let spec = b.add_const(new_str("3"));
    b.emit(Opcode::LoadConst, lit);
    b.emit(Opcode::LoadConst, n);
    b.emit(Opcode::LoadConst, spec);
    b.emit(Opcode::FormatValue, 0x04);
    b.emit(Opcode::BuildString, 2);
    b.op(Opcode::ReturnValue);
    let code = b.build();

    let mut ai = AbstractInterpreter::new(&code).unwrap();
    ai.interpret().unwrap();
    assert_eq!(ai.get_return_info().kind(), K::String);

    let text = compile_text(&code);
    assert!(text.contains(&helper(id::FORMAT_OBJECT)));
    assert!(text.contains(&helper(id::UNICODE_JOIN_ARRAY)));
}

#[test]
fn test_generator_rejected() {
    let code = CodeBuilder::new("gen").generator().build();
    let ai_err = AbstractInterpreter::new(&code)
        .and_then(|mut ai| ai.interpret().map(|_| ai));
    let ai = ai_err.unwrap();
    assert!(matches!(
        molt_jit::compiler::CompilerDriver::new(&code, &ai),
        Err(molt_jit::compiler::CompileError::GeneratorCode)
    ));
}

#[test]
fn test_compare_specialization() {
    // Integer comparison uses the tagged compare helpers.
    let mut b = CodeBuilder::new("cmp").arg_count(2);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadFast, 1);
    b.emit(Opcode::CompareOp, 0); // Lt
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let method = compile_specialized(&code, &[K::Integer, K::Integer]).unwrap();
    let text = disassemble(&method.il);
    assert!(text.contains(&helper(id::TAGGED_LT)));
    assert!(text.contains(&helper(id::BOOL_FROM_I32)));

    // Unknown operands fall back to rich compare.
    let method = compile_specialized(&code, &[K::Any, K::Any]).unwrap();
    let text = disassemble(&method.il);
    assert!(text.contains(&helper(id::RICH_COMPARE)));
}

#[test]
fn test_is_and_contains() {
    let mut b = CodeBuilder::new("mem").arg_count(2);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadFast, 1);
    b.emit(Opcode::IsOp, 0);
    b.op(Opcode::PopTop);
    b.emit(Opcode::LoadFast, 0);
    b.emit(Opcode::LoadFast, 1);
    b.emit(Opcode::ContainsOp, 1);
    b.op(Opcode::ReturnValue);
    let code = b.build();
    let text = compile_text(&code);
    assert!(text.contains(&helper(id::IS)));
    assert!(text.contains(&helper(id::NOT_CONTAINS)));
}
