//! Runtime bridge marshalling, arity validation, and pow classification.

use il_vm::{
    Instr, Module, ModuleBuilder, Opcode, TrapKind, TypeKind, Value, Vm,
};

fn call_module(callee: &str, args: Vec<Value>, ret: TypeKind) -> Module {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let r = b.reserve_temp();
    b.emit_call(callee, args, Some((r, ret)), il_vm::SourceLoc::default());
    b.emit_ret(Some(Value::temp(r)));
    b.finish()
}

#[test]
fn test_i64_and_f64_marshalling() {
    let module = call_module("rt_abs_i64", vec![Value::int(-42)], TypeKind::I64);
    let mut vm = Vm::new(&module);
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 42);

    // f64 results flow back through the f64 result buffer.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let abs = b.reserve_temp();
    b.emit_call(
        "rt_abs_f64",
        vec![Value::float(-3.25)],
        Some((abs, TypeKind::F64)),
        il_vm::SourceLoc::default(),
    );
    let eq = b.reserve_temp();
    b.emit_binary(
        Opcode::FCmpEq,
        TypeKind::I1,
        eq,
        Value::temp(abs),
        Value::float(3.25),
    );
    b.emit_ret(Some(Value::temp(eq)));
    let module = b.finish();
    let mut vm = Vm::new(&module);
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 1);
}

#[test]
fn test_string_marshalling_round_trip() {
    // const.str -> rt_len through the bridge.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let s = b.reserve_temp();
    b.emit_unary(
        Opcode::ConstStr,
        TypeKind::Str,
        s,
        Value::string("hello"),
    );
    let len = b.reserve_temp();
    b.emit_call(
        "rt_len",
        vec![Value::temp(s)],
        Some((len, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(len)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 5);
}

#[test]
fn test_concat_builds_fresh_string() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let lhs = b.reserve_temp();
    b.emit_unary(Opcode::ConstStr, TypeKind::Str, lhs, Value::string("ab"));
    let rhs = b.reserve_temp();
    b.emit_unary(Opcode::ConstStr, TypeKind::Str, rhs, Value::string("cde"));
    let joined = b.reserve_temp();
    b.emit_call(
        "rt_concat",
        vec![Value::temp(lhs), Value::temp(rhs)],
        Some((joined, TypeKind::Str)),
        il_vm::SourceLoc::default(),
    );
    let len = b.reserve_temp();
    b.emit_call(
        "rt_len",
        vec![Value::temp(joined)],
        Some((len, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(len)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 5);
}

#[test]
fn test_global_string_resolves() {
    let mut b = ModuleBuilder::new();
    b.add_global("greeting", "hi there");
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let g = b.reserve_temp();
    let mut gaddr = Instr::new(Opcode::GAddr);
    gaddr.result = Some(g);
    gaddr.ty = TypeKind::Str;
    gaddr.operands = vec![Value::global("greeting")];
    b.emit(gaddr);
    let len = b.reserve_temp();
    b.emit_call(
        "rt_len",
        vec![Value::temp(g)],
        Some((len, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(len)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 8);
}

#[test]
fn test_unknown_global_traps() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let g = b.reserve_temp();
    let mut gaddr = Instr::new(Opcode::GAddr);
    gaddr.result = Some(g);
    gaddr.ty = TypeKind::Str;
    gaddr.operands = vec![Value::global("absent")];
    b.emit(gaddr);
    b.emit_ret(Some(Value::int(0)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    let err = vm.run_function("main", &[]).expect_err("unknown global");
    assert!(err.to_string().contains("unknown global"), "{err}");
}

#[test]
fn test_unknown_runtime_helper_traps() {
    let module = call_module("rt_does_not_exist", vec![], TypeKind::I64);
    let mut vm = Vm::new(&module);
    let err = vm.run_function("main", &[]).expect_err("unknown helper");
    assert!(
        err.to_string()
            .contains("attempted to call unknown runtime helper 'rt_does_not_exist'"),
        "{err}"
    );
}

#[test]
fn test_arity_mismatch_traps_with_counts() {
    let module = call_module(
        "rt_len",
        vec![Value::string("a"), Value::string("b")],
        TypeKind::I64,
    );
    let mut vm = Vm::new(&module);
    let err = vm.run_function("main", &[]).expect_err("arity mismatch");
    let message = err.to_string();
    assert!(
        message.contains("rt_len: expected 1 argument(s), got 2"),
        "{message}"
    );
    assert!(message.contains("excess runtime operands"), "{message}");
}

/// Run `rt_pow_f64_chkdom(base, exp)` under a handler returning the kind.
fn pow_kind(base: f64, exponent: f64) -> i64 {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_eh_push("handler");
    let r = b.reserve_temp();
    b.emit_call(
        "rt_pow_f64_chkdom",
        vec![Value::float(base), Value::float(exponent)],
        Some((r, TypeKind::F64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::int(-1)));

    b.add_block_with_params(
        "handler",
        vec![("err", TypeKind::Error), ("tok", TypeKind::ResumeTok)],
    );
    let err = b.block_param(1, 0);
    b.emit(Instr::new(Opcode::EhEntry));
    let kind = b.reserve_temp();
    let mut get = Instr::new(Opcode::ErrGetKind);
    get.result = Some(kind);
    get.ty = TypeKind::I64;
    get.operands = vec![err];
    b.emit(get);
    b.emit_ret(Some(Value::temp(kind)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    vm.run_function("main", &[]).unwrap().i64()
}

#[test]
fn test_pow_classification() {
    // Zero raised to a negative exponent: domain error.
    assert_eq!(pow_kind(0.0, -2.0), TrapKind::DomainError as i32 as i64);
    // Negative base with a non-integer exponent: domain error.
    assert_eq!(pow_kind(-8.0, 0.5), TrapKind::DomainError as i32 as i64);
    // Finite inputs overflowing to infinity: overflow.
    assert_eq!(pow_kind(1e300, 2.0), TrapKind::Overflow as i32 as i64);
    // Well-defined pow does not trap; main returns -1.
    assert_eq!(pow_kind(2.0, 10.0), -1);
    // Negative base with an integer exponent is fine.
    assert_eq!(pow_kind(-2.0, 3.0), -1);
}
