//! End-to-end execution tests: arithmetic, bounds checks, memory, control
//! flow, the step API, and dispatch-strategy parity.

use il_vm::{
    DispatchKind, Module, ModuleBuilder, Opcode, TypeKind, Value, Vm, VmException, VmOptions,
};

/// Build `main` that evaluates one binary op over constants and returns it.
fn binary_module(op: Opcode, ty: TypeKind, lhs: Value, rhs: Value) -> Module {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let t = b.reserve_temp();
    b.emit_binary(op, ty, t, lhs, rhs);
    b.emit_ret(Some(Value::temp(t)));
    b.finish()
}

fn run_main(module: &Module) -> i64 {
    let mut vm = Vm::new(module);
    vm.run_function("main", &[]).expect("main should not trap").i64()
}

fn run_main_err(module: &Module) -> VmException {
    let mut vm = Vm::new(module);
    vm.run_function("main", &[]).expect_err("main should trap")
}

#[test]
fn test_checked_arithmetic_chain() {
    // 7 * 1000 + 42 through the overflow-checked opcodes.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let product = b.reserve_temp();
    b.emit_binary(
        Opcode::IMulOvf,
        TypeKind::I64,
        product,
        Value::int(7),
        Value::int(1000),
    );
    let sum = b.reserve_temp();
    b.emit_binary(
        Opcode::IAddOvf,
        TypeKind::I64,
        sum,
        Value::temp(product),
        Value::int(42),
    );
    b.emit_ret(Some(Value::temp(sum)));
    let module = b.finish();

    assert_eq!(run_main(&module), 7042);
}

#[test]
fn test_wrapping_arithmetic() {
    let module = binary_module(
        Opcode::Add,
        TypeKind::I64,
        Value::int(i64::MAX),
        Value::int(1),
    );
    assert_eq!(run_main(&module), i64::MIN);

    let module = binary_module(
        Opcode::Mul,
        TypeKind::I64,
        Value::int(i64::MAX),
        Value::int(2),
    );
    assert_eq!(run_main(&module), -2);
}

#[test]
fn test_overflow_checked_traps() {
    let module = binary_module(
        Opcode::IAddOvf,
        TypeKind::I64,
        Value::int(i64::MAX),
        Value::int(1),
    );
    let err = run_main_err(&module);
    assert!(err.to_string().contains("Overflow"), "{err}");

    // Lane-width overflow: i16 lane traps where i64 would not.
    let module = binary_module(
        Opcode::IAddOvf,
        TypeKind::I16,
        Value::int(30_000),
        Value::int(10_000),
    );
    let err = run_main_err(&module);
    assert!(err.to_string().contains("iadd.ovf"), "{err}");
}

#[test]
fn test_division_semantics() {
    let module = binary_module(Opcode::SDivChk0, TypeKind::I64, Value::int(7), Value::int(0));
    assert!(run_main_err(&module).to_string().contains("DivideByZero"));

    let module = binary_module(
        Opcode::SDivChk0,
        TypeKind::I64,
        Value::int(i64::MIN),
        Value::int(-1),
    );
    assert!(run_main_err(&module).to_string().contains("Overflow"));

    let module = binary_module(
        Opcode::SRemChk0,
        TypeKind::I64,
        Value::int(i64::MIN),
        Value::int(-1),
    );
    assert_eq!(run_main(&module), 0);

    // Remainder keeps the dividend's sign.
    let module = binary_module(
        Opcode::SRemChk0,
        TypeKind::I64,
        Value::int(-7),
        Value::int(3),
    );
    assert_eq!(run_main(&module), -1);

    let module = binary_module(
        Opcode::UDivChk0,
        TypeKind::I64,
        Value::int(-1),
        Value::int(2),
    );
    assert_eq!(run_main(&module), (u64::MAX / 2) as i64);
}

#[test]
fn test_shift_masking() {
    let module = binary_module(Opcode::Shl, TypeKind::I64, Value::int(1), Value::int(64));
    assert_eq!(run_main(&module), 1);

    let module = binary_module(Opcode::LShr, TypeKind::I64, Value::int(-1), Value::int(65));
    assert_eq!(run_main(&module), (u64::MAX >> 1) as i64);

    let module = binary_module(Opcode::AShr, TypeKind::I64, Value::int(-8), Value::int(2));
    assert_eq!(run_main(&module), -2);
}

#[test]
fn test_idxchk_normalizes() {
    let cases = [
        (7, 0, 10, Some(7)),
        (12, 10, 20, Some(2)),
        (10, 10, 20, Some(0)),
        (19, 10, 20, Some(9)),
        (0, -5, 5, Some(5)),
        (-5, -5, 5, Some(0)),
        (5, 5, 6, Some(0)),
        (20, 10, 20, None),
        (9, 10, 20, None),
    ];
    for (idx, lo, hi, expected) in cases {
        let mut b = ModuleBuilder::new();
        b.start_function("main", TypeKind::I64);
        b.add_block("entry");
        let t = b.reserve_temp();
        let mut instr = il_vm::Instr::new(Opcode::IdxChk);
        instr.result = Some(t);
        instr.ty = TypeKind::I64;
        instr.operands = vec![Value::int(idx), Value::int(lo), Value::int(hi)];
        b.emit(instr);
        b.emit_ret(Some(Value::temp(t)));
        let module = b.finish();

        match expected {
            Some(value) => assert_eq!(run_main(&module), value, "idxchk({idx},{lo},{hi})"),
            None => {
                let err = run_main_err(&module);
                assert!(err.to_string().contains("Bounds"), "{err}");
            }
        }
    }
}

#[test]
fn test_float_compare_and_convert() {
    // scmp/fcmp produce canonical booleans.
    let module = binary_module(
        Opcode::FCmpLt,
        TypeKind::I1,
        Value::float(1.5),
        Value::float(2.5),
    );
    assert_eq!(run_main(&module), 1);

    // NaN is unordered: only `ne` observes it as true.
    let module = binary_module(
        Opcode::FCmpNe,
        TypeKind::I1,
        Value::float(f64::NAN),
        Value::float(0.0),
    );
    assert_eq!(run_main(&module), 1);
    let module = binary_module(
        Opcode::FCmpEq,
        TypeKind::I1,
        Value::float(f64::NAN),
        Value::float(f64::NAN),
    );
    assert_eq!(run_main(&module), 0);
}

fn unary_module(op: Opcode, ty: TypeKind, operand: Value) -> Module {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let t = b.reserve_temp();
    b.emit_unary(op, ty, t, operand);
    b.emit_ret(Some(Value::temp(t)));
    b.finish()
}

#[test]
fn test_checked_fp_casts() {
    let module = unary_module(Opcode::CastFpToSiRteChk, TypeKind::I64, Value::float(f64::NAN));
    assert!(run_main_err(&module).to_string().contains("InvalidCast"));

    let module = unary_module(
        Opcode::CastFpToSiRteChk,
        TypeKind::I64,
        Value::float(9_223_372_036_854_775_808.0),
    );
    assert!(run_main_err(&module).to_string().contains("Overflow"));

    let module = unary_module(
        Opcode::CastFpToSiRteChk,
        TypeKind::I64,
        Value::float(-9_223_372_036_854_775_808.0),
    );
    assert_eq!(run_main(&module), i64::MIN);

    // Round-to-nearest-even: 2.5 rounds to 2.
    let module = unary_module(Opcode::CastFpToSiRteChk, TypeKind::I64, Value::float(2.5));
    assert_eq!(run_main(&module), 2);

    // -0.4 rounds to zero before the sign check; -0.6 is rejected.
    let module = unary_module(Opcode::CastFpToUiRteChk, TypeKind::I64, Value::float(-0.4));
    assert_eq!(run_main(&module), 0);
    let module = unary_module(Opcode::CastFpToUiRteChk, TypeKind::I64, Value::float(-0.6));
    assert!(run_main_err(&module).to_string().contains("InvalidCast"));

    let module = unary_module(
        Opcode::CastFpToUiRteChk,
        TypeKind::I64,
        Value::float(18_446_744_073_709_551_616.0),
    );
    assert!(run_main_err(&module).to_string().contains("Overflow"));
}

#[test]
fn test_narrowing_casts() {
    let module = unary_module(Opcode::CastSiNarrowChk, TypeKind::I16, Value::int(70_000));
    assert!(run_main_err(&module).to_string().contains("InvalidCast"));

    let module = unary_module(Opcode::CastSiNarrowChk, TypeKind::I16, Value::int(-32_768));
    assert_eq!(run_main(&module), -32_768);

    let module = unary_module(Opcode::CastSiNarrowChk, TypeKind::I1, Value::int(2));
    assert!(run_main_err(&module).to_string().contains("InvalidCast"));

    let module = unary_module(Opcode::CastSiNarrowChk, TypeKind::I1, Value::int(1));
    assert_eq!(run_main(&module), 1);

    let module = unary_module(Opcode::Trunc1, TypeKind::I1, Value::int(6));
    assert_eq!(run_main(&module), 0);
    let module = unary_module(Opcode::Zext1, TypeKind::I1, Value::int(6));
    assert_eq!(run_main(&module), 1);
}

#[test]
fn test_alloca_store_load_gep() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");

    // A zero-byte region keeps alignment for the next allocation.
    let empty = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, empty, Value::int(0));
    let buf = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, buf, Value::int(16));

    let second = b.reserve_temp();
    b.emit_binary(
        Opcode::Gep,
        TypeKind::Ptr,
        second,
        Value::temp(buf),
        Value::int(8),
    );

    let mut store = il_vm::Instr::new(Opcode::Store);
    store.ty = TypeKind::I64;
    store.operands = vec![Value::temp(second), Value::int(1234)];
    b.emit(store);

    let loaded = b.reserve_temp();
    let mut load = il_vm::Instr::new(Opcode::Load);
    load.result = Some(loaded);
    load.ty = TypeKind::I64;
    load.operands = vec![Value::temp(second)];
    b.emit(load);

    b.emit_ret(Some(Value::temp(loaded)));
    let module = b.finish();

    assert_eq!(run_main(&module), 1234);
}

#[test]
fn test_gep_null_semantics() {
    // gep null, 0 stays null; gep null, k reinterprets k as an address.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let zero = b.reserve_temp();
    b.emit_binary(Opcode::Gep, TypeKind::Ptr, zero, Value::null(), Value::int(0));
    let known = b.reserve_temp();
    b.emit_binary(
        Opcode::Gep,
        TypeKind::Ptr,
        known,
        Value::null(),
        Value::int(16),
    );
    let sum = b.reserve_temp();
    b.emit_binary(
        Opcode::Add,
        TypeKind::I64,
        sum,
        Value::temp(zero),
        Value::temp(known),
    );
    b.emit_ret(Some(Value::temp(sum)));
    let module = b.finish();

    assert_eq!(run_main(&module), 16);
}

#[test]
fn test_null_and_misaligned_memory_trap() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let t = b.reserve_temp();
    let mut load = il_vm::Instr::new(Opcode::Load);
    load.result = Some(t);
    load.ty = TypeKind::I64;
    load.operands = vec![Value::null()];
    b.emit(load);
    b.emit_ret(Some(Value::temp(t)));
    let module = b.finish();
    let err = run_main_err(&module);
    assert!(err.to_string().contains("null load"), "{err}");

    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let odd = b.reserve_temp();
    b.emit_binary(Opcode::Gep, TypeKind::Ptr, odd, Value::null(), Value::int(9));
    let t = b.reserve_temp();
    let mut load = il_vm::Instr::new(Opcode::Load);
    load.result = Some(t);
    load.ty = TypeKind::I64;
    load.operands = vec![Value::temp(odd)];
    b.emit(load);
    b.emit_ret(Some(Value::temp(t)));
    let module = b.finish();
    let err = run_main_err(&module);
    assert!(err.to_string().contains("misaligned load"), "{err}");
}

#[test]
fn test_const_null_store_load_round_trip() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let p = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, p, Value::int(8));
    let n = b.reserve_temp();
    let mut cn = il_vm::Instr::new(Opcode::ConstNull);
    cn.result = Some(n);
    cn.ty = TypeKind::Str;
    b.emit(cn);

    let mut store = il_vm::Instr::new(Opcode::Store);
    store.ty = TypeKind::Str;
    store.operands = vec![Value::temp(p), Value::temp(n)];
    b.emit(store);

    let l = b.reserve_temp();
    let mut load = il_vm::Instr::new(Opcode::Load);
    load.result = Some(l);
    load.ty = TypeKind::Str;
    load.operands = vec![Value::temp(p)];
    b.emit(load);

    let eq = b.reserve_temp();
    b.emit_binary(Opcode::ICmpEq, TypeKind::I1, eq, Value::temp(l), Value::int(0));
    b.emit_ret(Some(Value::temp(eq)));
    let module = b.finish();

    assert_eq!(run_main(&module), 1);
}

#[test]
fn test_block_params_flow_values() {
    // Branch arguments land in the target block's parameter registers.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_br("join", vec![Value::int(20), Value::int(22)]);
    b.add_block_with_params("join", vec![("a", TypeKind::I64), ("b", TypeKind::I64)]);
    let a = b.block_param(1, 0);
    let c = b.block_param(1, 1);
    let sum = b.reserve_temp();
    b.emit_binary(Opcode::Add, TypeKind::I64, sum, a, c);
    b.emit_ret(Some(Value::temp(sum)));
    let module = b.finish();

    assert_eq!(run_main(&module), 42);
}

#[test]
fn test_branch_arg_mismatch_traps() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_br("join", vec![Value::int(1)]);
    b.add_block_with_params("join", vec![("a", TypeKind::I64), ("b", TypeKind::I64)]);
    b.emit_ret(Some(Value::int(0)));
    let module = b.finish();

    let err = run_main_err(&module);
    assert!(
        err.to_string().contains("branch argument count mismatch"),
        "{err}"
    );
}

#[test]
fn test_entry_arity_mismatch_traps() {
    let mut b = ModuleBuilder::new();
    b.start_function("takes_one", TypeKind::I64);
    b.add_block_with_params("entry", vec![("x", TypeKind::I64)]);
    b.emit_ret(Some(b.block_param(0, 0)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    let err = vm.run_function("takes_one", &[]).expect_err("arity mismatch");
    assert!(
        err.to_string()
            .contains("argument count mismatch for function takes_one"),
        "{err}"
    );
}

#[test]
fn test_nested_calls() {
    let mut b = ModuleBuilder::new();
    b.start_function("add_one", TypeKind::I64);
    b.add_block_with_params("entry", vec![("x", TypeKind::I64)]);
    let t = b.reserve_temp();
    b.emit_binary(
        Opcode::Add,
        TypeKind::I64,
        t,
        b.block_param(0, 0),
        Value::int(1),
    );
    b.emit_ret(Some(Value::temp(t)));

    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let r = b.reserve_temp();
    b.emit_call(
        "add_one",
        vec![Value::int(41)],
        Some((r, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(r)));
    let module = b.finish();

    assert_eq!(run_main(&module), 42);
}

#[test]
fn test_missing_main_run() {
    let module = Module::default();
    let mut vm = Vm::new(&module);
    assert_eq!(vm.run(), 1);
}

#[test]
fn test_unknown_function_error() {
    let module = Module::default();
    let mut vm = Vm::new(&module);
    match vm.run_function("nope", &[]) {
        Err(VmException::UnknownFunction { name }) => assert_eq!(name, "nope"),
        other => panic!("expected UnknownFunction, got {other:?}"),
    }
}

/// Loop counting down from an argument via cbr; exercises every strategy.
fn countdown_module() -> Module {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_br("loop", vec![Value::int(10), Value::int(0)]);
    b.add_block_with_params("loop", vec![("n", TypeKind::I64), ("acc", TypeKind::I64)]);
    let n = b.block_param(1, 0);
    let acc = b.block_param(1, 1);
    let done = b.reserve_temp();
    b.emit_binary(Opcode::ICmpEq, TypeKind::I1, done, n.clone(), Value::int(0));
    let next_n = b.reserve_temp();
    b.emit_binary(Opcode::Sub, TypeKind::I64, next_n, n.clone(), Value::int(1));
    let next_acc = b.reserve_temp();
    b.emit_binary(Opcode::Add, TypeKind::I64, next_acc, acc.clone(), n);
    b.emit_cbr(
        Value::temp(done),
        "exit",
        vec![acc],
        "loop",
        vec![Value::temp(next_n), Value::temp(next_acc)],
    );
    b.add_block_with_params("exit", vec![("result", TypeKind::I64)]);
    b.emit_ret(Some(b.block_param(2, 0)));
    b.finish()
}

#[test]
fn test_dispatch_strategy_parity() {
    let module = countdown_module();
    let mut results = Vec::new();
    let mut counts = Vec::new();
    for kind in [
        DispatchKind::Table,
        DispatchKind::Switch,
        DispatchKind::Threaded,
    ] {
        let mut vm = Vm::with_options(
            &module,
            VmOptions {
                dispatch: kind,
                ..VmOptions::default()
            },
        );
        results.push(vm.run_function("main", &[]).unwrap().i64());
        counts.push(vm.instr_count());
    }
    assert_eq!(results, vec![55, 55, 55]);
    // The strategies retire exactly the same instruction stream.
    assert!(counts.windows(2).all(|w| w[0] == w[1]), "{counts:?}");
}

#[test]
fn test_step_api() {
    let module = countdown_module();
    let mut vm = Vm::new(&module);
    let mut st = vm.prepare("main", &[]).unwrap();
    let mut steps = 0u64;
    let result = loop {
        match vm.step(&mut st).unwrap() {
            Some(result) => break result,
            None => steps += 1,
        }
    };
    assert_eq!(result.i64(), 55);
    assert_eq!(steps + 1, vm.instr_count());
}

#[test]
fn test_max_steps_aborts_with_one() {
    let module = countdown_module();
    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            max_steps: 5,
            ..VmOptions::default()
        },
    );
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 1);
}

#[cfg(feature = "tco")]
#[test]
fn test_tail_call_recursion() {
    // Accumulator factorial where every recursive call is in tail position.
    // Frame reuse keeps this from deepening the host stack.
    let mut b = ModuleBuilder::new();
    b.start_function("fact", TypeKind::I64);
    b.add_block_with_params("entry", vec![("n", TypeKind::I64), ("acc", TypeKind::I64)]);
    let n = b.block_param(0, 0);
    let acc = b.block_param(0, 1);
    let done = b.reserve_temp();
    b.emit_binary(Opcode::ICmpEq, TypeKind::I1, done, n.clone(), Value::int(0));
    b.emit_cbr(Value::temp(done), "base", vec![], "recurse", vec![]);
    b.add_block("base");
    b.emit_ret(Some(acc.clone()));
    b.add_block("recurse");
    let next_n = b.reserve_temp();
    b.emit_binary(Opcode::Sub, TypeKind::I64, next_n, n.clone(), Value::int(1));
    let next_acc = b.reserve_temp();
    b.emit_binary(Opcode::IMulOvf, TypeKind::I64, next_acc, acc, n);
    let r = b.reserve_temp();
    b.emit_call(
        "fact",
        vec![Value::temp(next_n), Value::temp(next_acc)],
        Some((r, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(r)));

    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let r = b.reserve_temp();
    b.emit_call(
        "fact",
        vec![Value::int(10), Value::int(1)],
        Some((r, TypeKind::I64)),
        il_vm::SourceLoc::default(),
    );
    b.emit_ret(Some(Value::temp(r)));
    let module = b.finish();

    assert_eq!(run_main(&module), 3_628_800);
}
