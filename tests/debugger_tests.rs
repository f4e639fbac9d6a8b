//! Breakpoints, scripted stepping, watches, and step limits driven through
//! real programs.

use il_vm::{
    DebugAction, DebugScript, Debugger, Instr, Module, ModuleBuilder, Opcode, SourceLoc,
    SourceMap, TypeKind, Value, Vm, VmOptions,
};

/// `main` with a few arithmetic instructions in a second block.
fn two_block_module() -> Module {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_br("work", vec![]);
    b.add_block("work");
    let a = b.reserve_temp();
    b.emit_binary(Opcode::Add, TypeKind::I64, a, Value::int(1), Value::int(2));
    let c = b.reserve_temp();
    b.emit_binary(Opcode::Add, TypeKind::I64, c, Value::temp(a), Value::int(3));
    b.emit_ret(Some(Value::temp(c)));
    b.finish()
}

#[test]
fn test_block_breakpoint_pauses_with_sentinel() {
    let module = two_block_module();
    let mut debug = Debugger::new();
    debug.add_break("work");
    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            ..VmOptions::default()
        },
    );
    // The pause sentinel becomes the call's result slot.
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 10);
    // Only the br retired before the pause.
    assert_eq!(vm.instr_count(), 1);
}

#[test]
fn test_scripted_step_budget() {
    let module = two_block_module();
    let mut debug = Debugger::new();
    debug.add_break("work");
    let mut script = DebugScript::new();
    script.push(DebugAction::Step(2));
    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            script: Some(script),
            ..VmOptions::default()
        },
    );
    // Break at `work`, arm a 2-instruction budget, run both adds, then pause
    // again with the script exhausted.
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 10);
    assert_eq!(vm.instr_count(), 3);
}

#[test]
fn test_scripted_budgets_chain_to_completion() {
    let module = two_block_module();
    let mut debug = Debugger::new();
    debug.add_break("work");
    let mut script = DebugScript::new();
    script.push(DebugAction::Step(2));
    script.push(DebugAction::Step(10));
    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            script: Some(script),
            ..VmOptions::default()
        },
    );
    // The second budget outlives the program, so it runs to the real return.
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 6);
}

#[test]
fn test_source_line_breakpoint_with_map() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let a = b.reserve_temp();
    let mut add = Instr::new(Opcode::Add);
    add.result = Some(a);
    add.ty = TypeKind::I64;
    add.operands = vec![Value::int(1), Value::int(2)];
    add.loc = SourceLoc::new(1, 7, 1);
    b.emit(add);
    b.emit_ret(Some(Value::temp(a)));
    let module = b.finish();

    let mut map = SourceMap::new();
    map.insert(1, "src\\prog\\main.bas");
    let mut debug = Debugger::new();
    debug.set_source_map(map);
    // Registered by basename only; normalization makes them comparable.
    debug.add_break_src_line("main.bas", 7);

    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            ..VmOptions::default()
        },
    );
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 10);
    assert_eq!(vm.instr_count(), 0);
}

#[test]
fn test_source_line_last_hit_cache() {
    // Two instructions share a line: the breakpoint stops once, and stepping
    // past it does not re-trigger on the same line.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let a = b.reserve_temp();
    let mut first = Instr::new(Opcode::Add);
    first.result = Some(a);
    first.ty = TypeKind::I64;
    first.operands = vec![Value::int(1), Value::int(2)];
    first.loc = SourceLoc::new(1, 9, 1);
    b.emit(first);
    let c = b.reserve_temp();
    let mut second = Instr::new(Opcode::Add);
    second.result = Some(c);
    second.ty = TypeKind::I64;
    second.operands = vec![Value::temp(a), Value::int(10)];
    second.loc = SourceLoc::new(1, 9, 5);
    b.emit(second);
    b.emit_ret(Some(Value::temp(c)));
    let module = b.finish();

    let mut map = SourceMap::new();
    map.insert(1, "main.bas");
    let mut debug = Debugger::new();
    debug.set_source_map(map);
    debug.add_break_src_line("main.bas", 9);

    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            ..VmOptions::default()
        },
    );
    let mut st = vm.prepare("main", &[]).unwrap();

    // First step pauses before executing anything on line 9.
    let paused = vm.step(&mut st).unwrap().expect("pause at line 9");
    assert_eq!(paused.i64(), 10);

    // Continuing runs both same-line instructions without another stop.
    let result = loop {
        if let Some(result) = vm.step(&mut st).unwrap() {
            break result;
        }
    };
    assert_eq!(result.i64(), 13);
}

#[test]
fn test_memory_watch_hits_on_store() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let p = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, p, Value::int(16));
    let mut store = Instr::new(Opcode::Store);
    store.ty = TypeKind::I64;
    store.operands = vec![Value::temp(p), Value::int(77)];
    b.emit(store);
    b.emit_ret(Some(Value::int(0)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    let mut st = vm.prepare("main", &[]).unwrap();

    // Run the alloca, then watch the allocated range.
    assert!(vm.step(&mut st).unwrap().is_none());
    let addr = st.frame.regs[0].addr();
    assert!(vm.debugger_mut().add_mem_watch(addr, 16, "buf"));

    let result = loop {
        if let Some(result) = vm.step(&mut st).unwrap() {
            break result;
        }
    };
    assert_eq!(result.i64(), 0);

    let hits = vm.debugger_mut().drain_mem_watch_events();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].addr, addr);
    assert_eq!(hits[0].size, 8);
    assert_eq!(hits[0].tag, "buf");
}

#[test]
fn test_memory_watch_miss_outside_range() {
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    let first = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, first, Value::int(16));
    let second = b.reserve_temp();
    b.emit_unary(Opcode::Alloca, TypeKind::Ptr, second, Value::int(16));
    let mut store = Instr::new(Opcode::Store);
    store.ty = TypeKind::I64;
    store.operands = vec![Value::temp(second), Value::int(5)];
    b.emit(store);
    b.emit_ret(Some(Value::int(0)));
    let module = b.finish();

    let mut vm = Vm::new(&module);
    let mut st = vm.prepare("main", &[]).unwrap();
    assert!(vm.step(&mut st).unwrap().is_none());
    let first_addr = st.frame.regs[0].addr();
    assert!(vm.debugger_mut().add_mem_watch(first_addr, 16, "first"));

    let result = loop {
        if let Some(result) = vm.step(&mut st).unwrap() {
            break result;
        }
    };
    assert_eq!(result.i64(), 0);
    assert!(vm.debugger_mut().drain_mem_watch_events().is_empty());
}

#[test]
fn test_var_watch_fast_path_registration() {
    // Watch registration is observable through the O(1) id lookup the store
    // handler uses to skip string work.
    let mut debug = Debugger::new();
    assert!(!debug.has_var_watches());
    let id = debug.add_watch("counter");
    assert!(id >= 1);
    assert_eq!(debug.watch_id("counter"), id);
    assert_eq!(debug.watch_id("other"), 0);
    assert!(debug.has_var_watches());

    // Watched stores flow through a program without disturbing results.
    let mut b = ModuleBuilder::new();
    b.start_function("main", TypeKind::I64);
    b.add_block("entry");
    b.emit_br("loop", vec![Value::int(3)]);
    b.add_block_with_params("loop", vec![("counter", TypeKind::I64)]);
    let n = b.block_param(1, 0);
    let done = b.reserve_temp();
    b.emit_binary(Opcode::ICmpEq, TypeKind::I1, done, n.clone(), Value::int(0));
    let next = b.reserve_temp();
    b.emit_binary(Opcode::Sub, TypeKind::I64, next, n.clone(), Value::int(1));
    b.emit_cbr(
        Value::temp(done),
        "exit",
        vec![n],
        "loop",
        vec![Value::temp(next)],
    );
    b.add_block_with_params("exit", vec![("result", TypeKind::I64)]);
    b.emit_ret(Some(b.block_param(2, 0)));
    let module = b.finish();

    let mut vm = Vm::with_options(
        &module,
        VmOptions {
            debug,
            ..VmOptions::default()
        },
    );
    assert_eq!(vm.run_function("main", &[]).unwrap().i64(), 0);
}
