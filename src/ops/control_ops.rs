//! Branch, switch, call, and return handlers.

use crate::error::TrapKind;
use crate::execution_state::{ExecResult, ExecState, OpResult};
use crate::instruction::Instr;
use crate::ops;
use crate::rt_string::{rt_str_release_maybe, rt_str_retain_maybe};
use crate::runtime_bridge;
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::vm::Vm;

/// Transfer control to the successor at `label_idx`, staging branch args.
///
/// Arguments are evaluated into the target block's parameter slots before
/// control moves; string parameters retain the incoming value and release any
/// previously staged one.
pub(crate) fn branch_to_target<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    label_idx: usize,
) -> OpResult {
    let Some(label) = instr.labels.get(label_idx) else {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "branch without target label",
        ));
    };
    let Some(&block_idx) = st.blocks.get(label.as_str()) else {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            format!("unknown branch target '{label}'"),
        ));
    };

    let func = st.frame.func;
    let target = &func.blocks[block_idx];
    let empty: &[crate::value::Value] = &[];
    let args = instr
        .br_args
        .get(label_idx)
        .map(Vec::as_slice)
        .unwrap_or(empty);

    if args.len() != target.params.len() {
        let source = st.block_label();
        let message = format!(
            "branch argument count mismatch targeting '{}' from '{}': expected {}, got {}",
            target.label,
            source,
            target.params.len(),
            args.len()
        );
        return Err(ops::trap(vm, st, TrapKind::InvalidOperation, message));
    }

    for (param, arg) in target.params.iter().zip(args) {
        let incoming = vm.eval(st, arg)?;
        let id = param.id as usize;
        if id >= st.frame.params.len() {
            st.frame.params.resize(id + 1, None);
        }
        if param.ty == TypeKind::Str {
            rt_str_retain_maybe(incoming.str_handle());
            if let Some(previous) = st.frame.params[id] {
                rt_str_release_maybe(previous.str_handle());
            }
        }
        st.frame.params[id] = Some(incoming);
    }

    st.block = block_idx;
    st.ip = 0;
    Ok(ExecResult::Jumped)
}

pub(crate) fn handle_br<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    branch_to_target(vm, st, instr, 0)
}

pub(crate) fn handle_cbr<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    let cond = vm.eval(st, &instr.operands[0])?;
    let target_idx = if cond.i64() != 0 { 0 } else { 1 };
    branch_to_target(vm, st, instr, target_idx)
}

pub(crate) fn handle_switch_i32<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let sel = vm.eval(st, &instr.operands[0])?.i64() as i32;

    let idx = {
        let entry = st.switch_cache.get_or_build(instr, vm.switch_mode());
        entry.lookup(instr, sel)
    };

    if idx < 0 || idx as usize >= instr.labels.len() {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "switch target out of range",
        ));
    }

    branch_to_target(vm, st, instr, idx as usize)
}

pub(crate) fn handle_ret<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    let value = match instr.operands.first() {
        Some(operand) => vm.eval(st, operand)?,
        None => Slot::zero(),
    };
    Ok(ExecResult::Returned(value))
}

pub(crate) fn handle_call<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    // Evaluate operands eagerly so argument side effects land before dispatch
    // and partially evaluated slots cannot leak if the callee traps.
    let mut args = Vec::with_capacity(instr.operands.len());
    for operand in &instr.operands {
        args.push(vm.eval(st, operand)?);
    }

    let Some(callee) = instr.callee.as_deref() else {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "call without callee",
        ));
    };

    if let Some(func) = vm.function(callee) {
        #[cfg(feature = "tco")]
        if crate::tco::is_tail_call(st, instr) && crate::tco::try_tail_call(st, func, &args) {
            return Ok(ExecResult::Jumped);
        }

        let out = vm.exec_function(func, &args)?;
        st.frame.store_result(instr, out);
    } else {
        let out = runtime_bridge::call(vm, st, callee, &mut args, instr.loc)?;
        st.frame.store_result(instr, out);
    }
    Ok(ExecResult::Continue)
}
