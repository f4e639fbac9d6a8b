//! Tail-call frame reuse.
//!
//! A call in tail position (its result immediately returned, or a void call
//! followed by a void return) reuses the current frame instead of recursing:
//! the block map, register file, staging area, and stack pointer are reset to
//! the callee's shape while the EH stack and resume state carry over. Any
//! mismatch aborts the attempt and falls back to an ordinary call.

use crate::error::VmError;
use crate::execution_state::ExecState;
use crate::instruction::{Instr, Opcode};
use crate::module::Function;
use crate::rt_string::rt_str_retain_maybe;
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::value::Value;

/// True when `instr` is a call whose value the very next instruction returns.
pub(crate) fn is_tail_call(st: &ExecState<'_>, instr: &Instr) -> bool {
    let Some(block) = st.current_block() else {
        return false;
    };
    let Some(next) = block.instrs.get(st.ip + 1) else {
        return false;
    };
    if next.op != Opcode::Ret {
        return false;
    }
    match (instr.result, next.operands.first()) {
        (Some(id), Some(Value::Temp(ret_id))) => id == *ret_id,
        (None, None) => true,
        _ => false,
    }
}

/// Reuse the current frame for `callee`; returns false to fall back.
pub(crate) fn try_tail_call<'m>(
    st: &mut ExecState<'m>,
    callee: &'m Function,
    args: &[Slot],
) -> bool {
    let Some(entry) = callee.blocks.first() else {
        return false;
    };
    if args.len() != entry.params.len() {
        return false;
    }
    let reg_count = callee.value_names.len();
    if entry.params.iter().any(|p| p.id as usize >= reg_count) {
        return false;
    }

    st.blocks.clear();
    for (idx, block) in callee.blocks.iter().enumerate() {
        st.blocks.insert(block.label.as_str(), idx);
    }

    let frame = &mut st.frame;
    let from = frame.func.name.clone();
    frame.func = callee;
    frame.regs.clear();
    frame.regs.resize(reg_count, Slot::zero());
    frame.reg_types.clear();
    frame.reg_types.resize(reg_count, TypeKind::Void);
    frame.sp = 0;
    frame.params.clear();
    frame.params.resize(reg_count, None);
    // EH stack and resume state survive the reuse.
    frame.active_error = VmError::default();

    for (param, arg) in entry.params.iter().zip(args) {
        if param.ty == TypeKind::Str {
            rt_str_retain_maybe(arg.str_handle());
        }
        frame.params[param.id as usize] = Some(*arg);
    }

    st.block = 0;
    st.ip = 0;
    st.skip_break_once = false;
    st.switch_cache.clear();
    log::debug!("tail call @{from} -> @{}", callee.name);
    true
}
