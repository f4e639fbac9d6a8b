//! Trap, error-inspection, and exception-handling opcode handlers.
//!
//! Resume-token validation and trap materialisation share helpers here so
//! every invalid-resume diagnostic and error lookup follows the same path.

use crate::error::{map_err_code, TrapKind, VmError};
use crate::execution_state::{ExecResult, ExecState, OpResult, Unwind};
use crate::frame::{resolve_error_token, HandlerRecord, ResumeState, ERR_TOKEN_TRAP};
use crate::instruction::{Instr, Opcode};
use crate::marshal::from_runtime_string;
use crate::ops;
use crate::slot::Slot;
use crate::vm::Vm;

/// Raise the invalid-resume diagnostic for a failed `resume.*`.
fn trap_invalid_resume<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, detail: String) -> Unwind {
    ops::trap(vm, st, TrapKind::InvalidOperation, detail)
}

/// Validate the resume-token operand of a `resume.*` opcode.
fn expect_resume_token<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> Result<ResumeState, Unwind> {
    let mnemonic = instr.op.mnemonic();
    let Some(operand) = instr.operands.first() else {
        return Err(trap_invalid_resume(
            vm,
            st,
            format!("{mnemonic}: missing resume token operand"),
        ));
    };
    let token = vm.eval(st, operand)?;
    match st.frame.expect_resume_token(token) {
        Some(state) => Ok(state),
        None => Err(trap_invalid_resume(
            vm,
            st,
            format!("{mnemonic}: requires an active resume token"),
        )),
    }
}

pub(crate) fn handle_eh_push<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let Some(label) = instr.labels.first() else {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "eh.push requires a handler label",
        ));
    };
    let Some(&handler) = st.blocks.get(label.as_str()) else {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            format!("eh.push: unknown handler label '{label}'"),
        ));
    };
    st.frame.eh_stack.push(HandlerRecord {
        func: st.frame.func,
        handler,
        ip_snapshot: st.ip,
    });
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_eh_pop<'m>(
    _vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    _instr: &'m Instr,
) -> OpResult {
    st.frame.eh_stack.pop();
    Ok(ExecResult::Continue)
}

/// Landing-pad marker; the handler's parameters were bound at unwind time.
pub(crate) fn handle_eh_entry<'m>(
    _vm: &mut Vm<'m>,
    _st: &mut ExecState<'m>,
    _instr: &'m Instr,
) -> OpResult {
    Ok(ExecResult::Continue)
}

/// Resume at the faulting instruction itself.
///
/// Tokens are single-use capabilities: consumption invalidates them so stale
/// resumptions after handler unwinding cannot occur.
pub(crate) fn handle_resume_same<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let token = expect_resume_token(vm, st, instr)?;
    let Some(block) = token.block else {
        return Err(trap_invalid_resume(
            vm,
            st,
            "resume.same: resume target is no longer available".to_string(),
        ));
    };
    st.frame.resume_state.valid = false;
    st.block = block;
    st.ip = token.fault_ip;
    Ok(ExecResult::Jumped)
}

/// Resume at the instruction after the fault.
pub(crate) fn handle_resume_next<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let token = expect_resume_token(vm, st, instr)?;
    let Some(block) = token.block else {
        return Err(trap_invalid_resume(
            vm,
            st,
            "resume.next: resume target is no longer available".to_string(),
        ));
    };
    st.frame.resume_state.valid = false;
    st.block = block;
    st.ip = token.next_ip;
    Ok(ExecResult::Jumped)
}

/// Consume the token, then branch to an explicit label with arguments.
pub(crate) fn handle_resume_label<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    expect_resume_token(vm, st, instr)?;

    let Some(label) = instr.labels.first() else {
        return Err(trap_invalid_resume(
            vm,
            st,
            "resume.label: missing destination label".to_string(),
        ));
    };
    if !st.blocks.contains_key(label.as_str()) {
        return Err(trap_invalid_resume(
            vm,
            st,
            format!("resume.label: unknown destination label '{label}'"),
        ));
    }
    st.frame.resume_state.valid = false;
    super::control_ops::branch_to_target(vm, st, instr, 0)
}

/// `trap` and `trap.from_err`: raise immediately.
pub(crate) fn handle_trap<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    match instr.op {
        Opcode::TrapFromErr => {
            let code = vm.eval(st, &instr.operands[0])?.i64() as i32;
            Err(vm.raise_error(st, VmError::new(map_err_code(code), code), String::new()))
        }
        _ => Err(vm.raise_message(st, TrapKind::DomainError, 0, "")),
    }
}

/// Materialise a trap token from an err code without raising.
///
/// The token is armed in the VM and its handle stored in the destination so
/// `err.get.*` and a later `trap.from_err` can inspect or re-raise it.
pub(crate) fn handle_trap_err<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let code = vm.eval(st, &instr.operands[0])?.i64() as i32;

    let mut message = String::new();
    if let Some(operand) = instr.operands.get(1) {
        let text = vm.eval(st, operand)?;
        let handle = text.str_handle();
        if !handle.is_null() {
            if let Ok(bytes) = from_runtime_string(handle) {
                message = String::from_utf8_lossy(bytes).into_owned();
            }
        }
    }

    vm.arm_trap_token(VmError::new(map_err_code(code), code), message);
    st.frame
        .store_result(instr, Slot::from_bits(ERR_TOKEN_TRAP));
    Ok(ExecResult::Continue)
}

/// Read the kind of the referenced (or implicit) error as i64.
pub(crate) fn handle_trap_kind<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let token = match instr.operands.first() {
        Some(operand) => vm.eval(st, operand)?,
        None => Slot::zero(),
    };
    let trap_token = vm.current_trap_token();
    let error = resolve_error_token(trap_token.as_ref(), &st.frame, token);
    st.frame
        .store_result(instr, Slot::from_i64(error.kind as i32 as i64));
    Ok(ExecResult::Continue)
}

/// `err.get.{kind,code,ip,line}` field accessors.
pub(crate) fn handle_err_get<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let token = match instr.operands.first() {
        Some(operand) => vm.eval(st, operand)?,
        None => Slot::zero(),
    };
    let trap_token = vm.current_trap_token();
    let error = resolve_error_token(trap_token.as_ref(), &st.frame, token);

    let out = match instr.op {
        Opcode::ErrGetKind => error.kind as i32 as i64,
        Opcode::ErrGetCode => error.code as i64,
        Opcode::ErrGetIp => error.ip as i64,
        Opcode::ErrGetLine => error.line as i64,
        _ => 0,
    };
    st.frame.store_result(instr, Slot::from_i64(out));
    Ok(ExecResult::Continue)
}

/// Fallback for table slots with no registered handler.
pub(crate) fn handle_unimplemented<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    Err(ops::trap(
        vm,
        st,
        TrapKind::InvalidOperation,
        format!("unimplemented opcode: {}", instr.op.mnemonic()),
    ))
}
