//! Floating-point arithmetic, comparison, and conversion handlers.
//!
//! Arithmetic follows host IEEE-754 semantics; NaN and infinities propagate.
//! Operand width follows the instruction type for arithmetic, and prefers
//! `f32` for comparisons when either operand is an `f32`-typed temporary.
//! Checked conversions round to nearest-even and raise structured traps.

use crate::error::TrapKind;
use crate::execution_state::{ExecResult, ExecState, OpResult};
use crate::frame::Frame;
use crate::instruction::Instr;
use crate::marshal::{const_to_f64, is_constant_scalar};
use crate::ops;
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::value::Value;
use crate::vm::Vm;

/// 2^63 as f64, the first value outside the signed 64-bit range.
const I64_BOUNDARY: f64 = 9_223_372_036_854_775_808.0;
/// 2^64 as f64, the first value outside the unsigned 64-bit range.
const U64_BOUNDARY: f64 = 18_446_744_073_709_551_616.0;

fn temp_type(frame: &Frame<'_>, id: u32) -> TypeKind {
    frame.reg_type(id)
}

fn operand_as_f32(frame: &Frame<'_>, instr: &Instr, index: usize, slot: Slot) -> f32 {
    match &instr.operands[index] {
        Value::Temp(id) => {
            if temp_type(frame, *id) == TypeKind::F64 {
                slot.f64() as f32
            } else {
                slot.f32()
            }
        }
        value if is_constant_scalar(value) => const_to_f64(value) as f32,
        _ => slot.f32(),
    }
}

fn operand_as_f64(frame: &Frame<'_>, instr: &Instr, index: usize, slot: Slot) -> f64 {
    match &instr.operands[index] {
        Value::Temp(id) => {
            if temp_type(frame, *id) == TypeKind::F32 {
                slot.f32() as f64
            } else {
                slot.f64()
            }
        }
        value if is_constant_scalar(value) => const_to_f64(value),
        _ => slot.f64(),
    }
}

fn operands_prefer_f32(frame: &Frame<'_>, instr: &Instr) -> bool {
    let kind_of = |value: &Value| match value {
        Value::Temp(id) => temp_type(frame, *id),
        _ => TypeKind::Void,
    };
    instr.operands.first().map(kind_of) == Some(TypeKind::F32)
        || instr.operands.get(1).map(kind_of) == Some(TypeKind::F32)
}

fn arith<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    f32_op: impl FnOnce(f32, f32) -> f32,
    f64_op: impl FnOnce(f64, f64) -> f64,
) -> OpResult {
    let lhs_slot = vm.eval(st, &instr.operands[0])?;
    let rhs_slot = vm.eval(st, &instr.operands[1])?;
    let out = if instr.ty == TypeKind::F32 {
        let lhs = operand_as_f32(&st.frame, instr, 0, lhs_slot);
        let rhs = operand_as_f32(&st.frame, instr, 1, rhs_slot);
        Slot::from_f32(f32_op(lhs, rhs))
    } else {
        let lhs = operand_as_f64(&st.frame, instr, 0, lhs_slot);
        let rhs = operand_as_f64(&st.frame, instr, 1, rhs_slot);
        Slot::from_f64(f64_op(lhs, rhs))
    };
    st.frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}

fn float_compare<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    f32_pred: impl FnOnce(f32, f32) -> bool,
    f64_pred: impl FnOnce(f64, f64) -> bool,
) -> OpResult {
    let lhs_slot = vm.eval(st, &instr.operands[0])?;
    let rhs_slot = vm.eval(st, &instr.operands[1])?;
    let result = if operands_prefer_f32(&st.frame, instr) {
        f32_pred(
            operand_as_f32(&st.frame, instr, 0, lhs_slot),
            operand_as_f32(&st.frame, instr, 1, rhs_slot),
        )
    } else {
        f64_pred(
            operand_as_f64(&st.frame, instr, 0, lhs_slot),
            operand_as_f64(&st.frame, instr, 1, rhs_slot),
        )
    };
    st.frame
        .store_result(instr, Slot::from_i64(i64::from(result)));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_fadd<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    arith(vm, st, instr, |l, r| l + r, |l, r| l + r)
}

pub(crate) fn handle_fsub<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    arith(vm, st, instr, |l, r| l - r, |l, r| l - r)
}

pub(crate) fn handle_fmul<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    arith(vm, st, instr, |l, r| l * r, |l, r| l * r)
}

pub(crate) fn handle_fdiv<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    arith(vm, st, instr, |l, r| l / r, |l, r| l / r)
}

macro_rules! float_compare_handlers {
    ($(($name:ident, $op:tt)),+ $(,)?) => { paste::paste! { $(
        pub(crate) fn [<handle_fcmp_ $name>]<'m>(
            vm: &mut Vm<'m>,
            st: &mut ExecState<'m>,
            instr: &'m Instr,
        ) -> OpResult {
            float_compare(vm, st, instr, |l, r| l $op r, |l, r| l $op r)
        }
    )+ } };
}

// Ordered compares: NaN operands yield 0 everywhere except `ne`, whose
// host `!=` is unordered-true.
float_compare_handlers!((eq, ==), (ne, !=), (lt, <), (le, <=), (gt, >), (ge, >=));

pub(crate) fn handle_sitofp<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    let out = if instr.ty == TypeKind::F32 {
        Slot::from_f32(value.i64() as f32)
    } else {
        Slot::from_f64(value.i64() as f64)
    };
    st.frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_fptosi<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    let operand = operand_as_f64(&st.frame, instr, 0, value);
    st.frame.store_result(instr, Slot::from_i64(operand as i64));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_cast_fp_to_si_rte_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    let operand = operand_as_f64(&st.frame, instr, 0, value);
    if !operand.is_finite() {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidCast,
            "invalid fp operand in cast.fp_to_si.rte.chk",
        ));
    }

    let rounded = operand.round_ties_even();
    if rounded < -I64_BOUNDARY || rounded >= I64_BOUNDARY {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::Overflow,
            "fp overflow in cast.fp_to_si.rte.chk",
        ));
    }

    st.frame.store_result(instr, Slot::from_i64(rounded as i64));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_cast_fp_to_ui_rte_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    let operand = operand_as_f64(&st.frame, instr, 0, value);
    if !operand.is_finite() {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidCast,
            "invalid fp operand in cast.fp_to_ui.rte.chk",
        ));
    }

    // Round first: -0.4 rounds to zero and converts, -0.6 is rejected.
    let rounded = operand.round_ties_even();
    if rounded < 0.0 {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidCast,
            "invalid fp operand in cast.fp_to_ui.rte.chk",
        ));
    }
    if rounded >= U64_BOUNDARY {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::Overflow,
            "fp overflow in cast.fp_to_ui.rte.chk",
        ));
    }

    st.frame
        .store_result(instr, Slot::from_i64(rounded as u64 as i64));
    Ok(ExecResult::Continue)
}
