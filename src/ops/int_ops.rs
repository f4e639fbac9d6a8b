//! Integer arithmetic, bitwise, comparison, bounds, and conversion handlers.
//!
//! Unchecked arithmetic wraps in two's complement in the instruction's lane
//! width; the `.ovf` and `.chk0` families raise structured traps instead.

use crate::error::TrapKind;
use crate::execution_state::{ExecResult, ExecState, OpResult};
use crate::instruction::{Instr, Opcode};
use crate::ops;
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::vm::Vm;

fn binary<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    compute: impl FnOnce(i64, i64) -> i64,
) -> OpResult {
    let lhs = vm.eval(st, &instr.operands[0])?;
    let rhs = vm.eval(st, &instr.operands[1])?;
    st.frame
        .store_result(instr, Slot::from_i64(compute(lhs.i64(), rhs.i64())));
    Ok(ExecResult::Continue)
}

fn compare<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    predicate: impl FnOnce(i64, i64) -> bool,
) -> OpResult {
    let lhs = vm.eval(st, &instr.operands[0])?;
    let rhs = vm.eval(st, &instr.operands[1])?;
    let out = if predicate(lhs.i64(), rhs.i64()) { 1 } else { 0 };
    st.frame.store_result(instr, Slot::from_i64(out));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_add<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l.wrapping_add(r))
}

pub(crate) fn handle_sub<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l.wrapping_sub(r))
}

pub(crate) fn handle_mul<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l.wrapping_mul(r))
}

/// Apply a checked operation in the instruction's lane width.
macro_rules! lane_checked {
    ($kind:expr, $lhs:expr, $rhs:expr, $method:ident) => {
        match $kind {
            TypeKind::I16 => ($lhs as i16).$method($rhs as i16).map(|v| v as i64),
            TypeKind::I32 => ($lhs as i32).$method($rhs as i32).map(|v| v as i64),
            _ => $lhs.$method($rhs),
        }
    };
}

fn overflowing_binary<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    message: &'static str,
    checked: impl FnOnce(TypeKind, i64, i64) -> Option<i64>,
) -> OpResult {
    let lhs = vm.eval(st, &instr.operands[0])?;
    let rhs = vm.eval(st, &instr.operands[1])?;
    match checked(instr.ty, lhs.i64(), rhs.i64()) {
        Some(value) => {
            st.frame.store_result(instr, Slot::from_i64(value));
            Ok(ExecResult::Continue)
        }
        None => Err(ops::trap(vm, st, TrapKind::Overflow, message)),
    }
}

pub(crate) fn handle_iadd_ovf<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    overflowing_binary(vm, st, instr, "integer overflow in iadd.ovf", |kind, l, r| {
        lane_checked!(kind, l, r, checked_add)
    })
}

pub(crate) fn handle_isub_ovf<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    overflowing_binary(vm, st, instr, "integer overflow in isub.ovf", |kind, l, r| {
        lane_checked!(kind, l, r, checked_sub)
    })
}

pub(crate) fn handle_imul_ovf<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    overflowing_binary(vm, st, instr, "integer overflow in imul.ovf", |kind, l, r| {
        lane_checked!(kind, l, r, checked_mul)
    })
}

#[derive(Clone, Copy)]
enum SignedDivKind {
    Quotient,
    Remainder,
}

/// Signed division or remainder in the instruction's lane width.
///
/// A zero divisor raises `DivideByZero`. Dividing the lane minimum by -1
/// raises `Overflow` for quotients; remainders keep the dividend's sign and
/// define that case as 0.
fn signed_div_rem<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    kind: SignedDivKind,
) -> OpResult {
    let lhs = vm.eval(st, &instr.operands[0])?;
    let rhs = vm.eval(st, &instr.operands[1])?;
    let mnemonic = instr.op.mnemonic();

    macro_rules! divide {
        ($l:expr, $r:expr, $min:expr) => {{
            if $r == 0 {
                return Err(ops::trap(
                    vm,
                    st,
                    TrapKind::DivideByZero,
                    format!("divide by zero in {mnemonic}"),
                ));
            }
            match kind {
                SignedDivKind::Quotient => {
                    if $l == $min && $r == -1 {
                        return Err(ops::trap(
                            vm,
                            st,
                            TrapKind::Overflow,
                            format!("integer overflow in {mnemonic}"),
                        ));
                    }
                    ($l / $r) as i64
                }
                // Remainder keeps the dividend's sign; MIN % -1 is defined as 0.
                SignedDivKind::Remainder => $l.wrapping_rem($r) as i64,
            }
        }};
    }

    let out = match instr.ty {
        TypeKind::I16 => {
            let l = lhs.i64() as i16;
            let r = rhs.i64() as i16;
            divide!(l, r, i16::MIN)
        }
        TypeKind::I32 => {
            let l = lhs.i64() as i32;
            let r = rhs.i64() as i32;
            divide!(l, r, i32::MIN)
        }
        _ => {
            let l = lhs.i64();
            let r = rhs.i64();
            divide!(l, r, i64::MIN)
        }
    };
    st.frame.store_result(instr, Slot::from_i64(out));
    Ok(ExecResult::Continue)
}

fn unsigned_div_rem<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    compute: impl FnOnce(u64, u64) -> u64,
) -> OpResult {
    let lhs = vm.eval(st, &instr.operands[0])?;
    let rhs = vm.eval(st, &instr.operands[1])?;
    let divisor = rhs.i64() as u64;
    if divisor == 0 {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::DivideByZero,
            format!("divide by zero in {}", instr.op.mnemonic()),
        ));
    }
    let dividend = lhs.i64() as u64;
    st.frame
        .store_result(instr, Slot::from_i64(compute(dividend, divisor) as i64));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_sdiv<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    signed_div_rem(vm, st, instr, SignedDivKind::Quotient)
}

pub(crate) fn handle_srem<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    signed_div_rem(vm, st, instr, SignedDivKind::Remainder)
}

pub(crate) fn handle_sdiv_chk0<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    signed_div_rem(vm, st, instr, SignedDivKind::Quotient)
}

pub(crate) fn handle_srem_chk0<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    signed_div_rem(vm, st, instr, SignedDivKind::Remainder)
}

pub(crate) fn handle_udiv<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    unsigned_div_rem(vm, st, instr, |l, r| l / r)
}

pub(crate) fn handle_urem<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    unsigned_div_rem(vm, st, instr, |l, r| l % r)
}

pub(crate) fn handle_udiv_chk0<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    unsigned_div_rem(vm, st, instr, |l, r| l / r)
}

pub(crate) fn handle_urem_chk0<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    unsigned_div_rem(vm, st, instr, |l, r| l % r)
}

pub(crate) fn handle_and<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l & r)
}

pub(crate) fn handle_or<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l | r)
}

pub(crate) fn handle_xor<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| l ^ r)
}

pub(crate) fn handle_shl<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>, instr: &'m Instr) -> OpResult {
    binary(vm, st, instr, |l, r| {
        ((l as u64) << ((r as u64) & 63)) as i64
    })
}

pub(crate) fn handle_lshr<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    binary(vm, st, instr, |l, r| {
        ((l as u64) >> ((r as u64) & 63)) as i64
    })
}

pub(crate) fn handle_ashr<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    binary(vm, st, instr, |l, r| l >> ((r as u64) & 63))
}

pub(crate) fn handle_icmp_eq<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    compare(vm, st, instr, |l, r| l == r)
}

pub(crate) fn handle_icmp_ne<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    compare(vm, st, instr, |l, r| l != r)
}

macro_rules! signed_compare_handlers {
    ($(($name:ident, $op:tt)),+ $(,)?) => { paste::paste! { $(
        pub(crate) fn [<handle_scmp_ $name>]<'m>(
            vm: &mut Vm<'m>,
            st: &mut ExecState<'m>,
            instr: &'m Instr,
        ) -> OpResult {
            compare(vm, st, instr, |l, r| l $op r)
        }
    )+ } };
}

macro_rules! unsigned_compare_handlers {
    ($(($name:ident, $op:tt)),+ $(,)?) => { paste::paste! { $(
        pub(crate) fn [<handle_ucmp_ $name>]<'m>(
            vm: &mut Vm<'m>,
            st: &mut ExecState<'m>,
            instr: &'m Instr,
        ) -> OpResult {
            compare(vm, st, instr, |l, r| (l as u64) $op (r as u64))
        }
    )+ } };
}

signed_compare_handlers!((lt, <), (le, <=), (gt, >), (ge, >=));
unsigned_compare_handlers!((lt, <), (le, <=), (gt, >), (ge, >=));

pub(crate) fn handle_idx_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let idx = vm.eval(st, &instr.operands[0])?;
    let lo = vm.eval(st, &instr.operands[1])?;
    let hi = vm.eval(st, &instr.operands[2])?;

    let normalized = match instr.ty {
        TypeKind::I16 => {
            let i = idx.i64() as i16;
            let l = lo.i64() as i16;
            let h = hi.i64() as i16;
            (i >= l && i < h).then(|| i.wrapping_sub(l) as i64)
        }
        TypeKind::I32 => {
            let i = idx.i64() as i32;
            let l = lo.i64() as i32;
            let h = hi.i64() as i32;
            (i >= l && i < h).then(|| i.wrapping_sub(l) as i64)
        }
        _ => {
            let i = idx.i64();
            let l = lo.i64();
            let h = hi.i64();
            (i >= l && i < h).then(|| i.wrapping_sub(l))
        }
    };

    match normalized {
        Some(value) => {
            st.frame.store_result(instr, Slot::from_i64(value));
            Ok(ExecResult::Continue)
        }
        None => Err(vm.raise_message(st, TrapKind::Bounds, 0, "")),
    }
}

fn narrow_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
    signed: bool,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    let raw = value.i64();
    let (out_of_range_msg, unsupported_msg) = if signed {
        (
            "value out of range in cast.si_narrow.chk",
            "unsupported target type in cast.si_narrow.chk",
        )
    } else {
        (
            "value out of range in cast.ui_narrow.chk",
            "unsupported target type in cast.ui_narrow.chk",
        )
    };

    let narrowed = match instr.ty {
        TypeKind::I16 => {
            if signed {
                i16::try_from(raw).ok().map(|v| v as i64)
            } else {
                u16::try_from(raw as u64).ok().map(|v| v as i64)
            }
        }
        TypeKind::I32 => {
            if signed {
                i32::try_from(raw).ok().map(|v| v as i64)
            } else {
                u32::try_from(raw as u64).ok().map(|v| v as i64)
            }
        }
        TypeKind::I1 => {
            let in_range = if signed {
                raw == 0 || raw == 1
            } else {
                (raw as u64) <= 1
            };
            in_range.then_some(raw & 1)
        }
        TypeKind::I64 => Some(raw),
        _ => {
            return Err(ops::trap(vm, st, TrapKind::InvalidCast, unsupported_msg));
        }
    };

    match narrowed {
        Some(value) => {
            st.frame.store_result(instr, Slot::from_i64(value));
            Ok(ExecResult::Continue)
        }
        None => Err(ops::trap(vm, st, TrapKind::InvalidCast, out_of_range_msg)),
    }
}

pub(crate) fn handle_cast_si_narrow_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    narrow_chk(vm, st, instr, true)
}

pub(crate) fn handle_cast_ui_narrow_chk<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    narrow_chk(vm, st, instr, false)
}

pub(crate) fn handle_cast_si_to_fp<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    st.frame
        .store_result(instr, Slot::from_f64(value.i64() as f64));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_cast_ui_to_fp<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    st.frame
        .store_result(instr, Slot::from_f64(value.i64() as u64 as f64));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_trunc_or_zext1<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let operand = vm.eval(st, &instr.operands[0])?;
    let out = match instr.op {
        Opcode::Zext1 => i64::from(operand.i64() != 0),
        _ => operand.i64() & 1,
    };
    st.frame.store_result(instr, Slot::from_i64(out));
    Ok(ExecResult::Continue)
}
