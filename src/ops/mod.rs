//! Per-opcode handlers and the dispatch tables over them.
//!
//! Handlers share one signature and mutate only the supplied execution
//! state. The single `opcode_handlers!` listing below generates both the
//! inline `match` used by the switch strategy and the function-pointer array
//! used by the table strategy, so the two can never drift apart.

pub(crate) mod control_ops;
pub(crate) mod exception_ops;
pub(crate) mod float_ops;
pub(crate) mod int_ops;
pub(crate) mod mem_ops;

use once_cell::sync::Lazy;

use crate::error::TrapKind;
use crate::execution_state::{ExecState, OpResult, Unwind};
use crate::instruction::{Instr, Opcode};
use crate::vm::Vm;

/// Uniform handler signature shared by every opcode.
pub(crate) type OpHandler =
    for<'a, 'm> fn(&'a mut Vm<'m>, &'a mut ExecState<'m>, &'m Instr) -> OpResult;

/// Raise a trap from an opcode handler with the current instruction context.
pub(crate) fn trap<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    kind: TrapKind,
    message: impl Into<String>,
) -> Unwind {
    vm.raise_message(st, kind, 0, message)
}

macro_rules! opcode_handlers {
    ($(($op:ident, $handler:path)),+ $(,)?) => {
        /// Inline dispatch used by the switch strategy.
        pub(crate) fn dispatch_switch<'m>(
            vm: &mut Vm<'m>,
            st: &mut ExecState<'m>,
            instr: &'m Instr,
        ) -> OpResult {
            match instr.op {
                $(Opcode::$op => $handler(vm, st, instr),)+
            }
        }

        /// Indexed dispatch used by the function-table strategy.
        pub(crate) static HANDLER_TABLE: Lazy<[OpHandler; Opcode::COUNT]> = Lazy::new(|| {
            let unimplemented: OpHandler = exception_ops::handle_unimplemented;
            let mut table = [unimplemented; Opcode::COUNT];
            $(table[Opcode::$op as usize] = $handler;)+
            table
        });
    };
}

opcode_handlers! {
    (Add, int_ops::handle_add),
    (Sub, int_ops::handle_sub),
    (Mul, int_ops::handle_mul),
    (IAddOvf, int_ops::handle_iadd_ovf),
    (ISubOvf, int_ops::handle_isub_ovf),
    (IMulOvf, int_ops::handle_imul_ovf),
    (SDiv, int_ops::handle_sdiv),
    (UDiv, int_ops::handle_udiv),
    (SRem, int_ops::handle_srem),
    (URem, int_ops::handle_urem),
    (SDivChk0, int_ops::handle_sdiv_chk0),
    (UDivChk0, int_ops::handle_udiv_chk0),
    (SRemChk0, int_ops::handle_srem_chk0),
    (URemChk0, int_ops::handle_urem_chk0),
    (And, int_ops::handle_and),
    (Or, int_ops::handle_or),
    (Xor, int_ops::handle_xor),
    (Shl, int_ops::handle_shl),
    (LShr, int_ops::handle_lshr),
    (AShr, int_ops::handle_ashr),
    (ICmpEq, int_ops::handle_icmp_eq),
    (ICmpNe, int_ops::handle_icmp_ne),
    (SCmpLt, int_ops::handle_scmp_lt),
    (SCmpLe, int_ops::handle_scmp_le),
    (SCmpGt, int_ops::handle_scmp_gt),
    (SCmpGe, int_ops::handle_scmp_ge),
    (UCmpLt, int_ops::handle_ucmp_lt),
    (UCmpLe, int_ops::handle_ucmp_le),
    (UCmpGt, int_ops::handle_ucmp_gt),
    (UCmpGe, int_ops::handle_ucmp_ge),
    (IdxChk, int_ops::handle_idx_chk),
    (CastSiNarrowChk, int_ops::handle_cast_si_narrow_chk),
    (CastUiNarrowChk, int_ops::handle_cast_ui_narrow_chk),
    (CastSiToFp, int_ops::handle_cast_si_to_fp),
    (CastUiToFp, int_ops::handle_cast_ui_to_fp),
    (Trunc1, int_ops::handle_trunc_or_zext1),
    (Zext1, int_ops::handle_trunc_or_zext1),
    (FAdd, float_ops::handle_fadd),
    (FSub, float_ops::handle_fsub),
    (FMul, float_ops::handle_fmul),
    (FDiv, float_ops::handle_fdiv),
    (FCmpEq, float_ops::handle_fcmp_eq),
    (FCmpNe, float_ops::handle_fcmp_ne),
    (FCmpLt, float_ops::handle_fcmp_lt),
    (FCmpLe, float_ops::handle_fcmp_le),
    (FCmpGt, float_ops::handle_fcmp_gt),
    (FCmpGe, float_ops::handle_fcmp_ge),
    (Sitofp, float_ops::handle_sitofp),
    (Fptosi, float_ops::handle_fptosi),
    (CastFpToSiRteChk, float_ops::handle_cast_fp_to_si_rte_chk),
    (CastFpToUiRteChk, float_ops::handle_cast_fp_to_ui_rte_chk),
    (Alloca, mem_ops::handle_alloca),
    (Load, mem_ops::handle_load),
    (Store, mem_ops::handle_store),
    (Gep, mem_ops::handle_gep),
    (ConstStr, mem_ops::handle_const_str),
    (ConstNull, mem_ops::handle_const_null),
    (AddrOf, mem_ops::handle_addr_of),
    (GAddr, mem_ops::handle_gaddr),
    (Br, control_ops::handle_br),
    (CBr, control_ops::handle_cbr),
    (SwitchI32, control_ops::handle_switch_i32),
    (Ret, control_ops::handle_ret),
    (Call, control_ops::handle_call),
    (EhPush, exception_ops::handle_eh_push),
    (EhPop, exception_ops::handle_eh_pop),
    (EhEntry, exception_ops::handle_eh_entry),
    (ResumeSame, exception_ops::handle_resume_same),
    (ResumeNext, exception_ops::handle_resume_next),
    (ResumeLabel, exception_ops::handle_resume_label),
    (Trap, exception_ops::handle_trap),
    (TrapErr, exception_ops::handle_trap_err),
    (TrapFromErr, exception_ops::handle_trap),
    (TrapKind, exception_ops::handle_trap_kind),
    (ErrGetKind, exception_ops::handle_err_get),
    (ErrGetCode, exception_ops::handle_err_get),
    (ErrGetIp, exception_ops::handle_err_get),
    (ErrGetLine, exception_ops::handle_err_get),
}
