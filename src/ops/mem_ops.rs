//! Memory and pointer opcode handlers.
//!
//! Stack allocations stay inside the frame arena, loads and stores validate
//! null and alignment before touching memory, and string stores keep the
//! reference-count discipline of the register file.

use crate::error::TrapKind;
use crate::execution_state::{ExecResult, ExecState, OpResult};
use crate::instruction::Instr;
use crate::ops;
use crate::rt_string::{rt_str_release_maybe, rt_str_retain_maybe, RtStr};
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::value::Value;
use crate::vm::Vm;

/// Alignment applied to every arena allocation, matching `max_align_t`.
const ALLOCA_ALIGN: usize = 16;

/// Read a typed slot from an arbitrary pointer.
///
/// Alignment is validated by the caller; unaligned reads are still performed
/// bytewise so no aliasing assumptions leak in. Narrow integers widen into
/// the slot, `i1` is canonicalised to its low bit.
fn load_slot_from_ptr(kind: TypeKind, ptr: *const u8) -> Slot {
    unsafe {
        match kind {
            TypeKind::I1 => Slot::from_i64((std::ptr::read_unaligned(ptr) & 1) as i64),
            TypeKind::I16 => {
                Slot::from_i64(std::ptr::read_unaligned(ptr as *const i16) as i64)
            }
            TypeKind::I32 => {
                Slot::from_i64(std::ptr::read_unaligned(ptr as *const i32) as i64)
            }
            TypeKind::I64 => Slot::from_i64(std::ptr::read_unaligned(ptr as *const i64)),
            TypeKind::F32 => Slot::from_f32(std::ptr::read_unaligned(ptr as *const f32)),
            TypeKind::F64 => Slot::from_f64(std::ptr::read_unaligned(ptr as *const f64)),
            TypeKind::Str | TypeKind::Ptr | TypeKind::Error | TypeKind::ResumeTok => {
                Slot::from_addr(std::ptr::read_unaligned(ptr as *const usize))
            }
            TypeKind::Void => Slot::zero(),
        }
    }
}

/// Store a slot into memory with type-aware conversion.
///
/// String stores release the previously stored handle, retain the incoming
/// one, and only then overwrite the bytes.
fn store_slot_to_ptr(kind: TypeKind, ptr: *mut u8, value: Slot) {
    unsafe {
        match kind {
            TypeKind::I1 => std::ptr::write_unaligned(ptr, (value.i64() & 1) as u8),
            TypeKind::I16 => std::ptr::write_unaligned(ptr as *mut i16, value.i64() as i16),
            TypeKind::I32 => std::ptr::write_unaligned(ptr as *mut i32, value.i64() as i32),
            TypeKind::I64 => std::ptr::write_unaligned(ptr as *mut i64, value.i64()),
            TypeKind::F32 => std::ptr::write_unaligned(ptr as *mut f32, value.f32()),
            TypeKind::F64 => std::ptr::write_unaligned(ptr as *mut f64, value.f64()),
            TypeKind::Str => {
                let current = std::ptr::read_unaligned(ptr as *const usize) as RtStr;
                let incoming = value.str_handle();
                rt_str_retain_maybe(incoming);
                rt_str_release_maybe(current);
                std::ptr::write_unaligned(ptr as *mut usize, incoming as usize);
            }
            TypeKind::Ptr | TypeKind::Error | TypeKind::ResumeTok => {
                std::ptr::write_unaligned(ptr as *mut usize, value.addr());
            }
            TypeKind::Void => {}
        }
    }
}

fn misaligned(ptr: usize, alignment: usize) -> bool {
    alignment > 1 && ptr & (alignment - 1) != 0
}

pub(crate) fn handle_alloca<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    if instr.operands.is_empty() {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::DomainError,
            "missing allocation size",
        ));
    }

    let bytes = vm.eval(st, &instr.operands[0])?.i64();
    if bytes < 0 {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::DomainError,
            "negative allocation",
        ));
    }
    let size = bytes as usize;

    let frame = &mut st.frame;
    let stack_size = frame.stack.len();
    let addr = frame.sp;

    let aligned = match addr.checked_add(ALLOCA_ALIGN - 1) {
        Some(v) => v & !(ALLOCA_ALIGN - 1),
        None => stack_size + 1,
    };
    if aligned > stack_size || size > stack_size - aligned {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::Overflow,
            "stack overflow in alloca",
        ));
    }

    frame.stack[aligned..aligned + size].fill(0);
    let out = Slot::from_ptr(unsafe { frame.stack.as_mut_ptr().add(aligned) });
    frame.sp = aligned + size;
    frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_load<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let ptr = vm.eval(st, &instr.operands[0])?.ptr();
    if ptr.is_null() {
        return Err(ops::trap(vm, st, TrapKind::InvalidOperation, "null load"));
    }
    if misaligned(ptr as usize, instr.ty.alignment()) {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "misaligned load",
        ));
    }

    let value = load_slot_from_ptr(instr.ty, ptr);
    st.frame.store_result(instr, value);
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_store<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let ptr = vm.eval(st, &instr.operands[0])?.ptr();
    if ptr.is_null() {
        return Err(ops::trap(vm, st, TrapKind::InvalidOperation, "null store"));
    }
    if misaligned(ptr as usize, instr.ty.alignment()) {
        return Err(ops::trap(
            vm,
            st,
            TrapKind::InvalidOperation,
            "misaligned store",
        ));
    }

    let value = vm.eval(st, &instr.operands[1])?;

    // Fast-path flags let untouched runs skip all watch bookkeeping.
    if vm.debug.has_mem_watches() {
        let write_size = instr.ty.size();
        if write_size != 0 {
            vm.debug.on_mem_write(ptr as usize, write_size);
        }
    }

    store_slot_to_ptr(instr.ty, ptr, value);

    if vm.debug.has_var_watches() {
        if let Some(Value::Temp(id)) = instr.operands.first() {
            if let Some(name) = st.frame.func.value_names.get(*id as usize) {
                if !name.is_empty() {
                    let func = st.frame.func.name.clone();
                    let block = st.block_label();
                    vm.debug.on_store(
                        name,
                        instr.ty,
                        value.i64(),
                        value.f64(),
                        &func,
                        block,
                        st.ip,
                    );
                }
            }
        }
    }

    Ok(ExecResult::Continue)
}

pub(crate) fn handle_gep<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let base = vm.eval(st, &instr.operands[0])?;
    let offset = vm.eval(st, &instr.operands[1])?;

    // Null base with zero offset stays null. A non-zero offset from null is
    // the offset reinterpreted as an address, used for well-known locations.
    let out = if base.ptr().is_null() && offset.i64() == 0 {
        Slot::zero()
    } else {
        Slot::from_addr((base.addr() as u64).wrapping_add(offset.i64() as u64) as usize)
    };
    st.frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_const_str<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let out = vm.eval(st, &instr.operands[0])?;
    st.frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_const_null<'m>(
    _vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    st.frame.store_result(instr, Slot::zero());
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_addr_of<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let value = vm.eval(st, &instr.operands[0])?;
    st.frame
        .store_result(instr, Slot::from_addr(value.str_handle() as usize));
    Ok(ExecResult::Continue)
}

pub(crate) fn handle_gaddr<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    instr: &'m Instr,
) -> OpResult {
    let out = vm.eval(st, &instr.operands[0])?;
    st.frame.store_result(instr, out);
    Ok(ExecResult::Continue)
}
