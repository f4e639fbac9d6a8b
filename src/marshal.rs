//! Conversion between VM slots and the runtime call ABI.
//!
//! Centralising the conversions keeps the bridge consistent and documents
//! ownership for the temporary views handed to opcode handlers: views borrow
//! the runtime string's storage and must not outlive the handle.

use crate::error::TrapKind;
use crate::rt_string::{
    rt_const_cstr, rt_len, rt_string_cstr, rt_string_from_bytes, RtStr,
};
use crate::runtime_registry::{RuntimeDescriptor, RuntimeSignature};
use crate::slot::Slot;
use crate::types::TypeKind;
use crate::value::Value;

/// Maximum number of bytes the VM is willing to expose from a runtime string.
///
/// Larger reported lengths are treated as corrupted handles.
pub const MAX_BRIDGE_STRING_BYTES: u64 = i32::MAX as u64;

/// A marshalling failure, raised as a trap by in-VM callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshalError {
    /// Trap classification the failure maps to.
    pub kind: TrapKind,
    /// Diagnostic text.
    pub message: String,
}

impl MarshalError {
    fn domain<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TrapKind::DomainError,
            message: message.into(),
        }
    }
}

/// Convert an immutable VM string view into a runtime handle.
///
/// `None` (a view without backing storage) maps to the null handle. An empty
/// view with backing storage produces a fresh zero-length heap handle. Views
/// with embedded NULs allocate, because the literal fast path hands out
/// C-compatible payloads; everything else returns the interned literal-backed
/// handle.
pub fn to_runtime_string(view: Option<&[u8]>) -> RtStr {
    let Some(bytes) = view else {
        return std::ptr::null_mut();
    };
    if bytes.is_empty() {
        return rt_string_from_bytes(bytes);
    }
    if bytes.contains(&0) {
        return rt_string_from_bytes(bytes);
    }
    rt_const_cstr(bytes)
}

/// Convert a runtime string handle back into a borrowed byte view.
///
/// Null handles yield an empty view. A negative reported length raises
/// `DomainError`. The caller must ensure the handle outlives the view.
pub fn from_runtime_string(handle: RtStr) -> Result<&'static [u8], MarshalError> {
    if handle.is_null() {
        return Ok(&[]);
    }
    let data = rt_string_cstr(handle);
    if data.is_null() {
        return Ok(&[]);
    }
    let length = rt_len(handle);
    if length < 0 || length as u64 > MAX_BRIDGE_STRING_BYTES {
        return Err(MarshalError::domain("rt_string reported negative length"));
    }
    Ok(unsafe { std::slice::from_raw_parts(data, length as usize) })
}

/// Buffers for a runtime call's return value, one lane per ABI kind.
#[derive(Debug, Default)]
pub struct ResultBuffers {
    /// Integer family result.
    pub i64: i64,
    /// Floating-point result.
    pub f64: f64,
    /// String-handle result, stored as an address.
    pub str_addr: usize,
    /// Raw-pointer result, stored as an address.
    pub ptr_addr: usize,
}

impl ResultBuffers {
    /// String-handle view of the result.
    pub fn str_handle(&self) -> RtStr {
        self.str_addr as RtStr
    }
}

/// Tracks the status flag of a `pow`-class runtime call.
#[derive(Debug, Default)]
pub struct PowStatus {
    /// True when the callee is pow-class and a flag was appended.
    pub active: bool,
    /// Status written by the callee; false signals an exceptional result.
    pub ok: bool,
}

/// A trap classified from a failed `pow`-class call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowTrapOutcome {
    /// Trap classification.
    pub kind: TrapKind,
    /// Diagnostic text.
    pub message: String,
}

/// Validate arity and build the argument-pointer array for a runtime call.
///
/// Each returned pointer addresses the corresponding slot's 64-bit payload,
/// laid out for the callee's parameter kind. For pow-class calls a pointer to
/// the status flag is appended after the declared parameters. The pointers
/// borrow `args` and `pow`; invoke the handler before touching either again.
pub fn marshal_arguments(
    sig: &RuntimeSignature,
    callee: &str,
    args: &mut [Slot],
    pow: &mut PowStatus,
) -> Result<Vec<*mut u8>, MarshalError> {
    let expected = sig.params.len();
    if args.len() != expected {
        let mut message = format!(
            "{callee}: expected {expected} argument(s), got {}",
            args.len()
        );
        if args.len() > expected {
            message.push_str(" (excess runtime operands)");
        }
        return Err(MarshalError::domain(message));
    }

    let mut raw = Vec::with_capacity(args.len() + usize::from(pow.active));
    for slot in args.iter_mut() {
        raw.push(slot.payload_ptr());
    }
    if pow.active {
        pow.ok = true;
        raw.push(&mut pow.ok as *mut bool as *mut u8);
    }
    Ok(raw)
}

/// Pointer to the result buffer lane matching a return kind, or null for void.
pub fn result_buffer_for(kind: TypeKind, buffers: &mut ResultBuffers) -> *mut u8 {
    match kind {
        TypeKind::Void => std::ptr::null_mut(),
        TypeKind::I1 | TypeKind::I16 | TypeKind::I32 | TypeKind::I64 => {
            &mut buffers.i64 as *mut i64 as *mut u8
        }
        TypeKind::F32 | TypeKind::F64 => &mut buffers.f64 as *mut f64 as *mut u8,
        TypeKind::Str => &mut buffers.str_addr as *mut usize as *mut u8,
        TypeKind::Ptr | TypeKind::Error | TypeKind::ResumeTok => {
            &mut buffers.ptr_addr as *mut usize as *mut u8
        }
    }
}

/// Convert the populated result buffer into a slot; void returns zero.
pub fn assign_call_result(sig: &RuntimeSignature, buffers: &ResultBuffers) -> Slot {
    match sig.ret {
        TypeKind::Void => Slot::zero(),
        TypeKind::I1 | TypeKind::I16 | TypeKind::I32 | TypeKind::I64 => {
            Slot::from_i64(buffers.i64)
        }
        TypeKind::F32 => Slot::from_f32(buffers.f64 as f32),
        TypeKind::F64 => Slot::from_f64(buffers.f64),
        TypeKind::Str => Slot::from_addr(buffers.str_addr),
        TypeKind::Ptr | TypeKind::Error | TypeKind::ResumeTok => Slot::from_addr(buffers.ptr_addr),
    }
}

/// Classify an exceptional `pow`-class result into a VM trap.
///
/// Only fires when the callee is pow-class and reported failure. Zero raised
/// to a negative exponent and a negative base with a non-integer exponent are
/// domain errors; an infinite result from finite inputs is an overflow.
pub fn classify_pow_trap(
    desc: &RuntimeDescriptor,
    pow: &PowStatus,
    args: &[Slot],
    buffers: &ResultBuffers,
) -> Option<PowTrapOutcome> {
    if !desc.pow_class || !pow.active || pow.ok {
        return None;
    }
    let base = args.first().map(|s| s.f64()).unwrap_or(0.0);
    let exponent = args.get(1).map(|s| s.f64()).unwrap_or(0.0);

    if base == 0.0 && exponent < 0.0 {
        return Some(PowTrapOutcome {
            kind: TrapKind::DomainError,
            message: format!("{}: zero raised to a negative exponent", desc.name),
        });
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Some(PowTrapOutcome {
            kind: TrapKind::DomainError,
            message: format!("{}: negative base with non-integer exponent", desc.name),
        });
    }
    if buffers.f64.is_infinite() && base.is_finite() && exponent.is_finite() {
        return Some(PowTrapOutcome {
            kind: TrapKind::Overflow,
            message: format!("{}: result out of range", desc.name),
        });
    }
    Some(PowTrapOutcome {
        kind: TrapKind::DomainError,
        message: format!("{}: domain error", desc.name),
    })
}

/// True for operand kinds convertible by [`const_to_i64`] / [`const_to_f64`].
pub fn is_constant_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::ConstInt(_) | Value::ConstFloat(_) | Value::Null
    )
}

/// Coerce a constant scalar operand to i64, truncating floats toward zero.
pub fn const_to_i64(value: &Value) -> i64 {
    match value {
        Value::ConstInt(v) => *v,
        Value::ConstFloat(v) => *v as i64,
        Value::Null => 0,
        _ => {
            debug_assert!(false, "value kind is not convertible to i64");
            0
        }
    }
}

/// Coerce a constant scalar operand to f64.
pub fn const_to_f64(value: &Value) -> f64 {
    match value {
        Value::ConstFloat(v) => *v,
        Value::ConstInt(v) => *v as f64,
        Value::Null => 0.0,
        _ => {
            debug_assert!(false, "value kind is not convertible to f64");
            0.0
        }
    }
}
