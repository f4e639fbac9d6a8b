//! Runtime helper descriptors and the symbol registry.
//!
//! Descriptors pair a signature with a C-style handler: every handler takes
//! an array of pointers to argument payloads and a pointer to a result buffer
//! typed by the signature's return kind. The registry carries the helpers the
//! core itself depends on; hosts discover everything else through the same
//! table.

use std::io::Write;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::rt_string::{
    rt_const_cstr, rt_len, rt_str_release_maybe, rt_str_retain_maybe, rt_string_cstr,
    rt_string_from_bytes, RtStr,
};
use crate::types::TypeKind;

/// Runtime call ABI: `handler(args, result)`.
///
/// `args[i]` points at the 64-bit payload of the i-th argument slot; `result`
/// points at a buffer of the return kind, or is null for void. Pow-class
/// handlers receive one extra trailing pointer to a `bool` status flag.
pub type RuntimeHandler = unsafe fn(args: &[*mut u8], result: *mut u8);

/// Parameter and return kinds of a runtime helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSignature {
    /// Parameter kinds in call order.
    pub params: Vec<TypeKind>,
    /// Return kind.
    pub ret: TypeKind,
}

/// A registered runtime helper.
pub struct RuntimeDescriptor {
    /// Symbol name.
    pub name: &'static str,
    /// Call signature.
    pub signature: RuntimeSignature,
    /// Handler invoked through the call ABI.
    pub handler: RuntimeHandler,
    /// True for pow-class helpers whose status flag the bridge classifies.
    pub pow_class: bool,
}

unsafe fn arg_i64(args: &[*mut u8], index: usize) -> i64 {
    *(args[index] as *const i64)
}

unsafe fn arg_f64(args: &[*mut u8], index: usize) -> f64 {
    *(args[index] as *const f64)
}

unsafe fn arg_addr(args: &[*mut u8], index: usize) -> usize {
    *(args[index] as *const usize)
}

unsafe fn arg_str(args: &[*mut u8], index: usize) -> RtStr {
    arg_addr(args, index) as RtStr
}

unsafe fn write_i64(result: *mut u8, value: i64) {
    if !result.is_null() {
        *(result as *mut i64) = value;
    }
}

unsafe fn write_f64(result: *mut u8, value: f64) {
    if !result.is_null() {
        *(result as *mut f64) = value;
    }
}

unsafe fn write_addr(result: *mut u8, value: usize) {
    if !result.is_null() {
        *(result as *mut usize) = value;
    }
}

unsafe fn cstr_bytes(ptr: *const u8) -> &'static [u8] {
    if ptr.is_null() {
        return &[];
    }
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    std::slice::from_raw_parts(ptr, len)
}

unsafe fn handler_len(args: &[*mut u8], result: *mut u8) {
    write_i64(result, rt_len(arg_str(args, 0)));
}

unsafe fn handler_abort(args: &[*mut u8], _result: *mut u8) {
    let message = cstr_bytes(arg_addr(args, 0) as *const u8);
    let _ = std::io::stderr().write_all(message);
    let _ = std::io::stderr().write_all(b"\n");
    std::process::abort();
}

unsafe fn handler_string_from_bytes(args: &[*mut u8], result: *mut u8) {
    let data = arg_addr(args, 0) as *const u8;
    let len = arg_i64(args, 1).max(0) as usize;
    let bytes = if data.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    write_addr(result, rt_string_from_bytes(bytes) as usize);
}

unsafe fn handler_const_cstr(args: &[*mut u8], result: *mut u8) {
    let bytes = cstr_bytes(arg_addr(args, 0) as *const u8);
    write_addr(result, rt_const_cstr(bytes) as usize);
}

unsafe fn handler_string_cstr(args: &[*mut u8], result: *mut u8) {
    write_addr(result, rt_string_cstr(arg_str(args, 0)) as usize);
}

unsafe fn handler_retain(args: &[*mut u8], _result: *mut u8) {
    rt_str_retain_maybe(arg_str(args, 0));
}

unsafe fn handler_release(args: &[*mut u8], _result: *mut u8) {
    rt_str_release_maybe(arg_str(args, 0));
}

unsafe fn handler_print_str(args: &[*mut u8], _result: *mut u8) {
    let handle = arg_str(args, 0);
    let data = rt_string_cstr(handle);
    let len = rt_len(handle).max(0) as usize;
    if !data.is_null() {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(std::slice::from_raw_parts(data, len));
    }
}

unsafe fn handler_print_i64(args: &[*mut u8], _result: *mut u8) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{}", arg_i64(args, 0));
}

unsafe fn handler_print_f64(args: &[*mut u8], _result: *mut u8) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{}", arg_f64(args, 0));
}

unsafe fn handler_abs_i64(args: &[*mut u8], result: *mut u8) {
    write_i64(result, arg_i64(args, 0).wrapping_abs());
}

unsafe fn handler_abs_f64(args: &[*mut u8], result: *mut u8) {
    write_f64(result, arg_f64(args, 0).abs());
}

unsafe fn handler_int_to_str(args: &[*mut u8], result: *mut u8) {
    let text = arg_i64(args, 0).to_string();
    write_addr(result, rt_string_from_bytes(text.as_bytes()) as usize);
}

unsafe fn handler_concat(args: &[*mut u8], result: *mut u8) {
    let lhs = arg_str(args, 0);
    let rhs = arg_str(args, 1);
    let mut bytes = Vec::with_capacity((rt_len(lhs) + rt_len(rhs)).max(0) as usize);
    for handle in [lhs, rhs] {
        let data = rt_string_cstr(handle);
        if !data.is_null() {
            bytes.extend_from_slice(std::slice::from_raw_parts(
                data,
                rt_len(handle).max(0) as usize,
            ));
        }
    }
    write_addr(result, rt_string_from_bytes(&bytes) as usize);
}

unsafe fn handler_pow_f64_chkdom(args: &[*mut u8], result: *mut u8) {
    let base = arg_f64(args, 0);
    let exponent = arg_f64(args, 1);
    // Trailing pointer is the status flag appended by the marshaller.
    let ok = args[2] as *mut bool;
    let value = base.powf(exponent);
    *ok = !((base == 0.0 && exponent < 0.0)
        || (base < 0.0 && exponent.fract() != 0.0)
        || (value.is_infinite() && base.is_finite() && exponent.is_finite()));
    write_f64(result, value);
}

fn descriptor(
    name: &'static str,
    params: Vec<TypeKind>,
    ret: TypeKind,
    handler: RuntimeHandler,
) -> (&'static str, RuntimeDescriptor) {
    (
        name,
        RuntimeDescriptor {
            name,
            signature: RuntimeSignature { params, ret },
            handler,
            pow_class: false,
        },
    )
}

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, RuntimeDescriptor> = {
        use TypeKind::*;
        let mut table = HashMap::new();
        for (name, desc) in [
            descriptor("rt_len", vec![Str], I64, handler_len),
            descriptor("rt_abort", vec![Ptr], Void, handler_abort),
            descriptor(
                "rt_string_from_bytes",
                vec![Ptr, I64],
                Str,
                handler_string_from_bytes,
            ),
            descriptor("rt_const_cstr", vec![Ptr], Str, handler_const_cstr),
            descriptor("rt_string_cstr", vec![Str], Ptr, handler_string_cstr),
            descriptor("rt_str_retain_maybe", vec![Str], Void, handler_retain),
            descriptor("rt_str_release_maybe", vec![Str], Void, handler_release),
            descriptor("rt_print_str", vec![Str], Void, handler_print_str),
            descriptor("rt_print_i64", vec![I64], Void, handler_print_i64),
            descriptor("rt_print_f64", vec![F64], Void, handler_print_f64),
            descriptor("rt_abs_i64", vec![I64], I64, handler_abs_i64),
            descriptor("rt_abs_f64", vec![F64], F64, handler_abs_f64),
            descriptor("rt_int_to_str", vec![I64], Str, handler_int_to_str),
            descriptor("rt_concat", vec![Str, Str], Str, handler_concat),
        ] {
            table.insert(name, desc);
        }
        table.insert(
            "rt_pow_f64_chkdom",
            RuntimeDescriptor {
                name: "rt_pow_f64_chkdom",
                signature: RuntimeSignature {
                    params: vec![F64, F64],
                    ret: F64,
                },
                handler: handler_pow_f64_chkdom,
                pow_class: true,
            },
        );
        table
    };
}

/// Look up a runtime helper descriptor by symbol name.
pub fn find_runtime_descriptor(name: &str) -> Option<&'static RuntimeDescriptor> {
    REGISTRY.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let desc = find_runtime_descriptor("rt_len").unwrap();
        assert_eq!(desc.signature.params, vec![TypeKind::Str]);
        assert_eq!(desc.signature.ret, TypeKind::I64);
        assert!(!desc.pow_class);

        assert!(find_runtime_descriptor("rt_pow_f64_chkdom").unwrap().pow_class);
        assert!(find_runtime_descriptor("rt_nope").is_none());
    }
}
