//! Reference-counted runtime string handles.
//!
//! The VM's only owned runtime resource. Handles are raw pointers so they can
//! round-trip through slots, block-parameter staging, and raw memory exactly
//! like every other operand. Heap handles carry an atomic reference count;
//! interned literals are immortal and ignore retain/release.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Reference count value marking an interned literal.
const LITERAL_REFS: i64 = i64::MIN;

/// Header of a runtime string.
#[repr(C)]
pub struct RtStringRepr {
    refs: AtomicI64,
    len: i64,
    data: *mut u8,
}

/// A runtime string handle. Null means "no string".
pub type RtStr = *mut RtStringRepr;

lazy_static! {
    /// Process-wide literal interner backing `rt_const_cstr`.
    static ref LITERAL_INTERNER: Mutex<HashMap<Vec<u8>, usize>> = Mutex::new(HashMap::new());
}

fn alloc_payload(bytes: &[u8]) -> *mut u8 {
    // Payload is NUL-terminated so rt_string_cstr hands out C-compatible data.
    let layout = Layout::array::<u8>(bytes.len() + 1).expect("string payload layout");
    unsafe {
        let data = alloc(layout);
        assert!(!data.is_null(), "runtime string allocation failed");
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        *data.add(bytes.len()) = 0;
        data
    }
}

fn new_header(bytes: &[u8], refs: i64) -> RtStr {
    let header = Box::new(RtStringRepr {
        refs: AtomicI64::new(refs),
        len: bytes.len() as i64,
        data: alloc_payload(bytes),
    });
    Box::into_raw(header)
}

/// Allocate a fresh heap string with reference count 1.
pub fn rt_string_from_bytes(bytes: &[u8]) -> RtStr {
    new_header(bytes, 1)
}

/// Return the interned literal handle for a byte sequence.
///
/// Literal handles are immortal: retain and release are no-ops on them, and
/// repeated requests for the same bytes return the same handle.
pub fn rt_const_cstr(bytes: &[u8]) -> RtStr {
    let mut interner = LITERAL_INTERNER.lock().expect("literal interner poisoned");
    if let Some(&addr) = interner.get(bytes) {
        return addr as RtStr;
    }
    let handle = new_header(bytes, LITERAL_REFS);
    interner.insert(bytes.to_vec(), handle as usize);
    handle
}

/// Length in bytes of the string behind a handle; 0 for null.
pub fn rt_len(handle: RtStr) -> i64 {
    if handle.is_null() {
        return 0;
    }
    unsafe { (*handle).len }
}

/// Pointer to the NUL-terminated payload; null for the null handle.
pub fn rt_string_cstr(handle: RtStr) -> *const u8 {
    if handle.is_null() {
        return std::ptr::null();
    }
    unsafe { (*handle).data }
}

/// Increment the reference count. Null handles and literals are ignored.
pub fn rt_str_retain_maybe(handle: RtStr) {
    if handle.is_null() {
        return;
    }
    let refs = unsafe { &(*handle).refs };
    if refs.load(Ordering::Relaxed) == LITERAL_REFS {
        return;
    }
    refs.fetch_add(1, Ordering::Relaxed);
}

/// Decrement the reference count, freeing the string when it reaches zero.
/// Null handles and literals are ignored.
pub fn rt_str_release_maybe(handle: RtStr) {
    if handle.is_null() {
        return;
    }
    let refs = unsafe { &(*handle).refs };
    if refs.load(Ordering::Relaxed) == LITERAL_REFS {
        return;
    }
    if refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        unsafe {
            let header = Box::from_raw(handle);
            let layout =
                Layout::array::<u8>(header.len as usize + 1).expect("string payload layout");
            dealloc(header.data, layout);
        }
    }
}

/// Current reference count of a heap handle.
///
/// Returns 0 for null and [`i64::MIN`] for literals. Test probe; production
/// code never branches on a count.
pub fn rt_string_refcount(handle: RtStr) -> i64 {
    if handle.is_null() {
        return 0;
    }
    unsafe { (*handle).refs.load(Ordering::Relaxed) }
}

/// True when the handle refers to an interned literal.
pub fn rt_string_is_literal(handle: RtStr) -> bool {
    !handle.is_null() && rt_string_refcount(handle) == LITERAL_REFS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_lifecycle() {
        let s = rt_string_from_bytes(b"hello");
        assert_eq!(rt_len(s), 5);
        assert_eq!(rt_string_refcount(s), 1);
        rt_str_retain_maybe(s);
        assert_eq!(rt_string_refcount(s), 2);
        rt_str_release_maybe(s);
        assert_eq!(rt_string_refcount(s), 1);
        let bytes = unsafe { std::slice::from_raw_parts(rt_string_cstr(s), 5) };
        assert_eq!(bytes, b"hello");
        rt_str_release_maybe(s);
    }

    #[test]
    fn test_literal_interning() {
        let a = rt_const_cstr(b"interned text");
        let b = rt_const_cstr(b"interned text");
        assert_eq!(a, b);
        assert!(rt_string_is_literal(a));
        // Retain/release must not disturb an interned literal.
        rt_str_retain_maybe(a);
        rt_str_release_maybe(a);
        rt_str_release_maybe(a);
        assert_eq!(rt_len(a), 13);
    }

    #[test]
    fn test_null_handle() {
        let null: RtStr = std::ptr::null_mut();
        assert_eq!(rt_len(null), 0);
        assert!(rt_string_cstr(null).is_null());
        rt_str_retain_maybe(null);
        rt_str_release_maybe(null);
    }

    #[test]
    fn test_embedded_nul() {
        let s = rt_string_from_bytes(b"a\0b");
        assert_eq!(rt_len(s), 3);
        let bytes = unsafe { std::slice::from_raw_parts(rt_string_cstr(s), 3) };
        assert_eq!(bytes, b"a\0b");
        rt_str_release_maybe(s);
    }
}
