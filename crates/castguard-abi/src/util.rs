//! Shared internal utilities for ABI adapters.

use std::ffi::c_char;

/// Longest allocation label copied out of caller memory.
pub const MAX_LABEL_LEN: usize = 256;

/// Scan a C string with an optional hard bound.
///
/// Returns `(len, terminated)`: the byte length before the first NUL or the
/// bound, and whether a NUL was seen.
///
/// # Safety
///
/// `ptr` must be valid to read up to the discovered length (and bound when given).
pub unsafe fn scan_c_string(ptr: *const c_char, bound: Option<usize>) -> (usize, bool) {
    match bound {
        Some(limit) => {
            for i in 0..limit {
                if unsafe { *ptr.add(i) } == 0 {
                    return (i, true);
                }
            }
            (limit, false)
        }
        None => {
            let mut i = 0usize;
            while unsafe { *ptr.add(i) } != 0 {
                i += 1;
            }
            (i, true)
        }
    }
}

/// Copy a caller label, truncated to [`MAX_LABEL_LEN`] bytes.
///
/// # Safety
///
/// `ptr` must be null or readable up to its NUL or [`MAX_LABEL_LEN`] bytes.
pub unsafe fn read_label(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let (len, _) = unsafe { scan_c_string(ptr, Some(MAX_LABEL_LEN)) };
    let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
    Some(String::from_utf8_lossy(bytes).into_owned())
}
