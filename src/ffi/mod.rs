/**
 * ffi/mod.rs
 *
 * Foreign Function Interface for embedding in a non-Rust game host
 * Uses C-ABI for maximum compatibility
 */

mod coordinator;
mod types;

pub use coordinator::*;
pub use types::*;

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Initialize the library (call once at startup)
#[no_mangle]
pub extern "C" fn rendezvous_init() -> i32 {
    // Set up panic hook to prevent unwinding into FFI boundary
    panic::set_hook(Box::new(|panic_info| {
        log::error!("rendezvous panic: {}", panic_info);
    }));
    0
}

/// Get library version string (static, do not free)
#[no_mangle]
pub extern "C" fn rendezvous_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Free a string allocated by the library
#[no_mangle]
pub extern "C" fn rendezvous_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

/// Get last error message of this thread; free with rendezvous_free_string
#[no_mangle]
pub extern "C" fn rendezvous_last_error() -> *mut c_char {
    LAST_ERROR.with(|e| match e.borrow().as_deref() {
        Some(err) => rust_to_c_str(err),
        None => std::ptr::null_mut(),
    })
}

/// Clear last error
#[no_mangle]
pub extern "C" fn rendezvous_clear_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Set last error (internal helper)
pub(crate) fn set_last_error(error: &str) {
    log::debug!("[ffi] {}", error);
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(error.to_string()));
}

/// Helper to convert C string to Rust string
pub(crate) fn c_str_to_rust(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
}

/// Helper to hand a Rust string to C; interior NULs are dropped
pub(crate) fn rust_to_c_str(s: &str) -> *mut c_char {
    let clean: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
    match CString::new(clean) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_round_trip() {
        rendezvous_clear_error();
        assert!(rendezvous_last_error().is_null());

        set_last_error("boom");
        let ptr = rendezvous_last_error();
        assert!(!ptr.is_null());
        assert_eq!(c_str_to_rust(ptr).as_deref(), Some("boom"));
        rendezvous_free_string(ptr);

        rendezvous_clear_error();
        assert!(rendezvous_last_error().is_null());
    }

    #[test]
    fn test_version_is_nul_terminated() {
        assert_eq!(c_str_to_rust(rendezvous_version()).as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_strings_with_nul() {
        let ptr = rust_to_c_str("a\0b");
        assert_eq!(c_str_to_rust(ptr).as_deref(), Some("ab"));
        rendezvous_free_string(ptr);
    }
}
