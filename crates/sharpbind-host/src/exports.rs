//! C ABI used by the engine plugin.
//!
//! Every export returns an `int32` status: zero on success, a positive
//! dispatcher status, or a negative [`HostError::status_code`]. Panics never
//! cross the boundary.

use crate::backend::status;
use crate::config::HostConfig;
use crate::error::HostError;
use crate::host::RuntimeHost;
use crate::reflection::ReflectionRegistry;
use std::cell::RefCell;
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{error, warn};

pub const STATUS_PANIC: i32 = -100;

static REFLECTION: LazyLock<Arc<ReflectionRegistry>> = LazyLock::new(|| Arc::new(ReflectionRegistry::new()));

/// Handlers registered here serve reflection calls on the global host.
pub fn global_reflection() -> Arc<ReflectionRegistry> {
    REFLECTION.clone()
}

fn guarded(export: &str, f: impl FnOnce() -> i32) -> i32 {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(export, "panic caught at the C ABI boundary");
        STATUS_PANIC
    })
}

fn report(export: &str, result: Result<(), HostError>) -> i32 {
    match result {
        Ok(()) => status::OK,
        Err(err) => {
            warn!(export, error = %err, "host call failed");
            err.status_code()
        }
    }
}

unsafe fn optional_path(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy();
    (!text.is_empty()).then(|| PathBuf::from(text.into_owned()))
}

/// Start the global host.
///
/// # Safety
///
/// `base_dir` must be a NUL-terminated path. `manifest` and `native_module`
/// may be null; otherwise they must be NUL-terminated too.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sharpbind_host_initialize(
    base_dir: *const c_char,
    manifest: *const c_char,
    native_module: *const c_char,
) -> i32 {
    guarded("sharpbind_host_initialize", || {
        let Some(base_dir) = (unsafe { optional_path(base_dir) }) else {
            return HostError::marshal("base directory is required").status_code();
        };
        let mut config = HostConfig::new(base_dir);
        config.fast_invoke_manifest = unsafe { optional_path(manifest) };
        config.native_module = unsafe { optional_path(native_module) };
        let result = RuntimeHost::global().initialize(&config, global_reflection());
        report("sharpbind_host_initialize", result)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn sharpbind_host_state() -> i32 {
    RuntimeHost::global().state() as i32
}

#[unsafe(no_mangle)]
pub extern "C" fn sharpbind_host_shutdown() -> i32 {
    guarded("sharpbind_host_shutdown", || {
        report("sharpbind_host_shutdown", RuntimeHost::global().shutdown())
    })
}

thread_local! {
    /// Response that did not fit the caller's buffer, keyed by its request.
    static UNDELIVERED: RefCell<Option<(Vec<u8>, Vec<u8>)>> = const { RefCell::new(None) };
}

/// Run the request, or hand back the response kept from the same request's
/// previous too-small attempt on this thread.
fn managed_response(request: &[u8], capacity: usize) -> Result<Vec<u8>, HostError> {
    let kept = UNDELIVERED.with_borrow_mut(|slot| match slot.take() {
        Some((kept_request, response)) if kept_request == request => Some(response),
        _ => None,
    });
    match kept {
        Some(response) => Ok(response),
        None => RuntimeHost::global().forward_with_capacity("engine request", request, capacity),
    }
}

/// Forward an encoded request to the managed dispatcher.
///
/// When the response does not fit, `response_len` receives the required
/// size and the status is `BUFFER_TOO_SMALL`. The response is kept, and
/// calling again on the same thread with the same request and a large
/// enough buffer returns it without running the managed method again.
///
/// # Safety
///
/// `request` must be readable for `request_len` bytes, `response` writable
/// for `response_cap` bytes and `response_len` writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sharpbind_invoke_managed(
    request: *const u8,
    request_len: i32,
    response: *mut u8,
    response_cap: i32,
    response_len: *mut i32,
) -> i32 {
    guarded("sharpbind_invoke_managed", || {
        let (Ok(request_len), Ok(response_cap)) = (usize::try_from(request_len), usize::try_from(response_cap))
        else {
            return HostError::marshal("negative buffer length").status_code();
        };
        if request.is_null() || response_len.is_null() || (response.is_null() && response_cap > 0) {
            return HostError::marshal("null buffer").status_code();
        }
        let request = unsafe { std::slice::from_raw_parts(request, request_len) };
        let bytes = match managed_response(request, response_cap) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "managed call failed");
                return err.status_code();
            }
        };
        let Ok(len) = i32::try_from(bytes.len()) else {
            return HostError::marshal("response too large").status_code();
        };
        unsafe { *response_len = len };
        if bytes.len() > response_cap {
            UNDELIVERED.with_borrow_mut(|slot| *slot = Some((request.to_vec(), bytes)));
            return status::BUFFER_TOO_SMALL;
        }
        if !bytes.is_empty() {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), response, bytes.len()) };
        }
        status::OK
    })
}
