use super::{BackendKind, DispatchFn, DispatchStatus, RuntimeBackend, call_lengths};
use crate::config::{EntryPoint, HostConfig};
use crate::error::BackendError;
use crate::library::NativeLibrary;
use std::ffi::{CString, c_char, c_void};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info};

type InitializeFn = unsafe extern "C" fn(
    exe_path: *const c_char,
    app_domain: *const c_char,
    property_count: i32,
    keys: *const *const c_char,
    values: *const *const c_char,
    host_handle: *mut *mut c_void,
    domain_id: *mut u32,
) -> i32;
type CreateDelegateFn = unsafe extern "C" fn(
    host_handle: *mut c_void,
    domain_id: u32,
    assembly: *const c_char,
    type_name: *const c_char,
    method: *const c_char,
    delegate: *mut *mut c_void,
) -> i32;
type ShutdownFn = unsafe extern "C" fn(host_handle: *mut c_void, domain_id: u32) -> i32;

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

struct Started {
    _library: NativeLibrary,
    host_handle: *mut c_void,
    domain_id: u32,
    create_delegate: CreateDelegateFn,
    shutdown: ShutdownFn,
}

/// CoreCLR hosted through the `coreclr_*` embedding exports.
///
/// Assemblies must be on the trusted platform assembly list, which is fixed
/// when the runtime starts.
pub struct CoreClrBackend {
    started: Option<Started>,
    trusted: Vec<PathBuf>,
    loaded: Vec<PathBuf>,
    dispatch: Option<DispatchFn>,
}

// SAFETY: the host handle and domain id are process-global and the CoreCLR
// embedding API accepts them from any thread.
unsafe impl Send for CoreClrBackend {}
unsafe impl Sync for CoreClrBackend {}

impl CoreClrBackend {
    pub fn new() -> Self {
        Self {
            started: None,
            trusted: Vec::new(),
            loaded: Vec::new(),
            dispatch: None,
        }
    }

    fn trusted_assemblies(config: &HostConfig) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = fs::read_dir(config.managed_lib_path())
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "dll"))
            .collect();
        paths.sort();
        paths.extend(config.assembly_paths());
        paths
    }
}

impl Default for CoreClrBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn c_string(text: &str) -> Result<CString, BackendError> {
    CString::new(text).map_err(|_| BackendError::StartFailed(format!("'{text}' contains a NUL byte")))
}

fn join(paths: impl IntoIterator<Item = PathBuf>) -> String {
    paths
        .into_iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(PATH_SEPARATOR)
}

impl RuntimeBackend for CoreClrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CoreClr
    }

    fn start(&mut self, config: &HostConfig) -> Result<(), BackendError> {
        if self.started.is_some() {
            return Err(BackendError::StartFailed("runtime already started".into()));
        }
        let library = NativeLibrary::open(&config.runtime_library_path())?;
        // SAFETY: signatures follow coreclr_delegates.h / coreclrhost.h.
        let (initialize, create_delegate, shutdown) = unsafe {
            (
                library.function::<InitializeFn>("coreclr_initialize")?,
                library.function::<CreateDelegateFn>("coreclr_create_delegate")?,
                library.function::<ShutdownFn>("coreclr_shutdown")?,
            )
        };

        let trusted = Self::trusted_assemblies(config);
        let mut app_paths: Vec<PathBuf> = config
            .assembly_paths()
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();
        app_paths.dedup();

        let properties = [
            ("TRUSTED_PLATFORM_ASSEMBLIES", join(trusted.iter().cloned())),
            ("APP_PATHS", join(app_paths)),
            ("NATIVE_DLL_SEARCH_DIRECTORIES", join([config.resolve(&config.native_lib_dir)])),
        ];
        let keys = properties
            .iter()
            .map(|(k, _)| c_string(k))
            .collect::<Result<Vec<_>, _>>()?;
        let values = properties
            .iter()
            .map(|(_, v)| c_string(v))
            .collect::<Result<Vec<_>, _>>()?;
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let value_ptrs: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();

        let exe = std::env::current_exe().unwrap_or_else(|_| config.base_dir.clone());
        let exe = c_string(&exe.display().to_string())?;
        let domain = c_string(&config.app_domain)?;
        let mut host_handle = ptr::null_mut();
        let mut domain_id = 0u32;

        // SAFETY: all strings outlive the call and the arrays hold
        // `properties.len()` entries each.
        let rc = unsafe {
            initialize(
                exe.as_ptr(),
                domain.as_ptr(),
                key_ptrs.len() as i32,
                key_ptrs.as_ptr(),
                value_ptrs.as_ptr(),
                &mut host_handle,
                &mut domain_id,
            )
        };
        if rc < 0 || host_handle.is_null() {
            return Err(BackendError::StartFailed(format!("coreclr_initialize returned {rc:#x}")));
        }

        info!(library = %config.runtime_library_path().display(), trusted = trusted.len(), "coreclr started");
        self.trusted = trusted;
        self.started = Some(Started {
            _library: library,
            host_handle,
            domain_id,
            create_delegate,
            shutdown,
        });
        Ok(())
    }

    fn load_assembly(&mut self, path: &Path) -> Result<(), BackendError> {
        if self.started.is_none() {
            return Err(BackendError::NotStarted);
        }
        if !path.is_file() {
            return Err(BackendError::AssemblyLoad {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }
        if !self.trusted.iter().any(|p| p == path) {
            return Err(BackendError::AssemblyLoad {
                path: path.to_path_buf(),
                reason: "not on the trusted platform assembly list".into(),
            });
        }
        debug!(path = %path.display(), "assembly available");
        self.loaded.push(path.to_path_buf());
        Ok(())
    }

    fn resolve_entry_point(&mut self, entry: &EntryPoint) -> Result<(), BackendError> {
        let started = self.started.as_ref().ok_or(BackendError::NotStarted)?;
        let assembly = c_string(&entry.assembly)?;
        let type_name = c_string(&entry.type_name)?;
        let method = c_string(&entry.method)?;
        let mut delegate = ptr::null_mut();
        // SAFETY: the runtime is started and all strings are NUL-terminated.
        let rc = unsafe {
            (started.create_delegate)(
                started.host_handle,
                started.domain_id,
                assembly.as_ptr(),
                type_name.as_ptr(),
                method.as_ptr(),
                &mut delegate,
            )
        };
        if rc < 0 || delegate.is_null() {
            return Err(BackendError::MissingMethod(entry.qualified()));
        }
        // SAFETY: the dispatcher is an [UnmanagedCallersOnly] method with the
        // `DispatchFn` signature.
        self.dispatch = Some(unsafe { std::mem::transmute::<*mut c_void, DispatchFn>(delegate) });
        Ok(())
    }

    fn dispatch(&self, request: &[u8], response: &mut [u8]) -> Result<DispatchStatus, BackendError> {
        let dispatch = self.dispatch.ok_or(BackendError::NotStarted)?;
        let (request_len, response_cap) = call_lengths(request, response)?;
        let mut written = 0i32;
        // SAFETY: both buffers are valid for the lengths passed.
        let code = unsafe {
            dispatch(request.as_ptr(), request_len, response.as_mut_ptr(), response_cap, &mut written)
        };
        DispatchStatus::from_raw(code, response, written)
    }

    fn shutdown(&mut self) {
        self.dispatch = None;
        self.loaded.clear();
        if let Some(started) = self.started.take() {
            // SAFETY: handle and domain come from a successful initialize.
            let rc = unsafe { (started.shutdown)(started.host_handle, started.domain_id) };
            info!(status = rc, "coreclr shut down");
        }
    }
}
