use super::{BackendKind, DispatchStatus, RuntimeBackend, call_lengths};
use crate::config::{EntryPoint, HostConfig};
use crate::error::BackendError;
use crate::library::NativeLibrary;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::ptr;
use tracing::{debug, info};

const RUNTIME_VERSION: &str = "v4.0.30319";

type JitInitVersionFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_void;
type SetAssembliesPathFn = unsafe extern "C" fn(*const c_char);
type DomainAssemblyOpenFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type AssemblyGetImageFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ClassFromNameFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_void;
type ClassGetMethodFromNameFn = unsafe extern "C" fn(*mut c_void, *const c_char, i32) -> *mut c_void;
type MethodGetUnmanagedThunkFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ObjectToStringFn = unsafe extern "C" fn(*mut c_void, *mut *mut c_void) -> *mut c_void;
type StringToUtf8Fn = unsafe extern "C" fn(*mut c_void) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type JitCleanupFn = unsafe extern "C" fn(*mut c_void);

/// Unmanaged thunks take a trailing `MonoException**`.
type DispatchThunk = unsafe extern "C" fn(*const u8, i32, *mut u8, i32, *mut i32, *mut *mut c_void) -> i32;

const DISPATCH_ARITY: i32 = 5;

struct Api {
    domain_assembly_open: DomainAssemblyOpenFn,
    assembly_get_image: AssemblyGetImageFn,
    class_from_name: ClassFromNameFn,
    class_get_method_from_name: ClassGetMethodFromNameFn,
    method_get_unmanaged_thunk: MethodGetUnmanagedThunkFn,
    object_to_string: ObjectToStringFn,
    string_to_utf8: StringToUtf8Fn,
    free: FreeFn,
    jit_cleanup: JitCleanupFn,
}

struct Started {
    _library: NativeLibrary,
    api: Api,
    domain: *mut c_void,
}

/// Mono hosted through the embedding API.
pub struct MonoBackend {
    started: Option<Started>,
    assemblies: HashMap<String, *mut c_void>,
    dispatch: Option<DispatchThunk>,
}

// SAFETY: the root domain and loaded assemblies are process-global; thunks
// attach the calling thread on entry.
unsafe impl Send for MonoBackend {}
unsafe impl Sync for MonoBackend {}

impl MonoBackend {
    pub fn new() -> Self {
        Self {
            started: None,
            assemblies: HashMap::new(),
            dispatch: None,
        }
    }

    fn exception_message(api: &Api, exception: *mut c_void) -> String {
        let mut nested = ptr::null_mut();
        // SAFETY: `exception` is a live MonoObject handed back by the thunk.
        unsafe {
            let text = (api.object_to_string)(exception, &mut nested);
            if text.is_null() || !nested.is_null() {
                return "unhandled managed exception".into();
            }
            let utf8 = (api.string_to_utf8)(text);
            if utf8.is_null() {
                return "unhandled managed exception".into();
            }
            let message = CStr::from_ptr(utf8).to_string_lossy().into_owned();
            (api.free)(utf8.cast());
            message
        }
    }
}

impl Default for MonoBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn c_string(text: &str) -> Result<CString, BackendError> {
    CString::new(text).map_err(|_| BackendError::StartFailed(format!("'{text}' contains a NUL byte")))
}

impl RuntimeBackend for MonoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mono
    }

    fn start(&mut self, config: &HostConfig) -> Result<(), BackendError> {
        if self.started.is_some() {
            return Err(BackendError::StartFailed("runtime already started".into()));
        }
        let library = NativeLibrary::open(&config.runtime_library_path())?;
        // SAFETY: signatures follow the Mono embedding headers.
        let (init, set_assemblies_path, api) = unsafe {
            (
                library.function::<JitInitVersionFn>("mono_jit_init_version")?,
                library.function::<SetAssembliesPathFn>("mono_set_assemblies_path")?,
                Api {
                    domain_assembly_open: library.function("mono_domain_assembly_open")?,
                    assembly_get_image: library.function("mono_assembly_get_image")?,
                    class_from_name: library.function("mono_class_from_name")?,
                    class_get_method_from_name: library.function("mono_class_get_method_from_name")?,
                    method_get_unmanaged_thunk: library.function("mono_method_get_unmanaged_thunk")?,
                    object_to_string: library.function("mono_object_to_string")?,
                    string_to_utf8: library.function("mono_string_to_utf8")?,
                    free: library.function("mono_free")?,
                    jit_cleanup: library.function("mono_jit_cleanup")?,
                },
            )
        };

        let assemblies_path = c_string(&config.managed_lib_path().display().to_string())?;
        let domain_name = c_string(&config.app_domain)?;
        let version = c_string(RUNTIME_VERSION)?;
        // SAFETY: all strings are NUL-terminated and outlive the calls.
        let domain = unsafe {
            set_assemblies_path(assemblies_path.as_ptr());
            init(domain_name.as_ptr(), version.as_ptr())
        };
        if domain.is_null() {
            return Err(BackendError::StartFailed("mono_jit_init_version returned no domain".into()));
        }

        info!(library = %config.runtime_library_path().display(), "mono started");
        self.started = Some(Started {
            _library: library,
            api,
            domain,
        });
        Ok(())
    }

    fn load_assembly(&mut self, path: &Path) -> Result<(), BackendError> {
        let started = self.started.as_ref().ok_or(BackendError::NotStarted)?;
        let load_error = |reason: &str| BackendError::AssemblyLoad {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| load_error("assembly path has no file name"))?
            .to_string();
        let c_path = CString::new(path.display().to_string()).map_err(|_| load_error("path contains a NUL byte"))?;
        // SAFETY: the domain is live and the path is NUL-terminated.
        let assembly = unsafe { (started.api.domain_assembly_open)(started.domain, c_path.as_ptr()) };
        if assembly.is_null() {
            return Err(load_error("mono_domain_assembly_open failed"));
        }
        debug!(assembly = %name, "assembly loaded");
        self.assemblies.insert(name, assembly);
        Ok(())
    }

    fn resolve_entry_point(&mut self, entry: &EntryPoint) -> Result<(), BackendError> {
        let started = self.started.as_ref().ok_or(BackendError::NotStarted)?;
        let missing = || BackendError::MissingMethod(entry.qualified());
        let assembly = *self.assemblies.get(&entry.assembly).ok_or_else(missing)?;
        let (namespace, class) = entry.type_name.rsplit_once('.').unwrap_or(("", entry.type_name.as_str()));
        let namespace = c_string(namespace)?;
        let class = c_string(class)?;
        let method = c_string(&entry.method)?;

        // SAFETY: each handle comes from the previous successful call.
        let thunk = unsafe {
            let image = (started.api.assembly_get_image)(assembly);
            if image.is_null() {
                return Err(missing());
            }
            let klass = (started.api.class_from_name)(image, namespace.as_ptr(), class.as_ptr());
            if klass.is_null() {
                return Err(missing());
            }
            let method = (started.api.class_get_method_from_name)(klass, method.as_ptr(), DISPATCH_ARITY);
            if method.is_null() {
                return Err(missing());
            }
            (started.api.method_get_unmanaged_thunk)(method)
        };
        if thunk.is_null() {
            return Err(missing());
        }
        // SAFETY: the dispatcher is a static method with the `DispatchThunk` signature.
        self.dispatch = Some(unsafe { std::mem::transmute::<*mut c_void, DispatchThunk>(thunk) });
        Ok(())
    }

    fn dispatch(&self, request: &[u8], response: &mut [u8]) -> Result<DispatchStatus, BackendError> {
        let started = self.started.as_ref().ok_or(BackendError::NotStarted)?;
        let dispatch = self.dispatch.ok_or(BackendError::NotStarted)?;
        let (request_len, response_cap) = call_lengths(request, response)?;
        let mut written = 0i32;
        let mut exception = ptr::null_mut();
        // SAFETY: both buffers are valid for the lengths passed.
        let code = unsafe {
            dispatch(
                request.as_ptr(),
                request_len,
                response.as_mut_ptr(),
                response_cap,
                &mut written,
                &mut exception,
            )
        };
        if !exception.is_null() {
            return Ok(DispatchStatus::Exception(Self::exception_message(&started.api, exception)));
        }
        DispatchStatus::from_raw(code, response, written)
    }

    fn shutdown(&mut self) {
        self.dispatch = None;
        self.assemblies.clear();
        if let Some(started) = self.started.take() {
            // SAFETY: the domain comes from a successful init and is cleaned up once.
            unsafe { (started.api.jit_cleanup)(started.domain) };
            info!("mono shut down");
        }
    }
}
