//! Dynamic library access for runtime libraries and trampoline lookup.

use crate::error::BackendError;
use crate::invocable::TrampolineFn;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

/// Finds generated trampolines by exported symbol name.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, symbol: &str) -> Option<TrampolineFn>;
}

/// A loaded shared library. Symbols obtained from it are valid only while it
/// is alive.
#[derive(Debug)]
pub struct NativeLibrary {
    path: Option<PathBuf>,
    inner: Library,
}

impl NativeLibrary {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        // SAFETY: loading runs the library's initializers; only runtime and
        // engine libraries named by the host configuration are opened.
        let inner = unsafe { Library::new(path) }.map_err(|e| BackendError::LibraryLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner,
        })
    }

    /// Symbols already linked into the running executable.
    pub fn this_process() -> Result<Self, BackendError> {
        #[cfg(unix)]
        let inner: Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let inner: Library = libloading::os::windows::Library::this()
            .map_err(|e| BackendError::LibraryLoad {
                path: PathBuf::from("<process>"),
                reason: e.to_string(),
            })?
            .into();
        Ok(Self { path: None, inner })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn address(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the symbol is read as an address only, never called here.
        let symbol = unsafe { self.inner.get::<*const c_void>(name.as_bytes()) }.ok()?;
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }

    /// Look up a function pointer of type `T`.
    ///
    /// # Safety
    ///
    /// `T` must match the exported function's actual signature, and the
    /// returned pointer must not outlive `self`.
    pub unsafe fn function<T: Copy>(&self, name: &str) -> Result<T, BackendError> {
        unsafe { self.inner.get::<T>(name.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|_| BackendError::MissingEntryPoint(name.to_string()))
    }
}

impl SymbolResolver for NativeLibrary {
    fn resolve(&self, symbol: &str) -> Option<TrampolineFn> {
        // SAFETY: every `SBFI_` export has the trampoline signature.
        unsafe { self.function::<TrampolineFn>(symbol) }.ok()
    }
}

/// Trampolines registered by hand, for engines that link them statically.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    entries: HashMap<String, TrampolineFn>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, symbol: impl Into<String>, function: TrampolineFn) -> &mut Self {
        self.entries.insert(symbol.into(), function);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, symbol: &str) -> Option<TrampolineFn> {
        self.entries.get(symbol).copied()
    }
}
