//! Managed runtime backends.
//!
//! Exactly one backend is compiled in, selected by the build script: CoreCLR
//! when the `prefer-coreclr` feature is on and the target is a desktop
//! platform, Mono everywhere else.

#[cfg(sharpbind_backend = "coreclr")]
mod coreclr;
#[cfg(not(sharpbind_backend = "coreclr"))]
mod mono;

#[cfg(sharpbind_backend = "coreclr")]
pub use coreclr::CoreClrBackend;
#[cfg(not(sharpbind_backend = "coreclr"))]
pub use mono::MonoBackend;

use crate::config::{EntryPoint, HostConfig};
use crate::error::BackendError;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    CoreClr,
    Mono,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::CoreClr => "coreclr",
            BackendKind::Mono => "mono",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(sharpbind_backend = "coreclr")]
pub const ACTIVE_BACKEND: BackendKind = BackendKind::CoreClr;
#[cfg(not(sharpbind_backend = "coreclr"))]
pub const ACTIVE_BACKEND: BackendKind = BackendKind::Mono;

/// Status codes returned by the managed dispatcher.
pub mod status {
    pub const OK: i32 = 0;
    /// `response_len` holds the required size.
    pub const BUFFER_TOO_SMALL: i32 = 1;
    /// The response holds the exception message as UTF-8.
    pub const EXCEPTION: i32 = 2;
    pub const METHOD_NOT_FOUND: i32 = 3;
}

/// `int32 Invoke(const uint8* Request, int32 RequestLen, uint8* Response, int32 ResponseCap, int32* ResponseLen)`
pub type DispatchFn = unsafe extern "C" fn(*const u8, i32, *mut u8, i32, *mut i32) -> i32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Bytes of response written.
    Completed(usize),
    BufferTooSmall(usize),
    Exception(String),
    MethodNotFound,
}

impl DispatchStatus {
    pub fn from_raw(code: i32, response: &[u8], written: i32) -> Result<Self, BackendError> {
        let written = usize::try_from(written).unwrap_or(0);
        Ok(match code {
            status::OK => Self::Completed(written.min(response.len())),
            status::BUFFER_TOO_SMALL => Self::BufferTooSmall(written),
            status::EXCEPTION => {
                let message = &response[..written.min(response.len())];
                Self::Exception(String::from_utf8_lossy(message).into_owned())
            }
            status::METHOD_NOT_FOUND => Self::MethodNotFound,
            other => {
                return Err(BackendError::Protocol(format!("unknown status {other}")));
            }
        })
    }
}

pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Load the runtime library and boot the runtime.
    fn start(&mut self, config: &HostConfig) -> Result<(), BackendError>;

    fn load_assembly(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Bind the managed dispatcher that native → managed calls enter through.
    fn resolve_entry_point(&mut self, entry: &EntryPoint) -> Result<(), BackendError>;

    /// Hand an encoded request to the dispatcher. Safe to call concurrently.
    fn dispatch(&self, request: &[u8], response: &mut [u8]) -> Result<DispatchStatus, BackendError>;

    fn shutdown(&mut self);
}

/// The backend this build was compiled for.
pub fn create_backend() -> Box<dyn RuntimeBackend> {
    #[cfg(sharpbind_backend = "coreclr")]
    {
        Box::new(CoreClrBackend::new())
    }
    #[cfg(not(sharpbind_backend = "coreclr"))]
    {
        Box::new(MonoBackend::new())
    }
}

fn call_lengths(request: &[u8], response: &[u8]) -> Result<(i32, i32), BackendError> {
    let len = |n: usize| {
        i32::try_from(n).map_err(|_| BackendError::Protocol(format!("payload of {n} bytes is too large")))
    };
    Ok((len(request.len())?, len(response.len())?))
}
