//! Runtime host for generated bindings.
//!
//! Loads exactly one managed runtime backend (chosen at build time), resolves
//! the trampolines listed in the fast-invoke manifest and carries calls in
//! both directions:
//!
//! - managed → native through [`Binding`]s, either a direct trampoline call
//!   over a packed frame or a by-name reflection call
//! - native → managed through the backend's dispatch entry, using the
//!   self-describing value encoding in [`marshal`]

pub mod backend;
pub mod config;
pub mod error;
pub mod exports;
pub mod host;
pub mod invocable;
pub mod library;
pub mod marshal;
pub mod reflection;
pub mod value;

pub use config::HostConfig;
pub use error::{BackendError, HostError};
pub use host::{Binding, HostState, ManagedMethod, RuntimeHost};
pub use value::Value;
