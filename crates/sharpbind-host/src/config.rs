//! Host configuration.
//!
//! Relative runtime directories and the runtime library name default to the
//! values the build script derived for the compiled backend.

use std::path::{Path, PathBuf};

pub const BACKEND_NAME: &str = env!("SHARPBIND_BACKEND");
pub const DOTNET_VERSION: &str = env!("SHARPBIND_DOTNET_VERSION");
pub const NATIVE_LIB_DIR: &str = env!("SHARPBIND_NATIVE_LIB_DIR");
pub const MANAGED_LIB_DIR: &str = env!("SHARPBIND_MANAGED_LIB_DIR");
pub const RUNTIME_LIB: &str = env!("SHARPBIND_RUNTIME_LIB");

pub const BRIDGE_ASSEMBLY: &str = "Managed/SharpBind.Runtime.dll";

/// Managed method every native → managed call enters through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub assembly: String,
    pub type_name: String,
    pub method: String,
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self {
            assembly: "SharpBind.Runtime".into(),
            type_name: "SharpBind.Runtime.Dispatcher".into(),
            method: "Invoke".into(),
        }
    }
}

impl EntryPoint {
    /// `Namespace.Type:Method`, the spelling runtime lookups expect.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.type_name, self.method)
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Plugin directory every relative path is resolved against.
    pub base_dir: PathBuf,
    pub native_lib_dir: PathBuf,
    pub managed_lib_dir: PathBuf,
    pub runtime_library: String,
    pub bridge_assembly: PathBuf,
    /// Generated binding assemblies, loaded in order after the bridge.
    pub assemblies: Vec<PathBuf>,
    pub fast_invoke_manifest: Option<PathBuf>,
    /// Library exporting the trampolines; the host process when unset.
    pub native_module: Option<PathBuf>,
    pub entry_point: EntryPoint,
    pub app_domain: String,
}

impl HostConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            native_lib_dir: PathBuf::from(NATIVE_LIB_DIR),
            managed_lib_dir: PathBuf::from(MANAGED_LIB_DIR),
            runtime_library: RUNTIME_LIB.to_string(),
            bridge_assembly: PathBuf::from(BRIDGE_ASSEMBLY),
            assemblies: Vec::new(),
            fast_invoke_manifest: None,
            native_module: None,
            entry_point: EntryPoint::default(),
            app_domain: "SharpBind".into(),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn runtime_library_path(&self) -> PathBuf {
        self.resolve(&self.native_lib_dir).join(&self.runtime_library)
    }

    pub fn managed_lib_path(&self) -> PathBuf {
        self.resolve(&self.managed_lib_dir)
    }

    /// Bridge assembly first, then the configured assemblies.
    pub fn assembly_paths(&self) -> Vec<PathBuf> {
        std::iter::once(&self.bridge_assembly)
            .chain(&self.assemblies)
            .map(|p| self.resolve(p))
            .collect()
    }
}
