//! Runtime host lifecycle and call routing.
//!
//! ```text
//! Uninitialized ──initialize──▶ Loading ──ok──▶ Ready ──shutdown──▶ ShuttingDown ──▶ Terminated
//!                                   │
//!                                   └──err──▶ Failed ──shutdown──▶ Terminated
//! ```
//!
//! Calls are accepted only in `Ready`. A [`Binding`] is tied to the runtime
//! generation it was created under and is refused by any other.

use crate::backend::{self, DispatchStatus, RuntimeBackend};
use crate::config::HostConfig;
use crate::error::{BackendError, HostError};
use crate::invocable::{DirectInvocable, Invocable, LookupInvocable};
use crate::library::{NativeLibrary, SymbolResolver};
use crate::marshal::{Decoder, Encoder};
use crate::reflection::NativeReflection;
use crate::value::Value;
use parking_lot::RwLock;
use sharpbind_core::FunctionId;
use sharpbind_core::codegen::native::FastInvokeManifest;
use sharpbind_core::model::{FunctionRecord, ParamDirection, TypeRecord};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const INITIAL_RESPONSE_CAPACITY: usize = 256;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);
static GLOBAL: RuntimeHost = RuntimeHost::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HostState {
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
    ShuttingDown = 3,
    Terminated = 4,
    Failed = 5,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Uninitialized => "uninitialized",
            HostState::Loading => "loading",
            HostState::Ready => "ready",
            HostState::ShuttingDown => "shutting down",
            HostState::Terminated => "terminated",
            HostState::Failed => "failed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed method the engine calls, typically an event implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedMethod {
    /// `Namespace.Type:Method`
    pub name: String,
    pub directions: Vec<ParamDirection>,
    pub returns: bool,
}

impl ManagedMethod {
    pub fn new(name: impl Into<String>, directions: Vec<ParamDirection>, returns: bool) -> Self {
        Self {
            name: name.into(),
            directions,
            returns,
        }
    }

    /// The wrapper-side implementation of `function` on `owner`.
    pub fn for_function(owner: &TypeRecord, function: &FunctionRecord) -> Self {
        Self {
            name: format!("SharpBind.{}.{}:{}", owner.module, owner.name, function.name),
            // Instance methods receive the object handle first.
            directions: (!function.is_static())
                .then_some(ParamDirection::In)
                .into_iter()
                .chain(function.params.iter().map(|p| p.direction))
                .collect(),
            returns: function.return_type.is_some(),
        }
    }

    fn expected_results(&self) -> usize {
        usize::from(self.returns) + self.directions.iter().filter(|d| d.writes_back()).count()
    }
}

/// Capability to call one native function through a running host.
#[derive(Clone)]
pub struct Binding {
    generation: u64,
    invocable: Arc<dyn Invocable>,
}

impl Binding {
    pub fn id(&self) -> &FunctionId {
        self.invocable.id()
    }

    pub fn is_direct(&self) -> bool {
        self.invocable.is_direct()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", self.id())
            .field("direct", &self.is_direct())
            .field("generation", &self.generation)
            .finish()
    }
}

struct Runtime {
    backend: Box<dyn RuntimeBackend>,
    reflection: Arc<dyn NativeReflection>,
    direct: HashMap<FunctionId, Arc<DirectInvocable>>,
    // Owns the library the trampoline pointers point into.
    _symbols: Box<dyn SymbolResolver>,
}

struct Inner {
    state: HostState,
    generation: u64,
    failure: Option<String>,
    runtime: Option<Runtime>,
}

impl Inner {
    fn ready(&self) -> Result<&Runtime, HostError> {
        match (self.state, &self.runtime) {
            (HostState::Ready, Some(runtime)) => Ok(runtime),
            (HostState::Failed, _) => Err(HostError::Unavailable {
                reason: self.failure.clone().unwrap_or_else(|| "initialization failed".into()),
            }),
            _ => Err(HostError::NotInitialized),
        }
    }
}

pub struct RuntimeHost {
    inner: RwLock<Inner>,
}

impl Default for RuntimeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeHost {
    pub const fn new() -> Self {
        Self {
            inner: parking_lot::const_rwlock(Inner {
                state: HostState::Uninitialized,
                generation: 0,
                failure: None,
                runtime: None,
            }),
        }
    }

    /// Process-wide host used by the C ABI exports.
    pub fn global() -> &'static RuntimeHost {
        &GLOBAL
    }

    // Accessors take recursive read locks too: a managed callback may ask
    // for the state while its own call holds a read guard and a writer waits.
    pub fn state(&self) -> HostState {
        self.inner.read_recursive().state
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.read_recursive().failure.clone()
    }

    /// Boot the compiled-in backend with trampolines from `config.native_module`.
    pub fn initialize(&self, config: &HostConfig, reflection: Arc<dyn NativeReflection>) -> Result<(), HostError> {
        self.initialize_with(backend::create_backend(), reflection, None, config)
    }

    /// Boot with an explicit backend and, optionally, symbol source.
    pub fn initialize_with(
        &self,
        backend: Box<dyn RuntimeBackend>,
        reflection: Arc<dyn NativeReflection>,
        symbols: Option<Box<dyn SymbolResolver>>,
        config: &HostConfig,
    ) -> Result<(), HostError> {
        {
            let mut inner = self.inner.write();
            if inner.state != HostState::Uninitialized {
                return Err(HostError::InvalidTransition(inner.state));
            }
            inner.state = HostState::Loading;
        }

        let kind = backend.kind();
        info!(backend = %kind, base = %config.base_dir.display(), "starting managed runtime");
        let loaded = load(backend, reflection, symbols, config);

        let mut inner = self.inner.write();
        match loaded {
            Ok(runtime) => {
                info!(backend = %kind, direct = runtime.direct.len(), "runtime host ready");
                inner.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
                inner.runtime = Some(runtime);
                inner.state = HostState::Ready;
                Ok(())
            }
            Err(err) => {
                error!(backend = %kind, error = %err, "runtime host failed to start");
                inner.failure = Some(err.to_string());
                inner.state = HostState::Failed;
                Err(err)
            }
        }
    }

    /// Obtain a binding for `id`: direct when a trampoline was resolved,
    /// reflection otherwise.
    pub fn bind(&self, id: &FunctionId) -> Result<Binding, HostError> {
        let inner = self.inner.read_recursive();
        let runtime = inner.ready()?;
        let invocable: Arc<dyn Invocable> = match runtime.direct.get(id) {
            Some(direct) => direct.clone(),
            None => Arc::new(LookupInvocable::new(id.clone(), runtime.reflection.clone())),
        };
        Ok(Binding {
            generation: inner.generation,
            invocable,
        })
    }

    pub fn invoke(&self, binding: &Binding, args: &mut [Value]) -> Result<Value, HostError> {
        let inner = self.inner.read_recursive();
        inner.ready()?;
        if binding.generation != inner.generation {
            debug!(function = %binding.id(), "stale binding refused");
            return Err(HostError::NotInitialized);
        }
        binding.invocable.invoke(args)
    }

    /// Call a managed method. Out and in-out arguments are overwritten with
    /// the values the method produced.
    pub fn call_managed(&self, method: &ManagedMethod, args: &mut [Value]) -> Result<Value, HostError> {
        if args.len() != method.directions.len() {
            return Err(HostError::marshal(format!(
                "{} expects {} arguments, got {}",
                method.name,
                method.directions.len(),
                args.len()
            )));
        }
        let request = Encoder::request(&method.name, args);
        let response = self.forward(&method.name, &request)?;

        let mut decoder = Decoder::new(&response);
        let values = decoder.values()?;
        decoder.end()?;
        if values.len() != method.expected_results() {
            return Err(HostError::marshal(format!(
                "{} returned {} values, expected {}",
                method.name,
                values.len(),
                method.expected_results()
            )));
        }

        let mut values = values.into_iter();
        let result = if method.returns {
            values.next().unwrap_or(Value::Void)
        } else {
            Value::Void
        };
        for (direction, arg) in method.directions.iter().zip(args.iter_mut()) {
            if direction.writes_back() {
                if let Some(value) = values.next() {
                    *arg = value;
                }
            }
        }
        Ok(result)
    }

    /// Pass an already encoded request to the managed dispatcher and return
    /// the encoded response.
    pub fn forward(&self, label: &str, request: &[u8]) -> Result<Vec<u8>, HostError> {
        self.forward_with_capacity(label, request, INITIAL_RESPONSE_CAPACITY)
    }

    /// Like [`forward`](Self::forward), starting from a response buffer of
    /// `capacity` bytes.
    pub fn forward_with_capacity(&self, label: &str, request: &[u8], capacity: usize) -> Result<Vec<u8>, HostError> {
        let inner = self.inner.read_recursive();
        let runtime = inner.ready()?;
        let mut capacity = capacity;
        let mut retried = false;
        loop {
            let mut response = vec![0u8; capacity];
            match runtime.backend.dispatch(request, &mut response)? {
                DispatchStatus::Completed(written) => {
                    response.truncate(written);
                    return Ok(response);
                }
                DispatchStatus::BufferTooSmall(needed) if !retried && needed > capacity => {
                    debug!(method = label, needed, "growing response buffer");
                    capacity = needed;
                    retried = true;
                }
                DispatchStatus::BufferTooSmall(needed) => {
                    return Err(HostError::Backend(BackendError::Protocol(format!(
                        "{label} needs {needed} response bytes after retry"
                    ))));
                }
                DispatchStatus::Exception(message) => return Err(HostError::ManagedException(message)),
                DispatchStatus::MethodNotFound => return Err(HostError::UnknownFunction(label.to_string())),
            }
        }
    }

    pub fn direct_functions(&self) -> Vec<FunctionId> {
        let inner = self.inner.read_recursive();
        let mut ids: Vec<FunctionId> = inner
            .runtime
            .iter()
            .flat_map(|rt| rt.direct.keys().cloned())
            .collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) -> Result<(), HostError> {
        let mut inner = self.inner.write();
        match inner.state {
            HostState::Ready => {
                inner.state = HostState::ShuttingDown;
                if let Some(mut runtime) = inner.runtime.take() {
                    runtime.backend.shutdown();
                }
                inner.state = HostState::Terminated;
                info!("runtime host terminated");
                Ok(())
            }
            HostState::Failed => {
                inner.state = HostState::Terminated;
                Ok(())
            }
            other => Err(HostError::InvalidTransition(other)),
        }
    }
}

fn open_symbols(config: &HostConfig) -> Result<Box<dyn SymbolResolver>, BackendError> {
    Ok(match &config.native_module {
        Some(path) => Box::new(NativeLibrary::open(&config.resolve(path))?),
        None => Box::new(NativeLibrary::this_process()?),
    })
}

fn load(
    mut backend: Box<dyn RuntimeBackend>,
    reflection: Arc<dyn NativeReflection>,
    symbols: Option<Box<dyn SymbolResolver>>,
    config: &HostConfig,
) -> Result<Runtime, HostError> {
    backend.start(config)?;
    match prepare(backend.as_mut(), symbols, config) {
        Ok((direct, symbols)) => Ok(Runtime {
            backend,
            reflection,
            direct,
            _symbols: symbols,
        }),
        Err(err) => {
            backend.shutdown();
            Err(err)
        }
    }
}

type DirectTable = HashMap<FunctionId, Arc<DirectInvocable>>;

fn prepare(
    backend: &mut dyn RuntimeBackend,
    symbols: Option<Box<dyn SymbolResolver>>,
    config: &HostConfig,
) -> Result<(DirectTable, Box<dyn SymbolResolver>), HostError> {
    for path in config.assembly_paths() {
        backend.load_assembly(&path)?;
    }
    backend.resolve_entry_point(&config.entry_point)?;

    let symbols = match symbols {
        Some(symbols) => symbols,
        None => open_symbols(config)?,
    };
    let mut direct = HashMap::new();
    if let Some(path) = &config.fast_invoke_manifest {
        let path = config.resolve(path);
        let manifest = FastInvokeManifest::load(&path).map_err(|e| BackendError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        for entry in &manifest.entries {
            match symbols.resolve(&entry.symbol) {
                Some(function) => {
                    direct.insert(entry.id.clone(), Arc::new(DirectInvocable::new(entry, function)));
                }
                None => warn!(
                    function = %entry.id,
                    symbol = %entry.symbol,
                    "trampoline not exported, calls will use reflection"
                ),
            }
        }
    }
    Ok((direct, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(HostState::Ready as i32, 2);
        assert_eq!(HostState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_new_host_refuses_calls() {
        let host = RuntimeHost::new();
        assert_eq!(host.state(), HostState::Uninitialized);
        assert_eq!(host.bind(&FunctionId::new("Actor", "Jump")).unwrap_err(), HostError::NotInitialized);
        assert_eq!(
            host.shutdown(),
            Err(HostError::InvalidTransition(HostState::Uninitialized))
        );
    }

    #[test]
    fn test_managed_method_for_event() {
        use sharpbind_core::model::{FunctionFlags, ParamRecord, TypeKind, TypeRef};
        let owner = TypeRecord::new("Actor", "Engine", TypeKind::Class);
        let event = FunctionRecord {
            name: "OnHit".into(),
            params: vec![ParamRecord {
                name: "Handled".into(),
                ty: TypeRef::Bool,
                direction: ParamDirection::Out,
            }],
            return_type: Some(TypeRef::Int32),
            flags: FunctionFlags::EVENT,
        };
        let method = ManagedMethod::for_function(&owner, &event);
        assert_eq!(method.name, "SharpBind.Engine.Actor:OnHit");
        assert_eq!(method.directions, vec![ParamDirection::In, ParamDirection::Out]);
        assert_eq!(method.expected_results(), 2);
    }
}
