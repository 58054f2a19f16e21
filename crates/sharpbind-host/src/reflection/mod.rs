//! By-name native dispatch.
//!
//! Every exposed function can be reached this way whether or not it has a
//! trampoline. The engine registers handlers with a [`ReflectionRegistry`];
//! [`SymbolReflection`] calls exported C functions through libffi.

mod ffi;

pub use ffi::SymbolReflection;

use crate::error::HostError;
use crate::value::Value;
use parking_lot::RwLock;
use sharpbind_core::FunctionId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

pub trait NativeReflection: Send + Sync {
    fn contains(&self, id: &FunctionId) -> bool;
    fn call(&self, id: &FunctionId, args: &mut [Value]) -> Result<Value, HostError>;
}

pub type ReflectionHandler = dyn Fn(&mut [Value]) -> Result<Value, HostError> + Send + Sync;

#[derive(Default)]
pub struct ReflectionRegistry {
    handlers: RwLock<HashMap<FunctionId, Arc<ReflectionHandler>>>,
}

impl ReflectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, id: FunctionId, handler: F)
    where
        F: Fn(&mut [Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(id, Arc::new(handler));
    }

    pub fn unregister(&self, id: &FunctionId) -> bool {
        self.handlers.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl NativeReflection for ReflectionRegistry {
    fn contains(&self, id: &FunctionId) -> bool {
        self.handlers.read().contains_key(id)
    }

    fn call(&self, id: &FunctionId, args: &mut [Value]) -> Result<Value, HostError> {
        // Release the lock before calling so handlers may re-enter.
        let handler = self
            .handlers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| HostError::UnknownFunction(id.to_string()))?;
        trace!(function = %id, "reflection call");
        handler(args)
    }
}

/// Tries each source in order; the first that knows the function wins.
#[derive(Default)]
pub struct ReflectionChain {
    sources: Vec<Arc<dyn NativeReflection>>,
}

impl ReflectionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn NativeReflection>) -> Self {
        self.sources.push(source);
        self
    }
}

impl NativeReflection for ReflectionChain {
    fn contains(&self, id: &FunctionId) -> bool {
        self.sources.iter().any(|s| s.contains(id))
    }

    fn call(&self, id: &FunctionId, args: &mut [Value]) -> Result<Value, HostError> {
        match self.sources.iter().find(|s| s.contains(id)) {
            Some(source) => source.call(id, args),
            None => Err(HostError::UnknownFunction(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_dispatch() {
        let registry = ReflectionRegistry::new();
        let id = FunctionId::new("Actor", "GetName");
        registry.register(id.clone(), |args| match args {
            [Value::Handle(h)] => Ok(Value::String(format!("Actor_{h}"))),
            _ => Err(HostError::marshal("expected a receiver")),
        });

        let mut args = [Value::Handle(7)];
        assert_eq!(registry.call(&id, &mut args), Ok(Value::from("Actor_7")));
        assert!(registry.unregister(&id));
        assert_eq!(
            registry.call(&id, &mut args),
            Err(HostError::UnknownFunction("Actor.GetName".into()))
        );
    }

    #[test]
    fn test_chain_order() {
        let id = FunctionId::new("Math", "Pi");
        let first = Arc::new(ReflectionRegistry::new());
        let second = Arc::new(ReflectionRegistry::new());
        second.register(id.clone(), |_| Ok(Value::F64(3.0)));
        first.register(id.clone(), |_| Ok(Value::F64(3.14)));

        let chain = ReflectionChain::new().with(first.clone()).with(second);
        assert_eq!(chain.call(&id, &mut []), Ok(Value::F64(3.14)));
        first.unregister(&id);
        assert_eq!(chain.call(&id, &mut []), Ok(Value::F64(3.0)));
        assert!(!chain.contains(&FunctionId::new("Math", "Tau")));
    }
}
