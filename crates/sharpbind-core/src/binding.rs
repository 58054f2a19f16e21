//! Binding Context
//!
//! Couples one immutable document with an output root and a schema, decides
//! per function which calling strategy applies, and carries the fast-invoke
//! set from the trampoline pass to the wrapper pass.

use crate::model::{
    FunctionFlags, FunctionRecord, PropertyFlags, PropertyRecord, TypeDefinitionDocument, TypeRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const NATIVE_DIR: &str = "Intermediate/SharpBind/Native";
pub const MANAGED_DIR: &str = "Managed/Bindings";
pub const DEFINITIONS_DIR: &str = "Managed/Bindings.Defs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingSchema {
    /// Trampolines plus wrappers, with fast invoke when the document allows it.
    NativeBinding,
    /// Wrappers only, limited to script-exposed members.
    BlueprintBinding,
    /// Wrappers only, every call through reflection.
    CSharpBinding,
}

impl BindingSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingSchema::NativeBinding => "NativeBinding",
            BindingSchema::BlueprintBinding => "BlueprintBinding",
            BindingSchema::CSharpBinding => "CSharpBinding",
        }
    }

    /// Whether wrappers under this schema surface `function`.
    pub fn exposes(&self, function: &FunctionRecord) -> bool {
        let wanted = match self {
            BindingSchema::BlueprintBinding => FunctionFlags::SCRIPT_CALLABLE | FunctionFlags::EVENT,
            _ => FunctionFlags::NATIVE_CALLABLE | FunctionFlags::SCRIPT_CALLABLE | FunctionFlags::EVENT,
        };
        function.flags.intersects(wanted)
    }

    pub fn exposes_property(&self, property: &PropertyRecord) -> bool {
        *self != BindingSchema::BlueprintBinding || property.flags.contains(PropertyFlags::SCRIPT_VISIBLE)
    }
}

impl fmt::Display for BindingSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "nativebinding" => Ok(BindingSchema::NativeBinding),
            "blueprint" | "blueprintbinding" => Ok(BindingSchema::BlueprintBinding),
            "csharp" | "csharpbinding" => Ok(BindingSchema::CSharpBinding),
            other => Err(format!("unknown binding schema '{other}'")),
        }
    }
}

/// Stable identifier of a native function across regenerations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    pub type_name: String,
    pub function_name: String,
}

impl FunctionId {
    pub fn new(type_name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            function_name: function_name.into(),
        }
    }

    pub fn of(owner: &TypeRecord, function: &FunctionRecord) -> Self {
        Self::new(&owner.name, &function.name)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.function_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocability {
    /// May get a trampoline, subject to the layout check at generation time.
    FastInvokeCandidate,
    ReflectionOnly,
}

/// How a wrapper dispatches a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Direct,
    Reflection,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("fast-invoke functions requested before the trampoline pass completed")]
    FastInvokePending,
    #[error("fast-invoke functions were already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone)]
enum FastInvokeState {
    Pending,
    Settled(BTreeSet<FunctionId>),
}

/// Working state of one generation run.
#[derive(Debug)]
pub struct BindingContext {
    document: Arc<TypeDefinitionDocument>,
    output_root: PathBuf,
    schema: BindingSchema,
    fast_invoke: FastInvokeState,
}

impl BindingContext {
    pub fn create(
        document: Arc<TypeDefinitionDocument>,
        output_root: impl Into<PathBuf>,
        schema: BindingSchema,
    ) -> Self {
        let enabled = schema == BindingSchema::NativeBinding && document.allows_fast_invoke();
        let fast_invoke = if enabled {
            FastInvokeState::Pending
        } else {
            FastInvokeState::Settled(BTreeSet::new())
        };
        Self {
            document,
            output_root: output_root.into(),
            schema,
            fast_invoke,
        }
    }

    pub fn document(&self) -> &TypeDefinitionDocument {
        &self.document
    }

    pub fn schema(&self) -> BindingSchema {
        self.schema
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn native_root(&self) -> PathBuf {
        self.output_root.join(NATIVE_DIR)
    }

    pub fn managed_root(&self) -> PathBuf {
        self.output_root.join(MANAGED_DIR)
    }

    pub fn definitions_root(&self) -> PathBuf {
        self.output_root.join(DEFINITIONS_DIR)
    }

    /// Fast invoke needs the native schema and the document's permission.
    pub fn fast_invoke_enabled(&self) -> bool {
        self.schema == BindingSchema::NativeBinding && self.document.allows_fast_invoke()
    }

    pub fn classify(&self, function: &FunctionRecord) -> Invocability {
        let eligible = FunctionFlags::FAST_INVOKE_ELIGIBLE | FunctionFlags::NATIVE_CALLABLE;
        if self.fast_invoke_enabled() && function.flags.contains(eligible) && !function.is_event() {
            Invocability::FastInvokeCandidate
        } else {
            Invocability::ReflectionOnly
        }
    }

    /// Functions the trampoline generator should attempt, in document order.
    pub fn fast_invoke_candidates(&self) -> Vec<(&TypeRecord, &FunctionRecord)> {
        self.document
            .types
            .iter()
            .flat_map(|ty| ty.functions.iter().map(move |f| (ty, f)))
            .filter(|(_, f)| self.classify(f) == Invocability::FastInvokeCandidate)
            .collect()
    }

    /// Install the trampoline pass result. Only valid once, while pending.
    pub fn install_fast_invoke_functions(
        &mut self,
        functions: BTreeSet<FunctionId>,
    ) -> Result<(), ContextError> {
        match self.fast_invoke {
            FastInvokeState::Pending => {
                self.fast_invoke = FastInvokeState::Settled(functions);
                Ok(())
            }
            FastInvokeState::Settled(_) => Err(ContextError::AlreadyInstalled),
        }
    }

    pub fn fast_invoke_functions(&self) -> Result<&BTreeSet<FunctionId>, ContextError> {
        match &self.fast_invoke {
            FastInvokeState::Pending => Err(ContextError::FastInvokePending),
            FastInvokeState::Settled(set) => Ok(set),
        }
    }

    /// Dispatch strategy for a function. Set membership is the only input.
    pub fn dispatch_for(&self, id: &FunctionId) -> Result<Dispatch, ContextError> {
        Ok(if self.fast_invoke_functions()?.contains(id) {
            Dispatch::Direct
        } else {
            Dispatch::Reflection
        })
    }
}
