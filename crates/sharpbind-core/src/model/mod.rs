//! Type Metadata Model
//!
//! An in-memory, serializable description of the native type system: classes,
//! structs and enums together with their properties, functions and flags.
//! The model is pure data. Once a [`TypeDefinitionDocument`] has been built and
//! validated it is shared read-only by every exporter.

mod types;

pub use types::{ReferenceKind, TypeRef};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

bitflags! {
    /// Document-level attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentAttributes: u32 {
        const ALLOW_FAST_INVOKE_GENERATION = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TypeFlags: u32 {
        const ABSTRACT = 1 << 0;
        const BLUEPRINT_TYPE = 1 << 1;
        const DEPRECATED = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FunctionFlags: u32 {
        /// Callable from managed code through the binding layer.
        const NATIVE_CALLABLE = 1 << 0;
        /// Exposed to the engine's visual scripting layer.
        const SCRIPT_CALLABLE = 1 << 1;
        /// Coarse marker set by the metadata source. Trampoline generation
        /// re-checks it against the native layout rules.
        const FAST_INVOKE_ELIGIBLE = 1 << 2;
        const STATIC = 1 << 3;
        const CONST = 1 << 4;
        /// Implemented on the managed side; the engine calls into it.
        const EVENT = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PropertyFlags: u32 {
        const READ_ONLY = 1 << 0;
        const SCRIPT_VISIBLE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    Struct,
    Enum,
}

impl TypeKind {
    /// Engine naming prefix for the native spelling of a type.
    pub fn native_prefix(&self) -> &'static str {
        match self {
            TypeKind::Class => "U",
            TypeKind::Struct => "F",
            TypeKind::Enum => "E",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Class => "class",
            TypeKind::Struct => "struct",
            TypeKind::Enum => "enum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDirection {
    #[default]
    In,
    Out,
    InOut,
}

impl ParamDirection {
    /// Whether the callee writes the value back to the caller.
    pub fn writes_back(&self) -> bool {
        matches!(self, ParamDirection::Out | ParamDirection::InOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    #[serde(default)]
    pub direction: ParamDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<TypeRef>,
    #[serde(default)]
    pub flags: FunctionFlags,
}

impl FunctionRecord {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FunctionFlags::STATIC)
    }

    pub fn is_event(&self) -> bool {
        self.flags.contains(FunctionFlags::EVENT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    #[serde(default)]
    pub flags: PropertyFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValueRecord {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub name: String,
    /// Native module (package) the type originates from.
    pub module: String,
    pub kind: TypeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_type: Option<String>,
    #[serde(default)]
    pub flags: TypeFlags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<EnumValueRecord>,
    /// Integer representation of an enum. Defaults to `uint8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying_type: Option<TypeRef>,
}

impl TypeRecord {
    pub fn new(name: impl Into<String>, module: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            kind,
            native_name: None,
            super_type: None,
            flags: TypeFlags::empty(),
            properties: Vec::new(),
            functions: Vec::new(),
            enum_values: Vec::new(),
            underlying_type: None,
        }
    }

    /// Native (engine-side) identifier, e.g. `UActor` for class `Actor`.
    pub fn native_name(&self) -> String {
        match &self.native_name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.kind.native_prefix(), self.name),
        }
    }

    pub fn enum_underlying(&self) -> TypeRef {
        self.underlying_type.clone().unwrap_or(TypeRef::UInt8)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyRecord> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Errors raised while building, loading or validating a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("input path '{}' does not exist", .0.display())]
    MissingInput(PathBuf),
    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed input '{}': {message}", .path.display())]
    Malformed { path: PathBuf, message: String },
    #[error("{} parse error(s) in '{}'", .diagnostics.len(), .path.display())]
    Parse {
        path: PathBuf,
        diagnostics: Vec<String>,
    },
    #[error("type '{0}' is declared more than once")]
    DuplicateType(String),
    #[error("type '{type_name}' declares member '{member}' more than once")]
    DuplicateMember { type_name: String, member: String },
    #[error("{type_name}.{member}: unresolved type reference '{reference}'")]
    UnresolvedType {
        type_name: String,
        member: String,
        reference: String,
    },
    #[error("{type_name}: {message}")]
    InvalidType { type_name: String, message: String },
}

/// Root aggregate of the metadata model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinitionDocument {
    pub engine_version: String,
    #[serde(default)]
    pub attributes: DocumentAttributes,
    pub types: Vec<TypeRecord>,
}

impl TypeDefinitionDocument {
    pub fn new(
        engine_version: impl Into<String>,
        attributes: DocumentAttributes,
        types: Vec<TypeRecord>,
    ) -> Self {
        Self {
            engine_version: engine_version.into(),
            attributes,
            types,
        }
    }

    pub fn allows_fast_invoke(&self) -> bool {
        self.attributes
            .contains(DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION)
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeRecord> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn function_count(&self) -> usize {
        self.types.iter().map(|t| t.functions.len()).sum()
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let mut kinds: HashMap<&str, TypeKind> = HashMap::new();
        for ty in &self.types {
            if kinds.insert(ty.name.as_str(), ty.kind).is_some() {
                return Err(DocumentError::DuplicateType(ty.name.clone()));
            }
        }

        check_inheritance(&self.types)?;

        for ty in &self.types {
            let mut members = HashSet::new();
            let names = ty
                .properties
                .iter()
                .map(|p| &p.name)
                .chain(ty.functions.iter().map(|f| &f.name))
                .chain(ty.enum_values.iter().map(|v| &v.name));
            for name in names {
                if !members.insert(name.as_str()) {
                    return Err(DocumentError::DuplicateMember {
                        type_name: ty.name.clone(),
                        member: name.clone(),
                    });
                }
            }

            if let Some(super_type) = &ty.super_type {
                if ty.kind != TypeKind::Class {
                    return Err(DocumentError::InvalidType {
                        type_name: ty.name.clone(),
                        message: format!("only classes may have a super type ('{super_type}')"),
                    });
                }
                if kinds.get(super_type.as_str()) != Some(&TypeKind::Class) {
                    return Err(DocumentError::UnresolvedType {
                        type_name: ty.name.clone(),
                        member: "<super>".into(),
                        reference: super_type.clone(),
                    });
                }
            }

            if ty.kind == TypeKind::Enum {
                let underlying = ty.enum_underlying();
                let Some((min, max)) = underlying.integer_range() else {
                    return Err(DocumentError::InvalidType {
                        type_name: ty.name.clone(),
                        message: format!("enum underlying type must be an integer, found {underlying}"),
                    });
                };
                if let Some(value) = ty
                    .enum_values
                    .iter()
                    .find(|v| !(min..=max).contains(&i128::from(v.value)))
                {
                    return Err(DocumentError::InvalidType {
                        type_name: ty.name.clone(),
                        message: format!(
                            "value {} of '{}' does not fit in {underlying}",
                            value.value, value.name
                        ),
                    });
                }
            }

            for prop in &ty.properties {
                check_references(&kinds, &ty.name, &prop.name, &prop.ty)?;
            }
            for func in &ty.functions {
                for param in &func.params {
                    check_references(&kinds, &ty.name, &func.name, &param.ty)?;
                }
                if let Some(ret) = &func.return_type {
                    check_references(&kinds, &ty.name, &func.name, ret)?;
                }
            }
        }
        Ok(())
    }

    /// Write the document as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Load and validate a previously saved document.
    pub fn load_from_file(path: &Path) -> Result<Self, DocumentError> {
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: Self =
            serde_json::from_str(&text).map_err(|e| DocumentError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        document.validate()?;
        Ok(document)
    }
}

/// Reject super-type chains that loop back on themselves.
fn check_inheritance(types: &[TypeRecord]) -> Result<(), DocumentError> {
    let supers: HashMap<&str, &str> = types
        .iter()
        .filter_map(|t| Some((t.name.as_str(), t.super_type.as_deref()?)))
        .collect();
    for ty in types {
        let mut seen = HashSet::from([ty.name.as_str()]);
        let mut current = ty.name.as_str();
        while let Some(&parent) = supers.get(current) {
            if !seen.insert(parent) {
                return Err(DocumentError::InvalidType {
                    type_name: ty.name.clone(),
                    message: format!("inheritance cycle through '{parent}'"),
                });
            }
            current = parent;
        }
    }
    Ok(())
}

fn check_references(
    kinds: &HashMap<&str, TypeKind>,
    type_name: &str,
    member: &str,
    ty: &TypeRef,
) -> Result<(), DocumentError> {
    for (expected, name) in ty.named_references() {
        let wanted = match expected {
            ReferenceKind::Class => TypeKind::Class,
            ReferenceKind::Struct => TypeKind::Struct,
            ReferenceKind::Enum => TypeKind::Enum,
        };
        if kinds.get(name) != Some(&wanted) {
            return Err(DocumentError::UnresolvedType {
                type_name: type_name.to_string(),
                member: member.to_string(),
                reference: name.to_string(),
            });
        }
    }
    Ok(())
}
