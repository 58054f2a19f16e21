//! Type references used by properties, parameters and return values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to a native type as seen from a member signature.
///
/// Named variants (`Object`, `Class`, `SoftObject`, `Struct`, `Enum`) point at
/// a [`TypeRecord`](super::TypeRecord) in the same document; validation checks
/// that every such reference resolves to a record of the matching kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TypeRef {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    Float,
    Double,
    Name,
    String,
    Text,
    Object { class: String },
    Class { meta: String },
    SoftObject { class: String },
    Struct { name: String },
    Enum { name: String },
    Array { element: Box<TypeRef> },
    Set { element: Box<TypeRef> },
    Map { key: Box<TypeRef>, value: Box<TypeRef> },
    Delegate { signature: String },
}

/// What a named reference expects to find in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Class,
    Struct,
    Enum,
}

impl TypeRef {
    pub fn array(element: TypeRef) -> Self {
        TypeRef::Array {
            element: Box::new(element),
        }
    }

    pub fn object(class: impl Into<String>) -> Self {
        TypeRef::Object {
            class: class.into(),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeRef::Int8
                | TypeRef::Int16
                | TypeRef::Int32
                | TypeRef::Int64
                | TypeRef::UInt8
                | TypeRef::UInt16
                | TypeRef::UInt32
                | TypeRef::UInt64
        )
    }

    /// Inclusive value range of an integer type.
    pub fn integer_range(&self) -> Option<(i128, i128)> {
        Some(match self {
            TypeRef::Int8 => (i8::MIN.into(), i8::MAX.into()),
            TypeRef::Int16 => (i16::MIN.into(), i16::MAX.into()),
            TypeRef::Int32 => (i32::MIN.into(), i32::MAX.into()),
            TypeRef::Int64 => (i64::MIN.into(), i64::MAX.into()),
            TypeRef::UInt8 => (0, u8::MAX.into()),
            TypeRef::UInt16 => (0, u16::MAX.into()),
            TypeRef::UInt32 => (0, u32::MAX.into()),
            TypeRef::UInt64 => (0, u64::MAX.into()),
            _ => return None,
        })
    }

    /// Collect every named type this reference depends on, including the
    /// ones nested inside containers.
    pub fn named_references(&self) -> Vec<(ReferenceKind, &str)> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<(ReferenceKind, &'a str)>) {
        match self {
            TypeRef::Object { class } | TypeRef::SoftObject { class } => {
                out.push((ReferenceKind::Class, class))
            }
            TypeRef::Class { meta } => out.push((ReferenceKind::Class, meta)),
            TypeRef::Struct { name } => out.push((ReferenceKind::Struct, name)),
            TypeRef::Enum { name } => out.push((ReferenceKind::Enum, name)),
            TypeRef::Array { element } | TypeRef::Set { element } => {
                element.collect_references(out)
            }
            TypeRef::Map { key, value } => {
                key.collect_references(out);
                value.collect_references(out);
            }
            _ => {}
        }
    }

    /// Spelling of this type in generated managed code.
    pub fn managed_name(&self) -> String {
        match self {
            TypeRef::Bool => "bool".into(),
            TypeRef::Int8 => "sbyte".into(),
            TypeRef::Int16 => "short".into(),
            TypeRef::Int32 => "int".into(),
            TypeRef::Int64 => "long".into(),
            TypeRef::UInt8 => "byte".into(),
            TypeRef::UInt16 => "ushort".into(),
            TypeRef::UInt32 => "uint".into(),
            TypeRef::UInt64 => "ulong".into(),
            TypeRef::Float => "float".into(),
            TypeRef::Double => "double".into(),
            TypeRef::Name => "FName".into(),
            TypeRef::String => "string".into(),
            TypeRef::Text => "FText".into(),
            TypeRef::Object { class } => format!("{class}?"),
            TypeRef::Class { meta } => format!("TSubclassOf<{meta}>"),
            TypeRef::SoftObject { class } => format!("TSoftObjectPtr<{class}>"),
            TypeRef::Struct { name } | TypeRef::Enum { name } => name.clone(),
            TypeRef::Array { element } => format!("IList<{}>", element.managed_name()),
            TypeRef::Set { element } => format!("ISet<{}>", element.managed_name()),
            TypeRef::Map { key, value } => format!(
                "IDictionary<{}, {}>",
                key.managed_name(),
                value.managed_name()
            ),
            TypeRef::Delegate { signature } => signature.clone(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Object { class } => write!(f, "object<{class}>"),
            TypeRef::Class { meta } => write!(f, "class<{meta}>"),
            TypeRef::SoftObject { class } => write!(f, "soft<{class}>"),
            TypeRef::Struct { name } => write!(f, "struct<{name}>"),
            TypeRef::Enum { name } => write!(f, "enum<{name}>"),
            TypeRef::Array { element } => write!(f, "array<{element}>"),
            TypeRef::Set { element } => write!(f, "set<{element}>"),
            TypeRef::Map { key, value } => write!(f, "map<{key}, {value}>"),
            TypeRef::Delegate { signature } => write!(f, "delegate<{signature}>"),
            other => f.write_str(&format!("{other:?}").to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_references_walks_containers() {
        let ty = TypeRef::Map {
            key: Box::new(TypeRef::Enum {
                name: "Mode".into(),
            }),
            value: Box::new(TypeRef::array(TypeRef::object("Actor"))),
        };
        assert_eq!(
            ty.named_references(),
            vec![(ReferenceKind::Enum, "Mode"), (ReferenceKind::Class, "Actor")]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeRef::Int32.to_string(), "int32");
        assert_eq!(TypeRef::array(TypeRef::Float).to_string(), "array<float>");
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&TypeRef::object("Actor")).unwrap();
        assert_eq!(json, r#"{"kind":"object","class":"Actor"}"#);
        let back: TypeRef = serde_json::from_str(r#"{"kind":"uint8"}"#).unwrap();
        assert_eq!(back, TypeRef::UInt8);
    }
}
