//! Native calling-convention layout.
//!
//! Defines the closed set of types that can cross the fast-invoke boundary
//! and how a function's arguments are packed into a single argument buffer.
//! The trampoline generator, the managed wrapper generator and the runtime
//! host all compute offsets through this module, so the three agree on the
//! packing by construction.
//!
//! Representable categories:
//!
//! | category        | size | align |
//! |-----------------|------|-------|
//! | bool            | 1    | 1     |
//! | 8/16/32/64-bit integers | 1/2/4/8 | same |
//! | float / double  | 4/8  | 4/8   |
//! | enum            | underlying integer | same |
//! | object / class handle | 8 | 8 (opaque pointer) |
//! | name            | 8    | 4     |
//! | struct          | C layout of its properties | max field align |
//!
//! Strings, text, soft references, containers and delegates are not
//! representable, nor is any struct that contains one.

use crate::model::{
    FunctionRecord, ParamDirection, TypeDefinitionDocument, TypeKind, TypeRecord, TypeRef,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const POINTER_SIZE: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("type {ty} is not representable in the native calling convention ({reason})")]
    Unsupported { ty: String, reason: &'static str },
    #[error("struct '{0}' contains itself")]
    RecursiveAggregate(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category")]
pub enum NativeCategory {
    Bool,
    Integer { signed: bool },
    Float,
    Enum { name: String, signed: bool },
    ObjectHandle,
    Name,
    Aggregate { name: String, fields: Vec<AggregateField> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateField {
    pub name: String,
    pub offset: usize,
    pub repr: NativeRepr,
}

/// Native representation of a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeRepr {
    #[serde(flatten)]
    pub category: NativeCategory,
    pub size: usize,
    pub align: usize,
    /// Engine-side spelling, used by the generated trampolines.
    pub native_type: String,
}

impl NativeRepr {
    fn scalar(category: NativeCategory, size: usize, native_type: &str) -> Self {
        Self {
            category,
            size,
            align: size,
            native_type: native_type.to_string(),
        }
    }
}

pub fn align_to(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Compute the native representation of `ty` or explain why there is none.
pub fn native_repr(ty: &TypeRef, document: &TypeDefinitionDocument) -> Result<NativeRepr, LayoutError> {
    let mut visiting = Vec::new();
    repr_inner(ty, document, &mut visiting)
}

pub fn is_representable(ty: &TypeRef, document: &TypeDefinitionDocument) -> bool {
    native_repr(ty, document).is_ok()
}

fn integer(signed: bool, size: usize, native_type: &str) -> NativeRepr {
    NativeRepr::scalar(NativeCategory::Integer { signed }, size, native_type)
}

fn repr_inner(
    ty: &TypeRef,
    document: &TypeDefinitionDocument,
    visiting: &mut Vec<String>,
) -> Result<NativeRepr, LayoutError> {
    let repr = match ty {
        TypeRef::Bool => NativeRepr::scalar(NativeCategory::Bool, 1, "bool"),
        TypeRef::Int8 => integer(true, 1, "int8"),
        TypeRef::Int16 => integer(true, 2, "int16"),
        TypeRef::Int32 => integer(true, 4, "int32"),
        TypeRef::Int64 => integer(true, 8, "int64"),
        TypeRef::UInt8 => integer(false, 1, "uint8"),
        TypeRef::UInt16 => integer(false, 2, "uint16"),
        TypeRef::UInt32 => integer(false, 4, "uint32"),
        TypeRef::UInt64 => integer(false, 8, "uint64"),
        TypeRef::Float => NativeRepr::scalar(NativeCategory::Float, 4, "float"),
        TypeRef::Double => NativeRepr::scalar(NativeCategory::Float, 8, "double"),
        TypeRef::Name => NativeRepr {
            category: NativeCategory::Name,
            size: 8,
            align: 4,
            native_type: "FName".into(),
        },
        TypeRef::Object { class } => {
            let record = lookup(document, class)?;
            NativeRepr::scalar(
                NativeCategory::ObjectHandle,
                POINTER_SIZE,
                &format!("{}*", record.native_name()),
            )
        }
        TypeRef::Class { .. } => {
            NativeRepr::scalar(NativeCategory::ObjectHandle, POINTER_SIZE, "UClass*")
        }
        TypeRef::Enum { name } => {
            let record = lookup(document, name)?;
            let underlying = repr_inner(&record.enum_underlying(), document, visiting)?;
            let signed = matches!(underlying.category, NativeCategory::Integer { signed: true });
            NativeRepr {
                category: NativeCategory::Enum {
                    name: name.clone(),
                    signed,
                },
                size: underlying.size,
                align: underlying.align,
                native_type: record.native_name(),
            }
        }
        TypeRef::Struct { name } => aggregate(name, document, visiting)?,
        TypeRef::String | TypeRef::Text => {
            return Err(unsupported(ty, "variable-length text"));
        }
        TypeRef::SoftObject { .. } => {
            return Err(unsupported(ty, "soft references need path resolution"));
        }
        TypeRef::Array { .. } | TypeRef::Set { .. } | TypeRef::Map { .. } => {
            return Err(unsupported(ty, "managed-only collection"));
        }
        TypeRef::Delegate { .. } => {
            return Err(unsupported(ty, "delegates carry a managed target"));
        }
    };
    Ok(repr)
}

fn unsupported(ty: &TypeRef, reason: &'static str) -> LayoutError {
    LayoutError::Unsupported {
        ty: ty.to_string(),
        reason,
    }
}

fn lookup<'a>(document: &'a TypeDefinitionDocument, name: &str) -> Result<&'a TypeRecord, LayoutError> {
    document
        .find_type(name)
        .ok_or_else(|| LayoutError::UnknownType(name.to_string()))
}

fn aggregate(
    name: &str,
    document: &TypeDefinitionDocument,
    visiting: &mut Vec<String>,
) -> Result<NativeRepr, LayoutError> {
    if visiting.iter().any(|v| v == name) {
        return Err(LayoutError::RecursiveAggregate(name.to_string()));
    }
    let record = lookup(document, name)?;
    if record.kind != TypeKind::Struct {
        return Err(LayoutError::UnknownType(name.to_string()));
    }

    visiting.push(name.to_string());
    let mut fields = Vec::with_capacity(record.properties.len());
    let mut offset = 0;
    let mut align = 1;
    for prop in &record.properties {
        let repr = repr_inner(&prop.ty, document, visiting)?;
        offset = align_to(offset, repr.align);
        align = align.max(repr.align);
        let size = repr.size;
        fields.push(AggregateField {
            name: prop.name.clone(),
            offset,
            repr,
        });
        offset += size;
    }
    visiting.pop();

    Ok(NativeRepr {
        category: NativeCategory::Aggregate {
            name: name.to_string(),
            fields,
        },
        // Empty structs still occupy one byte natively.
        size: align_to(offset.max(1), align),
        align,
        native_type: record.native_name(),
    })
}

/// One argument slot in a packed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSlot {
    pub name: String,
    pub offset: usize,
    pub direction: ParamDirection,
    pub repr: NativeRepr,
}

/// Packed argument buffer layout of one function.
///
/// Instance functions get a receiver slot named `self` at offset 0. Each
/// parameter follows in declared order at its natural alignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Whether slot 0 is the instance receiver.
    #[serde(default)]
    pub receiver: bool,
    pub slots: Vec<FrameSlot>,
    pub size: usize,
    pub align: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<NativeRepr>,
}

impl FrameLayout {
    pub fn for_function(
        owner: &TypeRecord,
        function: &FunctionRecord,
        document: &TypeDefinitionDocument,
    ) -> Result<Self, LayoutError> {
        let mut slots = Vec::with_capacity(function.params.len() + 1);
        let mut offset = 0;
        let mut align = 1;

        if !function.is_static() {
            slots.push(FrameSlot {
                name: "self".into(),
                offset: 0,
                direction: ParamDirection::In,
                repr: NativeRepr::scalar(
                    NativeCategory::ObjectHandle,
                    POINTER_SIZE,
                    &format!("{}*", owner.native_name()),
                ),
            });
            offset = POINTER_SIZE;
            align = POINTER_SIZE;
        }

        for param in &function.params {
            let repr = native_repr(&param.ty, document)?;
            offset = align_to(offset, repr.align);
            align = align.max(repr.align);
            let size = repr.size;
            slots.push(FrameSlot {
                name: param.name.clone(),
                offset,
                direction: param.direction,
                repr,
            });
            offset += size;
        }

        let ret = match &function.return_type {
            Some(ty) => Some(native_repr(ty, document)?),
            None => None,
        };

        Ok(Self {
            receiver: !function.is_static(),
            slots,
            size: align_to(offset, align),
            align,
            ret,
        })
    }

    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver
    }

    /// Parameter slots, excluding the receiver.
    pub fn params(&self) -> &[FrameSlot] {
        let skip = usize::from(self.receiver).min(self.slots.len());
        &self.slots[skip..]
    }

    pub fn return_size(&self) -> usize {
        self.ret.as_ref().map_or(0, |r| r.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentAttributes, FunctionFlags, ParamRecord, PropertyFlags, PropertyRecord};

    fn prop(name: &str, ty: TypeRef) -> PropertyRecord {
        PropertyRecord {
            name: name.into(),
            ty,
            flags: PropertyFlags::empty(),
        }
    }

    fn param(name: &str, ty: TypeRef, direction: ParamDirection) -> ParamRecord {
        ParamRecord {
            name: name.into(),
            ty,
            direction,
        }
    }

    fn document() -> TypeDefinitionDocument {
        let actor = TypeRecord::new("Actor", "Engine", TypeKind::Class);
        let mut vector = TypeRecord::new("Vector", "Core", TypeKind::Struct);
        vector.properties = vec![
            prop("X", TypeRef::Double),
            prop("Y", TypeRef::Double),
            prop("Z", TypeRef::Double),
        ];
        let mut hit = TypeRecord::new("Hit", "Engine", TypeKind::Struct);
        hit.properties = vec![
            prop("Blocking", TypeRef::Bool),
            prop("Location", TypeRef::Struct { name: "Vector".into() }),
            prop("Item", TypeRef::Int32),
        ];
        let mut tagged = TypeRecord::new("Tagged", "Engine", TypeKind::Struct);
        tagged.properties = vec![prop("Tags", TypeRef::array(TypeRef::Name))];
        let mut node = TypeRecord::new("Node", "Engine", TypeKind::Struct);
        node.properties = vec![prop("Next", TypeRef::Struct { name: "Node".into() })];
        let mut mode = TypeRecord::new("Mode", "Engine", TypeKind::Enum);
        mode.underlying_type = Some(TypeRef::Int16);
        TypeDefinitionDocument::new(
            "5.4",
            DocumentAttributes::empty(),
            vec![actor, vector, hit, tagged, node, mode],
        )
    }

    #[test]
    fn test_scalar_sizes() {
        let doc = document();
        assert_eq!(native_repr(&TypeRef::Bool, &doc).unwrap().size, 1);
        assert_eq!(native_repr(&TypeRef::UInt64, &doc).unwrap().align, 8);
        let name = native_repr(&TypeRef::Name, &doc).unwrap();
        assert_eq!((name.size, name.align), (8, 4));
        let handle = native_repr(&TypeRef::object("Actor"), &doc).unwrap();
        assert_eq!(handle.native_type, "UActor*");
    }

    #[test]
    fn test_enum_uses_underlying() {
        let doc = document();
        let repr = native_repr(&TypeRef::Enum { name: "Mode".into() }, &doc).unwrap();
        assert_eq!(repr.size, 2);
        assert_eq!(repr.native_type, "EMode");
        assert!(matches!(repr.category, NativeCategory::Enum { signed: true, .. }));
    }

    #[test]
    fn test_aggregate_padding() {
        let doc = document();
        let repr = native_repr(&TypeRef::Struct { name: "Hit".into() }, &doc).unwrap();
        // bool @0, Vector @8 (24 bytes), int32 @32, padded to 40
        assert_eq!(repr.size, 40);
        assert_eq!(repr.align, 8);
        let NativeCategory::Aggregate { fields, .. } = &repr.category else {
            panic!("expected aggregate");
        };
        let offsets: Vec<usize> = fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 32]);
    }

    #[test]
    fn test_unrepresentable() {
        let doc = document();
        assert!(!is_representable(&TypeRef::String, &doc));
        assert!(!is_representable(&TypeRef::Struct { name: "Tagged".into() }, &doc));
        assert_eq!(
            native_repr(&TypeRef::Struct { name: "Node".into() }, &doc),
            Err(LayoutError::RecursiveAggregate("Node".into()))
        );
    }

    #[test]
    fn test_frame_layout_instance() {
        let doc = document();
        let owner = doc.find_type("Actor").unwrap();
        let func = FunctionRecord {
            name: "Trace".into(),
            params: vec![
                param("Flag", TypeRef::Bool, ParamDirection::In),
                param("Distance", TypeRef::Double, ParamDirection::In),
                param("Count", TypeRef::Int32, ParamDirection::Out),
            ],
            return_type: Some(TypeRef::Bool),
            flags: FunctionFlags::NATIVE_CALLABLE,
        };
        let layout = FrameLayout::for_function(owner, &func, &doc).unwrap();
        let offsets: Vec<usize> = layout.slots.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 24]);
        assert_eq!(layout.size, 32);
        assert_eq!(layout.arg_count(), 4);
        assert!(layout.has_receiver());
        assert_eq!(layout.return_size(), 1);
    }

    #[test]
    fn test_frame_layout_static_rejects_string() {
        let doc = document();
        let owner = doc.find_type("Actor").unwrap();
        let func = FunctionRecord {
            name: "Log".into(),
            params: vec![param("Message", TypeRef::String, ParamDirection::In)],
            return_type: None,
            flags: FunctionFlags::STATIC,
        };
        assert!(matches!(
            FrameLayout::for_function(owner, &func, &doc),
            Err(LayoutError::Unsupported { .. })
        ));
    }
}
