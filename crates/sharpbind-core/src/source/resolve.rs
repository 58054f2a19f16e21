//! Lowering of syntax-level declarations into the metadata model.

use super::decl::{DeclKind, MemberDecl, ParamModifier, TypeDecl, TypeExpr, find_attribute};
use crate::model::{
    DocumentAttributes, DocumentError, EnumValueRecord, FunctionFlags, FunctionRecord,
    ParamDirection, ParamRecord, PropertyFlags, PropertyRecord, TypeDefinitionDocument,
    TypeFlags, TypeKind, TypeRecord, TypeRef,
};
use std::collections::HashMap;

/// Attributes that mark a declaration as engine-facing.
const TYPE_MARKERS: &[(&str, DeclKind)] = &[
    ("UClass", DeclKind::Class),
    ("UStruct", DeclKind::Struct),
    ("UEnum", DeclKind::Enum),
];

/// Whether a parsed declaration should become a type record.
pub fn is_exported(decl: &TypeDecl) -> bool {
    TYPE_MARKERS
        .iter()
        .any(|(marker, kind)| *kind == decl.kind && find_attribute(&decl.attributes, marker).is_some())
}

fn builtin(name: &str) -> Option<TypeRef> {
    let ty = match name {
        "bool" | "Boolean" => TypeRef::Bool,
        "sbyte" | "SByte" => TypeRef::Int8,
        "short" | "Int16" => TypeRef::Int16,
        "int" | "Int32" => TypeRef::Int32,
        "long" | "Int64" => TypeRef::Int64,
        "byte" | "Byte" => TypeRef::UInt8,
        "ushort" | "UInt16" => TypeRef::UInt16,
        "uint" | "UInt32" => TypeRef::UInt32,
        "ulong" | "UInt64" => TypeRef::UInt64,
        "float" | "Single" => TypeRef::Float,
        "double" | "Double" => TypeRef::Double,
        "string" | "String" | "FString" => TypeRef::String,
        "FName" => TypeRef::Name,
        "FText" => TypeRef::Text,
        _ => return None,
    };
    Some(ty)
}

/// Resolves a set of declarations against each other.
pub struct Resolver<'d> {
    decls: &'d [TypeDecl],
    kinds: HashMap<&'d str, DeclKind>,
    default_module: &'d str,
}

impl<'d> Resolver<'d> {
    pub fn new(decls: &'d [TypeDecl], default_module: &'d str) -> Result<Self, DocumentError> {
        let mut kinds = HashMap::new();
        for decl in decls {
            if kinds.insert(decl.name.as_str(), decl.kind).is_some() {
                return Err(DocumentError::DuplicateType(decl.name.clone()));
            }
        }
        Ok(Self {
            decls,
            kinds,
            default_module,
        })
    }

    /// Lower every declaration and validate the resulting document.
    pub fn into_document(
        self,
        engine_version: &str,
        attributes: DocumentAttributes,
    ) -> Result<TypeDefinitionDocument, DocumentError> {
        let types = self
            .decls
            .iter()
            .map(|decl| self.lower_type(decl))
            .collect::<Result<Vec<_>, _>>()?;
        let document = TypeDefinitionDocument::new(engine_version, attributes, types);
        document.validate()?;
        Ok(document)
    }

    fn module_of(&self, decl: &TypeDecl) -> String {
        if let Some(module) = find_attribute(&decl.attributes, "NativeModule")
            .and_then(|a| a.args.first())
        {
            return module.clone();
        }
        if let Some(module) = &decl.module {
            return module.clone();
        }
        decl.namespace
            .as_deref()
            .and_then(|ns| ns.rsplit('.').next())
            .unwrap_or(self.default_module)
            .to_string()
    }

    fn lower_type(&self, decl: &TypeDecl) -> Result<TypeRecord, DocumentError> {
        let kind = match decl.kind {
            DeclKind::Class => TypeKind::Class,
            DeclKind::Struct => TypeKind::Struct,
            DeclKind::Enum => TypeKind::Enum,
        };
        let mut record = TypeRecord::new(&decl.name, self.module_of(decl), kind);

        if let Some(native) = find_attribute(&decl.attributes, "NativeName").and_then(|a| a.args.first()) {
            record.native_name = Some(native.clone());
        }
        if decl.modifiers.iter().any(|m| m == "abstract") {
            record.flags |= TypeFlags::ABSTRACT;
        }
        if find_attribute(&decl.attributes, "Obsolete").is_some() {
            record.flags |= TypeFlags::DEPRECATED;
        }
        let marker = TYPE_MARKERS
            .iter()
            .find(|(_, k)| *k == decl.kind)
            .and_then(|(name, _)| find_attribute(&decl.attributes, name));
        if marker.is_some_and(|a| a.has_arg("BlueprintType")) {
            record.flags |= TypeFlags::BLUEPRINT_TYPE;
        }

        match decl.kind {
            DeclKind::Enum => {
                if let Some(base) = &decl.base {
                    record.underlying_type = Some(self.resolve(base, &decl.name, "<underlying>")?);
                }
                let mut previous: Option<i64> = None;
                for variant in &decl.variants {
                    let value = match (variant.value, previous) {
                        (Some(value), _) => value,
                        (None, None) => 0,
                        (None, Some(previous)) => previous.checked_add(1).ok_or_else(|| {
                            DocumentError::InvalidType {
                                type_name: decl.name.clone(),
                                message: format!("implicit value of '{}' overflows", variant.name),
                            }
                        })?,
                    };
                    previous = Some(value);
                    record.enum_values.push(EnumValueRecord {
                        name: variant.name.clone(),
                        value,
                    });
                }
            }
            DeclKind::Class | DeclKind::Struct => {
                if decl.kind == DeclKind::Class {
                    record.super_type = decl
                        .base
                        .as_ref()
                        .filter(|base| self.kinds.get(base.name.as_str()) == Some(&DeclKind::Class))
                        .map(|base| base.name.clone());
                }
                for member in &decl.members {
                    self.lower_member(decl, member, &mut record)?;
                }
            }
        }
        Ok(record)
    }

    fn lower_member(
        &self,
        decl: &TypeDecl,
        member: &MemberDecl,
        record: &mut TypeRecord,
    ) -> Result<(), DocumentError> {
        match member {
            MemberDecl::Field {
                name,
                ty,
                attributes,
                modifiers,
            } => {
                let Some(marker) = find_attribute(attributes, "UProperty") else {
                    return Ok(());
                };
                let mut flags = PropertyFlags::empty();
                if marker.has_arg("ReadOnly")
                    || modifiers.iter().any(|m| m == "readonly" || m == "const")
                {
                    flags |= PropertyFlags::READ_ONLY;
                }
                if marker.has_arg("ScriptVisible") || marker.has_arg("BlueprintReadWrite") {
                    flags |= PropertyFlags::SCRIPT_VISIBLE;
                }
                record.properties.push(PropertyRecord {
                    name: name.clone(),
                    ty: self.resolve(ty, &decl.name, name)?,
                    flags,
                });
            }
            MemberDecl::Method {
                name,
                ret,
                params,
                attributes,
                modifiers,
            } => {
                let Some(marker) = find_attribute(attributes, "UFunction") else {
                    return Ok(());
                };
                let mut flags = FunctionFlags::empty();
                for arg in &marker.args {
                    flags |= match arg.as_str() {
                        "NativeCallable" => FunctionFlags::NATIVE_CALLABLE,
                        "ScriptCallable" | "BlueprintCallable" => FunctionFlags::SCRIPT_CALLABLE,
                        "FastInvoke" => FunctionFlags::FAST_INVOKE_ELIGIBLE,
                        "Event" | "BlueprintImplementableEvent" => FunctionFlags::EVENT,
                        "Const" => FunctionFlags::CONST,
                        _ => FunctionFlags::empty(),
                    };
                }
                if !flags.intersects(
                    FunctionFlags::NATIVE_CALLABLE | FunctionFlags::SCRIPT_CALLABLE | FunctionFlags::EVENT,
                ) {
                    flags |= FunctionFlags::NATIVE_CALLABLE;
                }
                if modifiers.iter().any(|m| m == "static") {
                    flags |= FunctionFlags::STATIC;
                }

                let mut lowered = Vec::with_capacity(params.len());
                for param in params {
                    lowered.push(ParamRecord {
                        name: param.name.clone(),
                        ty: self.resolve(&param.ty, &decl.name, name)?,
                        direction: match param.modifier {
                            Some(ParamModifier::Out) => ParamDirection::Out,
                            Some(ParamModifier::Ref) => ParamDirection::InOut,
                            Some(ParamModifier::In) | None => ParamDirection::In,
                        },
                    });
                }
                let return_type = if ret.is_void() {
                    None
                } else {
                    Some(self.resolve(ret, &decl.name, name)?)
                };

                record.functions.push(FunctionRecord {
                    name: name.clone(),
                    params: lowered,
                    return_type,
                    flags,
                });
            }
        }
        Ok(())
    }

    /// Resolve a type expression, failing on any name that is neither a
    /// builtin nor a declared type.
    pub fn resolve(&self, expr: &TypeExpr, owner: &str, member: &str) -> Result<TypeRef, DocumentError> {
        let unresolved = || DocumentError::UnresolvedType {
            type_name: owner.to_string(),
            member: member.to_string(),
            reference: render(expr),
        };
        let arg = |i: usize| -> Result<TypeRef, DocumentError> {
            let inner = expr.args.get(i).ok_or_else(unresolved)?;
            self.resolve(inner, owner, member)
        };
        let named = |i: usize| -> Result<String, DocumentError> {
            expr.args.get(i).map(|a| a.name.clone()).ok_or_else(unresolved)
        };

        let ty = match (expr.name.as_str(), expr.args.len()) {
            (name, 0) if builtin(name).is_some() => builtin(name).ok_or_else(unresolved)?,
            ("TArray" | "List" | "IList" | "IReadOnlyList", 1) => TypeRef::array(arg(0)?),
            ("TSet" | "HashSet" | "ISet", 1) => TypeRef::Set {
                element: Box::new(arg(0)?),
            },
            ("TMap" | "Dictionary" | "IDictionary", 2) => TypeRef::Map {
                key: Box::new(arg(0)?),
                value: Box::new(arg(1)?),
            },
            ("TSubclassOf", 1) => {
                self.expect_declared(&named(0)?, DeclKind::Class).ok_or_else(unresolved)?;
                TypeRef::Class { meta: named(0)? }
            }
            ("TSoftObjectPtr", 1) => {
                self.expect_declared(&named(0)?, DeclKind::Class).ok_or_else(unresolved)?;
                TypeRef::SoftObject { class: named(0)? }
            }
            ("TDelegate", 1) => TypeRef::Delegate { signature: named(0)? },
            (name, 0) => match self.kinds.get(name) {
                Some(DeclKind::Class) => TypeRef::object(name),
                Some(DeclKind::Struct) => TypeRef::Struct { name: name.into() },
                Some(DeclKind::Enum) => TypeRef::Enum { name: name.into() },
                None => return Err(unresolved()),
            },
            _ => return Err(unresolved()),
        };
        Ok(ty)
    }

    fn expect_declared(&self, name: &str, kind: DeclKind) -> Option<()> {
        (self.kinds.get(name) == Some(&kind)).then_some(())
    }
}

fn render(expr: &TypeExpr) -> String {
    if expr.args.is_empty() {
        expr.name.clone()
    } else {
        let args: Vec<String> = expr.args.iter().map(render).collect();
        format!("{}<{}>", expr.name, args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parser::parse_source;
    use std::path::Path;

    fn decls(src: &str) -> Vec<TypeDecl> {
        parse_source(src, Path::new("t.cs"))
            .unwrap()
            .into_iter()
            .filter(is_exported)
            .collect()
    }

    #[test]
    fn test_resolve_members() {
        let decls = decls(
            r#"
            namespace SharpBind.Engine;
            [UClass] public class Object {}
            [UClass] public class Actor : Object {
                [UProperty(ReadOnly)] public TArray<Actor> Children;
                [UFunction(FastInvoke)] public static Actor Spawn(TSubclassOf<Actor> cls, out int id) { }
                public void NotExported() {}
            }
            public class Helper {}
            "#,
        );
        assert_eq!(decls.len(), 2);
        let doc = Resolver::new(&decls, "Game")
            .unwrap()
            .into_document("5.4", DocumentAttributes::empty())
            .unwrap();
        let actor = doc.find_type("Actor").unwrap();
        assert_eq!(actor.module, "Engine");
        assert_eq!(actor.super_type.as_deref(), Some("Object"));
        assert_eq!(actor.properties[0].ty, TypeRef::array(TypeRef::object("Actor")));
        assert!(actor.properties[0].flags.contains(PropertyFlags::READ_ONLY));
        assert_eq!(actor.functions.len(), 1);
        let spawn = &actor.functions[0];
        assert!(spawn.flags.contains(
            FunctionFlags::STATIC | FunctionFlags::NATIVE_CALLABLE | FunctionFlags::FAST_INVOKE_ELIGIBLE
        ));
        assert_eq!(spawn.params[0].ty, TypeRef::Class { meta: "Actor".into() });
        assert_eq!(spawn.params[1].direction, ParamDirection::Out);
    }

    #[test]
    fn test_enum_values_continue_from_explicit() {
        let decls = decls("[UEnum] enum Mode : ushort { A, B = 5, C }");
        let doc = Resolver::new(&decls, "Game")
            .unwrap()
            .into_document("5.4", DocumentAttributes::empty())
            .unwrap();
        let mode = doc.find_type("Mode").unwrap();
        assert_eq!(mode.module, "Game");
        assert_eq!(mode.underlying_type, Some(TypeRef::UInt16));
        let values: Vec<i64> = mode.enum_values.iter().map(|v| v.value).collect();
        assert_eq!(values, vec![0, 5, 6]);
    }

    #[test]
    fn test_enum_value_at_upper_bound() {
        let at_max = decls("[UEnum] enum Big : long { A = 9223372036854775807 }");
        let doc = Resolver::new(&at_max, "Game")
            .unwrap()
            .into_document("5.4", DocumentAttributes::empty())
            .unwrap();
        assert_eq!(doc.find_type("Big").unwrap().enum_values[0].value, i64::MAX);

        let past_max = decls("[UEnum] enum Big : long { A = 9223372036854775807, B }");
        let err = Resolver::new(&past_max, "Game")
            .unwrap()
            .into_document("5.4", DocumentAttributes::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::InvalidType { ref type_name, ref message } if type_name == "Big" && message.contains("'B'")
        ));
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let decls = decls("[UClass] class Actor { [UProperty] public Missing Thing; }");
        let err = Resolver::new(&decls, "Game")
            .unwrap()
            .into_document("5.4", DocumentAttributes::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::UnresolvedType { ref reference, .. } if reference == "Missing"
        ));
    }

    #[test]
    fn test_duplicate_declaration() {
        let decls = decls("[UClass] class A {} [UStruct] struct A {}");
        assert!(matches!(Resolver::new(&decls, "Game"), Err(DocumentError::DuplicateType(_))));
    }
}
