//! Syntax-level declarations.
//!
//! Both the managed-source parser and the assembly manifest produce these.
//! They still carry type names as written; the resolver lowers them to
//! [`TypeRef`](crate::model::TypeRef)s once every declaration is known.

use serde::{Deserialize, Serialize};

/// A type as spelled in a declaration, e.g. `TMap<FName, TArray<int>>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<TypeExpr>,
}

impl TypeExpr {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn generic(name: impl Into<String>, args: Vec<TypeExpr>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn is_void(&self) -> bool {
        self.name == "void" && self.args.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Attribute {
    /// Whether the attribute has the given positional argument.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

pub fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes
        .iter()
        .find(|a| a.name == name || a.name.strip_suffix("Attribute") == Some(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclKind {
    Class,
    Struct,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamModifier {
    In,
    Out,
    Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeExpr,
    #[serde(default)]
    pub modifier: Option<ParamModifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberDecl {
    Field {
        name: String,
        ty: TypeExpr,
        #[serde(default)]
        attributes: Vec<Attribute>,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Method {
        name: String,
        ret: TypeExpr,
        #[serde(default)]
        params: Vec<ParamDecl>,
        #[serde(default)]
        attributes: Vec<Attribute>,
        #[serde(default)]
        modifiers: Vec<String>,
    },
}

impl MemberDecl {
    pub fn name(&self) -> &str {
        match self {
            MemberDecl::Field { name, .. } | MemberDecl::Method { name, .. } => name,
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        match self {
            MemberDecl::Field { attributes, .. } | MemberDecl::Method { attributes, .. } => {
                attributes
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDecl {
    pub name: String,
    #[serde(default)]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    pub kind: DeclKind,
    #[serde(default)]
    pub module: Option<String>,
    /// Enclosing namespace in managed source.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub base: Option<TypeExpr>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default)]
    pub members: Vec<MemberDecl>,
    #[serde(default)]
    pub variants: Vec<VariantDecl>,
}

impl TypeDecl {
    /// Every type name this declaration mentions, for cross-referencing.
    pub fn mentioned_types(&self) -> Vec<&str> {
        fn walk<'a>(expr: &'a TypeExpr, out: &mut Vec<&'a str>) {
            out.push(&expr.name);
            for arg in &expr.args {
                walk(arg, out);
            }
        }

        let mut out = Vec::new();
        if let Some(base) = &self.base {
            walk(base, &mut out);
        }
        for member in &self.members {
            match member {
                MemberDecl::Field { ty, .. } => walk(ty, &mut out),
                MemberDecl::Method { ret, params, .. } => {
                    walk(ret, &mut out);
                    for param in params {
                        walk(&param.ty, &mut out);
                    }
                }
            }
        }
        out
    }
}
