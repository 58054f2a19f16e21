//! Declaration parser for managed binding sources.
//!
//! Recognises the subset of C# used to declare engine-facing types:
//! - `using` directives, file-scoped and block namespaces
//! - attribute lists with positional, named and `A | B` flag arguments
//! - `class` / `struct` declarations with fields, properties and methods
//! - `enum` declarations with optional underlying type and explicit values
//!
//! Method and accessor bodies are skipped as balanced brace blocks; their
//! contents never matter for binding generation.

use super::decl::{
    Attribute, DeclKind, MemberDecl, ParamDecl, ParamModifier, TypeDecl, TypeExpr, VariantDecl,
};
use crate::model::DocumentError;
use chumsky::error::RichReason;
use chumsky::prelude::*;
use std::path::Path;

type Extra<'a> = extra::Err<Rich<'a, char>>;

pub const MODIFIERS: &[&str] = &[
    "public", "private", "protected", "internal", "static", "partial", "abstract", "sealed",
    "virtual", "override", "readonly", "extern", "unsafe", "new", "const", "volatile",
];

fn comment<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    let line = just("//").then(none_of("\n").repeated()).ignored();
    let block = just("/*")
        .then(any().and_is(just("*/").not()).repeated())
        .then(just("*/"))
        .ignored();
    choice((line, block))
}

/// Whitespace, comments and preprocessor lines.
pub fn ws<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    let directive = just('#').then(none_of("\n").repeated()).ignored();
    choice((comment(), directive, one_of(" \t\r\n").ignored())).repeated()
}

fn symbol<'a>(s: &'static str) -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    just(s).padded_by(ws()).ignored()
}

fn keyword<'a>(k: &'static str) -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    text::keyword(k).padded_by(ws()).ignored()
}

fn ident<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    just('@')
        .or_not()
        .ignore_then(text::ident())
        .map(|s: &str| s.to_string())
        .padded_by(ws())
}

fn qualified<'a>() -> impl Parser<'a, &'a str, Vec<String>, Extra<'a>> + Clone {
    text::ident()
        .map(|s: &str| s.to_string())
        .separated_by(just('.'))
        .at_least(1)
        .collect::<Vec<String>>()
        .padded_by(ws())
}

fn integer_literal<'a>() -> impl Parser<'a, &'a str, i64, Extra<'a>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(text::int(16))
        .try_map(|s: &str, span| {
            i64::from_str_radix(s, 16).map_err(|e| Rich::custom(span, e.to_string()))
        });
    let dec = just('-')
        .or_not()
        .then(text::int(10))
        .to_slice()
        .try_map(|s: &str, span| s.parse::<i64>().map_err(|e| Rich::custom(span, e.to_string())));
    hex.or(dec).padded_by(ws())
}

/// Parser for type expressions: `int`, `Engine.Actor`, `TMap<FName, int>`,
/// `Actor?`, `float[]`. Qualified names keep their last segment; `T[]`
/// becomes `TArray<T>`.
pub fn type_expr<'a>() -> impl Parser<'a, &'a str, TypeExpr, Extra<'a>> + Clone {
    recursive(|ty| {
        let generics = ty
            .separated_by(symbol(","))
            .at_least(1)
            .collect::<Vec<TypeExpr>>()
            .delimited_by(symbol("<"), symbol(">"));

        qualified()
            .then(generics.or_not())
            .then_ignore(symbol("?").or_not())
            .then(symbol("[]").repeated().count())
            .map(|((path, args), rank)| {
                let name = path.last().cloned().unwrap_or_default();
                let mut expr = TypeExpr::generic(name, args.unwrap_or_default());
                for _ in 0..rank {
                    expr = TypeExpr::generic("TArray", vec![expr]);
                }
                expr
            })
    })
}

fn attributes<'a>() -> impl Parser<'a, &'a str, Vec<Attribute>, Extra<'a>> + Clone {
    let string_lit = just('"')
        .ignore_then(none_of("\"").repeated().to_slice())
        .then_ignore(just('"'))
        .map(|s: &str| s.to_string());
    let number = integer_literal().map(|n| n.to_string());
    let path = text::ident()
        .separated_by(just('.'))
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string());
    let value = choice((string_lit, number, path)).padded_by(ws());

    let named = text::ident()
        .padded_by(ws())
        .then_ignore(symbol("="))
        .then(value.clone())
        .map(|(key, value): (&str, String)| vec![format!("{key}={value}")]);
    let flags = value
        .separated_by(symbol("|"))
        .at_least(1)
        .collect::<Vec<String>>();

    let args = named
        .or(flags)
        .separated_by(symbol(","))
        .allow_trailing()
        .collect::<Vec<Vec<String>>>()
        .map(|groups| groups.into_iter().flatten().collect::<Vec<String>>())
        .delimited_by(symbol("("), symbol(")"));

    let attribute = qualified()
        .then(args.or_not())
        .map(|(path, args)| Attribute {
            name: path.last().cloned().unwrap_or_default(),
            args: args.unwrap_or_default(),
        });

    attribute
        .separated_by(symbol(","))
        .at_least(1)
        .collect::<Vec<Attribute>>()
        .delimited_by(symbol("["), symbol("]"))
        .repeated()
        .collect::<Vec<Vec<Attribute>>>()
        .map(|groups| groups.into_iter().flatten().collect())
}

fn modifiers<'a>() -> impl Parser<'a, &'a str, Vec<String>, Extra<'a>> + Clone {
    text::ident()
        .try_map(|s: &str, span| {
            if MODIFIERS.contains(&s) {
                Ok(s.to_string())
            } else {
                Err(Rich::custom(span, format!("'{s}' is not a modifier")))
            }
        })
        .padded_by(ws())
        .repeated()
        .collect::<Vec<String>>()
}

/// Skip a balanced `{ ... }` block, respecting strings and comments.
fn skip_block<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    recursive(|block| {
        let string = just('"')
            .then(none_of("\"\n").repeated())
            .then(just('"'))
            .ignored();
        let chr = just('\'')
            .then(none_of("'\n").repeated())
            .then(just('\''))
            .ignored();
        choice((comment(), string, chr, block, none_of("{}\"'").ignored()))
            .repeated()
            .delimited_by(just('{'), just('}'))
            .ignored()
    })
    .padded_by(ws())
}

fn param<'a>() -> impl Parser<'a, &'a str, ParamDecl, Extra<'a>> + Clone {
    let modifier = choice((
        keyword("out").to(ParamModifier::Out),
        keyword("ref").to(ParamModifier::Ref),
        keyword("in").to(ParamModifier::In),
    ));
    let default_value = symbol("=").then(none_of(",)").repeated()).ignored();

    attributes()
        .ignore_then(modifier.or_not())
        .then(type_expr())
        .then(ident())
        .then_ignore(default_value.or_not())
        .map(|((modifier, ty), name)| ParamDecl { name, ty, modifier })
}

#[derive(Clone)]
enum MemberShape {
    Method(TypeExpr, String, Vec<ParamDecl>),
    Field(TypeExpr, String),
    Ignored,
}

fn member<'a>() -> impl Parser<'a, &'a str, Option<MemberDecl>, Extra<'a>> + Clone {
    let params = param()
        .separated_by(symbol(","))
        .allow_trailing()
        .collect::<Vec<ParamDecl>>()
        .delimited_by(symbol("("), symbol(")"));

    let expr_body = just("=>")
        .then(none_of(";").repeated())
        .then(just(';'))
        .padded_by(ws())
        .ignored();
    let initializer = symbol("=").then(none_of(";").repeated()).ignored();
    let method_body = choice((symbol(";"), expr_body.clone(), skip_block()));
    let field_tail = choice((
        initializer.clone().or_not().then(symbol(";")).ignored(),
        skip_block()
            .then(initializer.then(symbol(";")).or_not())
            .ignored(),
        expr_body,
    ));

    let method = type_expr()
        .then(ident())
        .then(params.clone())
        .then_ignore(method_body.clone())
        .map(|((ret, name), params)| MemberShape::Method(ret, name, params));
    let field = type_expr()
        .then(ident())
        .then_ignore(field_tail)
        .map(|(ty, name)| MemberShape::Field(ty, name));
    // Constructors and finalizers carry no binding information.
    let ctor = symbol("~")
        .or_not()
        .then(ident())
        .then(params)
        .then_ignore(method_body)
        .to(MemberShape::Ignored);

    attributes()
        .then(modifiers())
        .then(choice((method, field, ctor)))
        .map(|((attributes, modifiers), shape)| match shape {
            MemberShape::Method(ret, name, params) => Some(MemberDecl::Method {
                name,
                ret,
                params,
                attributes,
                modifiers,
            }),
            MemberShape::Field(ty, name) => Some(MemberDecl::Field {
                name,
                ty,
                attributes,
                modifiers,
            }),
            MemberShape::Ignored => None,
        })
}

fn type_decl<'a>() -> impl Parser<'a, &'a str, TypeDecl, Extra<'a>> + Clone {
    let bases = symbol(":")
        .ignore_then(
            type_expr()
                .separated_by(symbol(","))
                .at_least(1)
                .collect::<Vec<TypeExpr>>(),
        )
        .or_not()
        .map(|bases| bases.and_then(|b| b.into_iter().next()));

    let members = member()
        .repeated()
        .collect::<Vec<Option<MemberDecl>>>()
        .map(|members| members.into_iter().flatten().collect::<Vec<MemberDecl>>())
        .delimited_by(symbol("{"), symbol("}"));

    let record = attributes()
        .then(modifiers())
        .then(choice((
            keyword("class").to(DeclKind::Class),
            keyword("struct").to(DeclKind::Struct),
        )))
        .then(ident())
        .then(bases.clone())
        .then(members)
        .map(|(((((attributes, modifiers), kind), name), base), members)| TypeDecl {
            name,
            kind,
            module: None,
            namespace: None,
            base,
            attributes,
            modifiers,
            members,
            variants: Vec::new(),
        });

    let variant = attributes()
        .ignore_then(ident())
        .then(symbol("=").ignore_then(integer_literal()).or_not())
        .map(|(name, value)| VariantDecl { name, value });
    let variants = variant
        .separated_by(symbol(","))
        .allow_trailing()
        .collect::<Vec<VariantDecl>>()
        .delimited_by(symbol("{"), symbol("}"));

    let enumeration = attributes()
        .then(modifiers())
        .then_ignore(keyword("enum"))
        .then(ident())
        .then(bases)
        .then(variants)
        .map(|((((attributes, modifiers), name), base), variants)| TypeDecl {
            name,
            kind: DeclKind::Enum,
            module: None,
            namespace: None,
            base,
            attributes,
            modifiers,
            members: Vec::new(),
            variants,
        });

    choice((record, enumeration)).then_ignore(symbol(";").or_not())
}

#[derive(Clone)]
enum Item {
    Skip,
    FileNamespace(String),
    Types(Vec<TypeDecl>),
}

/// Apply file-scoped namespaces to the declarations that follow them.
fn flatten_items(items: Vec<Item>) -> Vec<TypeDecl> {
    let mut current: Option<String> = None;
    let mut out = Vec::new();
    for item in items {
        match item {
            Item::Skip => {}
            Item::FileNamespace(ns) => current = Some(ns),
            Item::Types(decls) => out.extend(decls.into_iter().map(|mut decl| {
                if decl.namespace.is_none() {
                    decl.namespace = current.clone();
                }
                decl
            })),
        }
    }
    out
}

pub fn file_parser<'a>() -> impl Parser<'a, &'a str, Vec<TypeDecl>, Extra<'a>> {
    let items = recursive(|items| {
        let using = keyword("using")
            .then(none_of(";").repeated())
            .then(symbol(";"))
            .to(Item::Skip);
        let file_namespace = keyword("namespace")
            .ignore_then(qualified())
            .then_ignore(symbol(";"))
            .map(|path| Item::FileNamespace(path.join(".")));
        let block_namespace = keyword("namespace")
            .ignore_then(qualified())
            .then(items.delimited_by(symbol("{"), symbol("}")))
            .map(|(path, decls): (Vec<String>, Vec<TypeDecl>)| {
                let ns = path.join(".");
                Item::Types(
                    decls
                        .into_iter()
                        .map(|mut decl| {
                            decl.namespace.get_or_insert_with(|| ns.clone());
                            decl
                        })
                        .collect(),
                )
            });

        choice((
            using,
            file_namespace,
            block_namespace,
            type_decl().map(|decl| Item::Types(vec![decl])),
        ))
        .repeated()
        .collect::<Vec<Item>>()
        .map(flatten_items)
    });

    ws().ignore_then(items).then_ignore(end())
}

/// 1-based line and column of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before
        .rfind('\n')
        .map_or(before.chars().count(), |nl| before[nl + 1..].chars().count())
        + 1;
    (line, col)
}

fn describe(error: &Rich<'_, char>) -> String {
    if let RichReason::Custom(message) = error.reason() {
        return message.to_string();
    }
    let found = match error.found() {
        Some(c) => format!("'{}'", c.escape_debug()),
        None => "end of input".to_string(),
    };
    let expected: Vec<String> = error.expected().take(4).map(|e| e.to_string()).collect();
    if expected.is_empty() {
        format!("unexpected {found}")
    } else {
        format!("unexpected {found}, expected {}", expected.join(" or "))
    }
}

/// Parse one source file into declarations.
pub fn parse_source(source: &str, path: &Path) -> Result<Vec<TypeDecl>, DocumentError> {
    let (output, errors) = file_parser().parse(source).into_output_errors();
    if !errors.is_empty() {
        let diagnostics = errors
            .iter()
            .map(|e| {
                let (line, col) = line_col(source, e.span().start);
                format!("{}:{line}:{col}: {}", path.display(), describe(e))
            })
            .collect();
        return Err(DocumentError::Parse {
            path: path.to_path_buf(),
            diagnostics,
        });
    }
    Ok(output.unwrap_or_default())
}
