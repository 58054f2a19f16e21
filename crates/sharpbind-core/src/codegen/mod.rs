//! Artifact generation: native trampolines, managed wrappers and
//! user-owned placeholder definitions.

pub mod managed;
pub mod native;
pub mod placeholder;
pub mod writer;

use crate::layout::LayoutError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use writer::CodeWriter;

/// A generated source file relative to an exporter's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub relative_path: PathBuf,
    pub contents: String,
}

impl Artifact {
    pub fn new(relative_path: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            relative_path: relative_path.into(),
            contents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
    /// A user-owned file already exists.
    Preserved,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("failed to write '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Context(#[from] crate::binding::ContextError),
}

/// Write an artifact unless the file already holds identical bytes.
pub fn write_artifact(root: &Path, artifact: &Artifact) -> Result<WriteOutcome, ExportError> {
    let path = root.join(&artifact.relative_path);
    if fs::read(&path).is_ok_and(|existing| existing == artifact.contents.as_bytes()) {
        return Ok(WriteOutcome::Unchanged);
    }
    write_file(&path, &artifact.contents)?;
    Ok(WriteOutcome::Written)
}

/// Write an artifact only if no file exists at its path.
pub fn write_artifact_if_absent(root: &Path, artifact: &Artifact) -> Result<WriteOutcome, ExportError> {
    let path = root.join(&artifact.relative_path);
    if path.exists() {
        return Ok(WriteOutcome::Preserved);
    }
    write_file(&path, &artifact.contents)?;
    Ok(WriteOutcome::Written)
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, contents).map_err(io_err)
}

/// Entry point symbol of the trampoline for `type_name.function_name`.
///
/// Each part is length-prefixed, so no two (type, function) pairs share a
/// symbol even when names contain underscores.
pub fn trampoline_symbol(type_name: &str, function_name: &str) -> String {
    format!(
        "SBFI_{}{}_{}{}",
        type_name.len(),
        type_name,
        function_name.len(),
        function_name
    )
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[rustfmt::skip]
const MANAGED_KEYWORDS: &[&str] = &[
    "abstract", "as", "base", "bool", "break", "byte", "case", "catch", "char", "checked",
    "class", "const", "continue", "decimal", "default", "delegate", "do", "double", "else",
    "enum", "event", "explicit", "extern", "false", "finally", "fixed", "float", "for",
    "foreach", "goto", "if", "implicit", "in", "int", "interface", "internal", "is", "lock",
    "long", "namespace", "new", "null", "object", "operator", "out", "override", "params",
    "private", "protected", "public", "readonly", "ref", "return", "sbyte", "sealed",
    "short", "sizeof", "stackalloc", "static", "string", "struct", "switch", "this", "throw",
    "true", "try", "typeof", "uint", "ulong", "unchecked", "unsafe", "ushort", "using",
    "virtual", "void", "volatile", "while",
];

/// Managed spelling of an identifier: keywords get an `@` prefix.
pub fn managed_identifier(name: &str) -> Result<String, ExportError> {
    if !is_identifier(name) {
        return Err(ExportError::InvalidIdentifier(name.to_string()));
    }
    Ok(if MANAGED_KEYWORDS.contains(&name) {
        format!("@{name}")
    } else {
        name.to_string()
    })
}
