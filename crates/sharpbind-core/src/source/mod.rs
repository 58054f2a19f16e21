//! Document construction from the three supported inputs.

pub mod assembly;
pub mod decl;
pub mod parser;
pub mod resolve;

use crate::model::{DocumentAttributes, DocumentError, TypeDefinitionDocument};
use assembly::{AssemblyManifest, cross_reference, parse_candidates};
use regex::Regex;
use resolve::Resolver;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const DEFAULT_ENGINE_VERSION: &str = "5.4";
pub const SOURCE_EXTENSION: &str = "cs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Binding manifest of a compiled assembly, cross-referenced with sources.
    Assembly,
    /// Managed source files parsed directly.
    SourceCode,
    /// A previously saved document.
    JsonDocument,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Assembly => "assembly",
            SourceKind::SourceCode => "source",
            SourceKind::JsonDocument => "json",
        }
    }
}

/// Options that only some source kinds consult.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub engine_version: String,
    pub attributes: DocumentAttributes,
    /// Module assigned to declarations with no module or namespace.
    pub default_module: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            engine_version: DEFAULT_ENGINE_VERSION.to_string(),
            attributes: DocumentAttributes::empty(),
            default_module: "Game".to_string(),
        }
    }
}

/// List the managed source files under `dir`, sorted, skipping any whose
/// path matches `ignore`.
pub fn enumerate_source_files(dir: &Path, ignore: Option<&Regex>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION))
        .filter(|path| {
            ignore.is_none_or(|re| !re.is_match(&path.to_string_lossy().replace('\\', "/")))
        })
        .collect();
    files.sort();
    files
}

/// Build a validated document.
///
/// `candidate_sources` are the companion source files of assembly mode; the
/// other kinds ignore them. Any unresolved type reference or malformed input
/// is an error.
pub fn create_document(
    kind: SourceKind,
    input: &Path,
    options: &SourceOptions,
    candidate_sources: &[PathBuf],
) -> Result<TypeDefinitionDocument, DocumentError> {
    if !input.exists() {
        return Err(DocumentError::MissingInput(input.to_path_buf()));
    }

    let document = match kind {
        SourceKind::JsonDocument => TypeDefinitionDocument::load_from_file(input)?,
        SourceKind::SourceCode => {
            let files = if input.is_dir() {
                enumerate_source_files(input, None)
            } else {
                vec![input.to_path_buf()]
            };
            debug!(files = files.len(), "parsing managed sources");
            let decls = parse_candidates(&files)?;
            Resolver::new(&decls, &options.default_module)?
                .into_document(&options.engine_version, options.attributes)?
        }
        SourceKind::Assembly => {
            let manifest = AssemblyManifest::load(input)?;
            let sources = parse_candidates(candidate_sources)?;
            let decls = cross_reference(&manifest, sources);
            let mut attributes = options.attributes;
            if manifest.allow_fast_invoke {
                attributes |= DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION;
            }
            let engine_version = manifest
                .engine_version
                .as_deref()
                .unwrap_or(&options.engine_version);
            Resolver::new(&decls, &manifest.assembly)?.into_document(engine_version, attributes)?
        }
    };

    info!(
        kind = kind.as_str(),
        types = document.types.len(),
        functions = document.function_count(),
        "document constructed"
    );
    Ok(document)
}

/// File name of the checkpoint cache for an input, if the kind has one.
pub fn cache_file_name(kind: SourceKind, input: &Path) -> Option<String> {
    let name = input.file_name()?.to_string_lossy().into_owned();
    match kind {
        SourceKind::SourceCode => {
            let stem = if input.is_dir() {
                name
            } else {
                input.file_stem()?.to_string_lossy().into_owned()
            };
            Some(format!("{stem}.Bindings.Defs.tmp.json"))
        }
        SourceKind::Assembly => Some(format!("{name}.tmp.json")),
        SourceKind::JsonDocument => None,
    }
}
