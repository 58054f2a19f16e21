//! Compiled-assembly binding manifests.
//!
//! A build step next to the managed compiler writes a RON manifest that
//! lists the engine-facing types of an assembly. Types the manifest refers to
//! but does not declare are looked up among the declarations parsed from the
//! companion source directory.

use super::decl::TypeDecl;
use super::parser::parse_source;
use super::resolve::is_exported;
use crate::model::DocumentError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyManifest {
    pub assembly: String,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub allow_fast_invoke: bool,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
}

impl AssemblyManifest {
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&text).map_err(|e| DocumentError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Parse every candidate file and keep the exported declarations.
pub fn parse_candidates(files: &[PathBuf]) -> Result<Vec<TypeDecl>, DocumentError> {
    let mut decls = Vec::new();
    for file in files {
        let text = fs::read_to_string(file).map_err(|source| DocumentError::Io {
            path: file.clone(),
            source,
        })?;
        decls.extend(parse_source(&text, file)?.into_iter().filter(is_exported));
    }
    Ok(decls)
}

/// Manifest declarations plus every source declaration they reach.
pub fn cross_reference(manifest: &AssemblyManifest, sources: Vec<TypeDecl>) -> Vec<TypeDecl> {
    let mut out: Vec<TypeDecl> = manifest
        .types
        .iter()
        .cloned()
        .map(|mut decl| {
            decl.module.get_or_insert_with(|| manifest.assembly.clone());
            decl
        })
        .collect();
    let mut known: HashSet<String> = out.iter().map(|d| d.name.clone()).collect();
    let mut by_name: HashMap<String, TypeDecl> =
        sources.into_iter().map(|d| (d.name.clone(), d)).collect();

    let mut queue: VecDeque<String> = out
        .iter()
        .flat_map(|d| d.mentioned_types())
        .map(str::to_string)
        .collect();
    while let Some(name) = queue.pop_front() {
        if known.contains(&name) {
            continue;
        }
        if let Some(decl) = by_name.remove(&name) {
            debug!(type_name = %name, "pulled declaration from source directory");
            queue.extend(decl.mentioned_types().into_iter().map(str::to_string));
            known.insert(name);
            out.push(decl);
        }
    }
    out
}
