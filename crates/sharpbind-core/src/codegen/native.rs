//! Native Trampoline Generator
//!
//! Emits one C++ entry point per fast-invoke candidate with the uniform
//! signature
//!
//! ```text
//! extern "C" int32 SYMBOL(uint8* Args, int32 ArgCount, uint8* Ret)
//! ```
//!
//! The body unpacks typed arguments from `Args` at the offsets given by
//! [`FrameLayout`], calls the native function, writes out and in-out values
//! back into `Args` and stores the return value in `Ret`. A function that
//! cannot be lowered is skipped with a warning and left to reflection
//! dispatch; the batch continues.

use super::{Artifact, CodeWriter, ExportError, is_identifier, trampoline_symbol, write_artifact};
use crate::binding::{BindingContext, FunctionId};
use crate::layout::{FrameLayout, FrameSlot, NativeCategory, NativeRepr};
use crate::model::{FunctionRecord, ParamDirection, TypeRecord};
use crate::report::{ExportReport, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const HEADER_FILE: &str = "SharpBindFastInvoke.gen.h";
pub const MANIFEST_FILE: &str = "FastInvokeManifest.gen.json";

pub const STATUS_OK: i32 = 0;
pub const STATUS_BAD_ARG_COUNT: i32 = 1;
pub const STATUS_NULL_SELF: i32 = 2;

const BANNER: &[&str] = &[
    "Auto-generated by sharpbind. Do not edit manually.",
    "Fast-invoke trampolines for direct managed-to-native calls.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrampolineEntry {
    pub id: FunctionId,
    pub symbol: String,
    pub layout: FrameLayout,
}

/// Index of generated trampolines, read by the runtime host at load time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FastInvokeManifest {
    pub engine_version: String,
    pub entries: Vec<TrampolineEntry>,
}

impl FastInvokeManifest {
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn find(&self, id: &FunctionId) -> Option<&TrampolineEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }
}

/// Result of a trampoline pass.
#[derive(Debug)]
pub struct TrampolineOutput {
    pub root: PathBuf,
    pub artifacts: Vec<Artifact>,
    pub manifest: FastInvokeManifest,
    /// Functions with a trampoline; a subset of the candidates.
    pub functions: BTreeSet<FunctionId>,
    /// Type files from earlier runs that no longer have trampolines.
    pub removed: Vec<PathBuf>,
    pub report: ExportReport,
}

pub struct TrampolineExporter<'c> {
    context: &'c BindingContext,
}

impl<'c> TrampolineExporter<'c> {
    pub fn new(context: &'c BindingContext) -> Self {
        Self { context }
    }

    pub fn root_directory(&self) -> PathBuf {
        self.context.native_root()
    }

    /// Render every artifact without touching the filesystem.
    pub fn generate(&self) -> TrampolineOutput {
        let document = self.context.document();
        let mut report = ExportReport::new(Stage::Trampolines);
        let mut artifacts = Vec::new();
        let mut manifest = FastInvokeManifest {
            engine_version: document.engine_version.clone(),
            entries: Vec::new(),
        };

        let mut by_type: BTreeMap<usize, Vec<&FunctionRecord>> = BTreeMap::new();
        for (ty, function) in self.context.fast_invoke_candidates() {
            let index = document
                .types
                .iter()
                .position(|t| t.name == ty.name)
                .unwrap_or_default();
            by_type.entry(index).or_default().push(function);
        }

        for (index, functions) in by_type {
            let ty = &document.types[index];
            let mut body = CodeWriter::new();
            let mut asserts = BTreeSet::new();
            let mut entries = Vec::new();

            for function in functions {
                let id = FunctionId::of(ty, function);
                match self.render_function(ty, function) {
                    Ok((code, entry)) => {
                        collect_asserts(&entry.layout, &mut asserts);
                        body.append(&code);
                        body.blank();
                        report.record_success(id.to_string());
                        entries.push(entry);
                    }
                    Err(err) => {
                        report.record_recovered(
                            id.to_string(),
                            format!("no trampoline, using reflection dispatch: {err}"),
                        );
                    }
                }
            }

            if entries.is_empty() {
                continue;
            }
            artifacts.push(self.render_type_file(ty, &asserts, body));
            manifest.entries.extend(entries);
        }

        artifacts.push(Artifact::new(HEADER_FILE, render_header()));

        let functions = manifest.entries.iter().map(|e| e.id.clone()).collect();
        TrampolineOutput {
            root: self.root_directory(),
            artifacts,
            manifest,
            functions,
            removed: Vec::new(),
            report,
        }
    }

    /// Generate and write. A type whose file cannot be written loses its
    /// trampolines, so the returned set only names code that exists on disk.
    pub fn export(&self) -> TrampolineOutput {
        let mut output = self.generate();
        let root = output.root.clone();

        let mut current = BTreeSet::new();
        for artifact in &output.artifacts {
            match write_artifact(&root, artifact) {
                Ok(_) => {
                    current.insert(root.join(&artifact.relative_path));
                }
                Err(err) => {
                    let type_name = type_of_artifact(artifact);
                    output.report.record_failure(artifact.relative_path.display().to_string(), err.to_string());
                    if let Some(type_name) = type_name {
                        output.manifest.entries.retain(|e| e.id.type_name != type_name);
                    }
                }
            }
        }
        output.removed = remove_stale_type_files(&root, &current, &mut output.report);
        output.functions = output.manifest.entries.iter().map(|e| e.id.clone()).collect();

        match serde_json::to_string_pretty(&output.manifest) {
            Ok(json) => {
                let manifest = Artifact::new(MANIFEST_FILE, json);
                if let Err(err) = write_artifact(&root, &manifest) {
                    output.report.record_failure(MANIFEST_FILE, err.to_string());
                }
                output.artifacts.push(manifest);
            }
            Err(err) => output.report.record_failure(MANIFEST_FILE, err.to_string()),
        }

        info!(
            root = %root.display(),
            trampolines = output.functions.len(),
            "native trampolines exported"
        );
        output
    }

    fn render_type_file(&self, ty: &TypeRecord, asserts: &BTreeSet<(String, usize)>, body: CodeWriter) -> Artifact {
        let mut w = CodeWriter::new();
        w.banner("//", BANNER);
        w.line(&format!("#include \"{HEADER_FILE}\""));
        w.line(&format!("#include \"{}.h\"", ty.module));
        w.blank();
        for (native_type, size) in asserts {
            w.line(&format!(
                "static_assert(sizeof({native_type}) == {size}, \"{native_type} does not match the fast-invoke layout\");"
            ));
        }
        if !asserts.is_empty() {
            w.blank();
        }
        let mut out = w.finish();
        out.push_str(body.finish().trim_end());
        out.push('\n');
        Artifact::new(
            PathBuf::from(&ty.module).join(format!("{}.FastInvoke.gen.cpp", ty.name)),
            out,
        )
    }

    fn render_function(
        &self,
        ty: &TypeRecord,
        function: &FunctionRecord,
    ) -> Result<(CodeWriter, TrampolineEntry), ExportError> {
        for name in [ty.name.as_str(), function.name.as_str()]
            .into_iter()
            .chain(function.params.iter().map(|p| p.name.as_str()))
        {
            if !is_identifier(name) {
                return Err(ExportError::InvalidIdentifier(name.to_string()));
            }
        }
        let layout = FrameLayout::for_function(ty, function, self.context.document())?;
        let symbol = trampoline_symbol(&ty.name, &function.name);
        debug!(%symbol, size = layout.size, "rendering trampoline");

        let mut w = CodeWriter::new();
        w.line(&format!("// {}.{}", ty.name, function.name));
        w.open(&format!(
            "extern \"C\" SHARPBIND_FAST_INVOKE_API int32 {symbol}(uint8* Args, int32 ArgCount, uint8* Ret)"
        ));
        w.open(&format!("if (ArgCount != {})", layout.arg_count()));
        w.line("return SHARPBIND_FI_BAD_ARG_COUNT;");
        w.close();
        if layout.arg_count() == 0 {
            w.line("(void)Args;");
        }
        if layout.ret.is_none() {
            w.line("(void)Ret;");
        }

        if layout.has_receiver() {
            let receiver = &layout.slots[0].repr.native_type;
            w.line(&format!("{receiver} Self = {};", read_slot(receiver, 0)));
            w.open("if (Self == nullptr)");
            w.line("return SHARPBIND_FI_NULL_SELF;");
            w.close();
        }

        let mut call_args = Vec::new();
        for slot in layout.params() {
            let local = format!("Arg_{}", slot.name);
            match slot.direction {
                ParamDirection::Out => w.line(&format!("{} {local}{{}};", slot.repr.native_type)),
                ParamDirection::In | ParamDirection::InOut => w.line(&format!(
                    "{} {local} = {};",
                    slot.repr.native_type,
                    read_slot(&slot.repr.native_type, slot.offset)
                )),
            }
            call_args.push(local);
        }

        let target = if function.is_static() {
            format!("{}::{}", ty.native_name(), function.name)
        } else {
            format!("Self->{}", function.name)
        };
        let call = format!("{target}({})", call_args.join(", "));
        match &layout.ret {
            Some(ret) => w.line(&format!("{} Result = {call};", ret.native_type)),
            None => w.line(&format!("{call};")),
        }

        for slot in layout.params().iter().filter(|s| s.direction.writes_back()) {
            w.line(&write_back(slot));
        }
        if let Some(ret) = &layout.ret {
            w.line(&format!("*reinterpret_cast<{}*>(Ret) = Result;", ret.native_type));
        }
        w.line("return SHARPBIND_FI_OK;");
        w.close();

        Ok((
            w,
            TrampolineEntry {
                id: FunctionId::of(ty, function),
                symbol,
                layout,
            },
        ))
    }
}

fn read_slot(native_type: &str, offset: usize) -> String {
    format!("*reinterpret_cast<{native_type}*>(Args + {offset})")
}

fn write_back(slot: &FrameSlot) -> String {
    format!(
        "*reinterpret_cast<{}*>(Args + {}) = Arg_{};",
        slot.repr.native_type, slot.offset, slot.name
    )
}

/// Size checks for engine types whose layout is assumed, not builtin.
fn collect_asserts(layout: &FrameLayout, out: &mut BTreeSet<(String, usize)>) {
    fn visit(repr: &NativeRepr, out: &mut BTreeSet<(String, usize)>) {
        match &repr.category {
            NativeCategory::Enum { .. } | NativeCategory::Name => {
                out.insert((repr.native_type.clone(), repr.size));
            }
            NativeCategory::Aggregate { fields, .. } => {
                out.insert((repr.native_type.clone(), repr.size));
                for field in fields {
                    visit(&field.repr, out);
                }
            }
            _ => {}
        }
    }
    for slot in &layout.slots {
        visit(&slot.repr, out);
    }
    if let Some(ret) = &layout.ret {
        visit(ret, out);
    }
}

fn render_header() -> String {
    let mut w = CodeWriter::new();
    w.banner("//", BANNER);
    w.line("#pragma once");
    w.blank();
    w.line("#include \"CoreMinimal.h\"");
    w.blank();
    w.line(&format!("#define SHARPBIND_FI_OK {STATUS_OK}"));
    w.line(&format!("#define SHARPBIND_FI_BAD_ARG_COUNT {STATUS_BAD_ARG_COUNT}"));
    w.line(&format!("#define SHARPBIND_FI_NULL_SELF {STATUS_NULL_SELF}"));
    w.blank();
    w.line("#if PLATFORM_WINDOWS");
    w.line("#define SHARPBIND_FAST_INVOKE_API __declspec(dllexport)");
    w.line("#else");
    w.line("#define SHARPBIND_FAST_INVOKE_API __attribute__((visibility(\"default\")))");
    w.line("#endif");
    w.finish()
}

/// Delete type files left by earlier runs, so every exported `SBFI_` symbol
/// is listed in the manifest.
fn remove_stale_type_files(root: &Path, current: &BTreeSet<PathBuf>, report: &mut ExportReport) -> Vec<PathBuf> {
    let stale: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".FastInvoke.gen.cpp"))
        })
        .filter(|path| !current.contains(path))
        .collect();

    let mut removed = Vec::with_capacity(stale.len());
    for path in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed stale trampoline file");
                removed.push(path);
            }
            Err(err) => report.record_failure(path.display().to_string(), err.to_string()),
        }
    }
    removed
}

fn type_of_artifact(artifact: &Artifact) -> Option<String> {
    artifact
        .relative_path
        .file_name()?
        .to_str()?
        .strip_suffix(".FastInvoke.gen.cpp")
        .map(str::to_string)
}
