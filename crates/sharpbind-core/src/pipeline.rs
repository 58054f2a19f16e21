//! Generation pipeline driver
//!
//! Validates the run's inputs, builds the document, then runs the exporters
//! in their fixed order:
//!
//! 1. native trampolines (only when fast invoke is enabled)
//! 2. install the trampoline set into the binding context
//! 3. managed wrappers
//! 4. placeholder definitions
//!
//! Exporters keep going past individual failures; the driver turns their
//! reports into one verdict.
//!
//! ```no_run
//! # use sharpbind_core::pipeline::{GenerateOptions, Pipeline};
//! # use sharpbind_core::source::SourceKind;
//! let options = GenerateOptions::new(SourceKind::JsonDocument, "Game.json", "/work/Game");
//! let summary = Pipeline::new(options).run_all()?;
//! for line in summary.problems() {
//!     eprintln!("{line}");
//! }
//! summary.verdict()?;
//! # Ok::<(), sharpbind_core::pipeline::PipelineError>(())
//! ```

use crate::binding::{BindingContext, BindingSchema, FunctionId};
use crate::codegen::ExportError;
use crate::codegen::managed::WrapperExporter;
use crate::codegen::native::TrampolineExporter;
use crate::codegen::placeholder::PlaceholderExporter;
use crate::model::{DocumentError, TypeDefinitionDocument};
use crate::report::{ExportReport, Stage};
use crate::source::{self, SourceKind, SourceOptions};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Directory under the project that holds the checkpoint cache.
pub const INTERMEDIATE_DIR: &str = "Intermediate/SharpBind";

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any work began.
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("{stage} export failed with {failures} error(s)")]
    StageFailed { stage: Stage, failures: usize },
}

impl PipelineError {
    /// Format error for display to the user, one diagnostic per line.
    pub fn format_display(&self) -> String {
        match self {
            PipelineError::Document(DocumentError::Parse { diagnostics, .. }) => diagnostics.join("\n"),
            other => other.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub source_kind: SourceKind,
    pub input: PathBuf,
    pub project_dir: PathBuf,
    /// Companion sources of an assembly.
    pub source_dir: Option<PathBuf>,
    pub source_ignore: Option<Regex>,
    pub schema: BindingSchema,
    pub source_options: SourceOptions,
}

impl GenerateOptions {
    pub fn new(source_kind: SourceKind, input: impl Into<PathBuf>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_kind,
            input: input.into(),
            project_dir: project_dir.into(),
            source_dir: None,
            source_ignore: None,
            schema: BindingSchema::NativeBinding,
            source_options: SourceOptions::default(),
        }
    }
}

/// Outcome of a completed run, including stages that failed.
#[derive(Debug)]
pub struct RunSummary {
    pub fast_invoke_functions: BTreeSet<FunctionId>,
    /// Root reported by the trampoline exporter, if the stage ran.
    pub trampoline_root: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub reports: Vec<ExportReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.reports.iter().all(ExportReport::is_success)
    }

    /// Every warning and error across all stages.
    pub fn problems(&self) -> Vec<String> {
        self.reports.iter().flat_map(ExportReport::render_problems).collect()
    }

    pub fn report(&self, stage: Stage) -> Option<&ExportReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }

    /// The run's single verdict: the first failed stage, if any.
    pub fn verdict(&self) -> PipelineResult<()> {
        match self.reports.iter().find(|r| !r.is_success()) {
            Some(report) => Err(PipelineError::StageFailed {
                stage: report.stage,
                failures: report.failures().count(),
            }),
            None => Ok(()),
        }
    }
}

pub struct Pipeline {
    options: GenerateOptions,
}

impl Pipeline {
    pub fn new(options: GenerateOptions) -> Self {
        Pipeline { options }
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    /// Check the inputs. Nothing is read or written before this passes.
    pub fn validate(&self) -> PipelineResult<()> {
        let options = &self.options;
        if !options.project_dir.is_dir() {
            return Err(PipelineError::Validation(format!(
                "project directory '{}' does not exist",
                options.project_dir.display()
            )));
        }
        if !options.input.exists() {
            return Err(PipelineError::Validation(format!(
                "input path '{}' does not exist",
                options.input.display()
            )));
        }
        if options.source_kind == SourceKind::Assembly {
            match &options.source_dir {
                Some(dir) if dir.is_dir() => {}
                Some(dir) => {
                    return Err(PipelineError::Validation(format!(
                        "source directory '{}' does not exist",
                        dir.display()
                    )));
                }
                None => {
                    return Err(PipelineError::Validation(
                        "assembly mode requires a source directory".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn candidate_sources(&self) -> Vec<PathBuf> {
        match (&self.options.source_kind, &self.options.source_dir) {
            (SourceKind::Assembly, Some(dir)) => {
                source::enumerate_source_files(dir, self.options.source_ignore.as_ref())
            }
            _ => Vec::new(),
        }
    }

    pub fn build_document(&self) -> PipelineResult<TypeDefinitionDocument> {
        let document = source::create_document(
            self.options.source_kind,
            &self.options.input,
            &self.options.source_options,
            &self.candidate_sources(),
        )?;
        Ok(document)
    }

    /// Best-effort save of the document to the intermediate cache.
    pub fn checkpoint(&self, document: &TypeDefinitionDocument) -> Option<PathBuf> {
        let name = source::cache_file_name(self.options.source_kind, &self.options.input)?;
        let path = self.options.project_dir.join(INTERMEDIATE_DIR).join(name);
        match document.save_to_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "document checkpoint written");
                Some(path)
            }
            Err(err) => {
                debug!(path = %path.display(), %err, "document checkpoint skipped");
                None
            }
        }
    }

    /// Run every export stage against an already built document.
    pub fn generate(&self, document: Arc<TypeDefinitionDocument>) -> PipelineResult<RunSummary> {
        let mut context = BindingContext::create(document, &self.options.project_dir, self.options.schema);
        let mut reports = Vec::with_capacity(3);
        let mut trampoline_root = None;

        if context.fast_invoke_enabled() {
            let trampolines = TrampolineExporter::new(&context).export();
            trampoline_root = Some(trampolines.root);
            reports.push(trampolines.report);
            context.install_fast_invoke_functions(trampolines.functions)?;
        } else {
            info!(schema = %self.options.schema, "fast invoke disabled, skipping trampolines");
        }

        let wrappers = WrapperExporter::new(&context).export()?;
        reports.push(wrappers.report);

        let placeholders = PlaceholderExporter::new(&context).export();
        reports.push(placeholders.report);

        Ok(RunSummary {
            fast_invoke_functions: context.fast_invoke_functions()?.clone(),
            trampoline_root,
            checkpoint: None,
            reports,
        })
    }

    /// Validate → build the document → checkpoint → export.
    ///
    /// Returns `Err` for validation and document errors. Export problems are
    /// in the summary; see [`RunSummary::verdict`].
    pub fn run_all(&self) -> PipelineResult<RunSummary> {
        self.validate()?;
        let document = self.build_document()?;
        let checkpoint = self.checkpoint(&document);
        let mut summary = self.generate(Arc::new(document))?;
        summary.checkpoint = checkpoint;
        Ok(summary)
    }

    pub fn project_dir(&self) -> &Path {
        &self.options.project_dir
    }
}

impl From<crate::binding::ContextError> for PipelineError {
    fn from(err: crate::binding::ContextError) -> Self {
        PipelineError::Export(ExportError::Context(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentAttributes, FunctionFlags, FunctionRecord, TypeKind, TypeRecord};
    use std::fs;

    fn document(attributes: DocumentAttributes) -> TypeDefinitionDocument {
        let mut actor = TypeRecord::new("Actor", "Engine", TypeKind::Class);
        actor.functions.push(FunctionRecord {
            name: "Jump".into(),
            params: vec![],
            return_type: None,
            flags: FunctionFlags::NATIVE_CALLABLE | FunctionFlags::FAST_INVOKE_ELIGIBLE,
        });
        TypeDefinitionDocument::new("5.4", attributes, vec![actor])
    }

    #[test]
    fn test_validation_order() {
        let dir = tempfile::tempdir().unwrap();
        let missing_project = Pipeline::new(GenerateOptions::new(
            SourceKind::JsonDocument,
            dir.path().join("doc.json"),
            dir.path().join("nope"),
        ));
        let err = missing_project.validate().unwrap_err();
        assert!(err.to_string().contains("project directory"));

        let missing_input = Pipeline::new(GenerateOptions::new(
            SourceKind::JsonDocument,
            dir.path().join("doc.json"),
            dir.path(),
        ));
        assert!(missing_input.validate().unwrap_err().to_string().contains("input path"));

        fs::write(dir.path().join("Game.ron"), "").unwrap();
        let no_sources = Pipeline::new(GenerateOptions::new(
            SourceKind::Assembly,
            dir.path().join("Game.ron"),
            dir.path(),
        ));
        assert!(matches!(no_sources.validate(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_generate_installs_trampoline_set() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(GenerateOptions::new(SourceKind::JsonDocument, "unused", dir.path()));
        let summary = pipeline
            .generate(Arc::new(document(DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION)))
            .unwrap();
        assert!(summary.verdict().is_ok());
        assert_eq!(
            summary.fast_invoke_functions,
            BTreeSet::from([FunctionId::new("Actor", "Jump")])
        );
        assert!(summary.trampoline_root.is_some());
        let wrapper = fs::read_to_string(dir.path().join("Managed/Bindings/Engine/Actor.gen.cs")).unwrap();
        assert!(wrapper.contains("Invocable.Direct(\"SBFI_5Actor_4Jump\", 8, 0)"));
    }

    #[test]
    fn test_csharp_schema_skips_trampolines() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = GenerateOptions::new(SourceKind::JsonDocument, "unused", dir.path());
        options.schema = BindingSchema::CSharpBinding;
        let summary = Pipeline::new(options)
            .generate(Arc::new(document(DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION)))
            .unwrap();
        assert!(summary.trampoline_root.is_none());
        assert!(summary.fast_invoke_functions.is_empty());
        assert!(summary.report(Stage::Trampolines).is_none());
        assert!(!dir.path().join("Intermediate/SharpBind/Native").exists());
    }

    #[test]
    fn test_run_all_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Actor.cs");
        fs::write(&input, "[UClass] public class Actor { [UFunction] public void Jump() {} }").unwrap();
        let summary = Pipeline::new(GenerateOptions::new(SourceKind::SourceCode, &input, dir.path()))
            .run_all()
            .unwrap();
        let checkpoint = summary.checkpoint.expect("checkpoint path");
        assert!(checkpoint.ends_with("Intermediate/SharpBind/Actor.Bindings.Defs.tmp.json"));
        assert!(TypeDefinitionDocument::load_from_file(&checkpoint).is_ok());
    }
}
