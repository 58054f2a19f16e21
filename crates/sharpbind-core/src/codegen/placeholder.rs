//! User-owned definition files.
//!
//! One `<Type>.defs.cs` per class or struct holding the members the wrapper
//! declares but leaves for the user to implement. A file that already exists
//! is never touched.

use super::managed::event_signature;
use super::{Artifact, CodeWriter, ExportError, WriteOutcome, managed_identifier, write_artifact_if_absent};
use crate::binding::BindingContext;
use crate::model::{FunctionRecord, ParamDirection, TypeKind, TypeRecord};
use crate::report::{ExportReport, Stage};
use std::path::PathBuf;
use tracing::{debug, info};

const BANNER: &[&str] = &[
    "Generated once by sharpbind. This file belongs to you and is never overwritten.",
];

#[derive(Debug)]
pub struct PlaceholderOutput {
    pub root: PathBuf,
    pub written: Vec<PathBuf>,
    pub preserved: Vec<PathBuf>,
    pub report: ExportReport,
}

pub struct PlaceholderExporter<'c> {
    context: &'c BindingContext,
}

impl<'c> PlaceholderExporter<'c> {
    pub fn new(context: &'c BindingContext) -> Self {
        Self { context }
    }

    pub fn root_directory(&self) -> PathBuf {
        self.context.definitions_root()
    }

    pub fn generate(&self) -> (Vec<Artifact>, ExportReport) {
        let mut report = ExportReport::new(Stage::Placeholders);
        let mut artifacts = Vec::new();
        for ty in &self.context.document().types {
            if ty.kind == TypeKind::Enum {
                continue;
            }
            match self.render_type(ty) {
                Ok(artifact) => artifacts.push(artifact),
                Err(err) => report.record_failure(&ty.name, err.to_string()),
            }
        }
        (artifacts, report)
    }

    pub fn export(&self) -> PlaceholderOutput {
        let root = self.root_directory();
        let (artifacts, mut report) = self.generate();
        let mut written = Vec::new();
        let mut preserved = Vec::new();

        for artifact in artifacts {
            let subject = artifact.relative_path.display().to_string();
            match write_artifact_if_absent(&root, &artifact) {
                Ok(WriteOutcome::Preserved) => {
                    debug!(path = %subject, "keeping existing definitions");
                    report.record_success(subject);
                    preserved.push(artifact.relative_path);
                }
                Ok(_) => {
                    report.record_success(subject);
                    written.push(artifact.relative_path);
                }
                Err(err) => report.record_failure(subject, err.to_string()),
            }
        }

        info!(
            root = %root.display(),
            written = written.len(),
            preserved = preserved.len(),
            "placeholder definitions exported"
        );
        PlaceholderOutput {
            root,
            written,
            preserved,
            report,
        }
    }

    fn render_type(&self, ty: &TypeRecord) -> Result<Artifact, ExportError> {
        let name = managed_identifier(&ty.name)?;
        let module = managed_identifier(&ty.module)?;
        let schema = self.context.schema();

        let mut w = CodeWriter::new();
        w.banner("//", BANNER);
        w.line("#nullable enable");
        w.line("using System;");
        w.blank();
        w.open(&format!("namespace SharpBind.{module}"));
        match ty.kind {
            TypeKind::Struct => w.open(&format!("public partial struct {name}")),
            _ => w.open(&format!("public partial class {name}")),
        }

        let mut first = true;
        if ty.kind == TypeKind::Class {
            w.open("partial void OnBindingInitialized()");
            w.close();
            first = false;
        }
        for event in ty.functions.iter().filter(|f| f.is_event() && schema.exposes(f)) {
            if !first {
                w.blank();
            }
            first = false;
            render_event(&mut w, event)?;
        }

        w.close();
        w.close();
        Ok(Artifact::new(
            PathBuf::from(&ty.module).join(format!("{}.defs.cs", ty.name)),
            w.finish(),
        ))
    }
}

fn render_event(w: &mut CodeWriter, event: &FunctionRecord) -> Result<(), ExportError> {
    w.open(&event_signature(event)?);
    for param in event.params.iter().filter(|p| p.direction == ParamDirection::Out) {
        w.line(&format!("{} = default;", managed_identifier(&param.name)?));
    }
    if event.return_type.is_some() {
        w.line("return default;");
    }
    w.close();
    Ok(())
}
