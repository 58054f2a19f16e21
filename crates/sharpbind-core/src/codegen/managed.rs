//! Managed Wrapper Generator
//!
//! Emits one C# file per document type. Every bound function gets a static
//! `Invocable` chosen here, once: a direct binding to its trampoline when the
//! function is in the context's fast-invoke set, a by-name lookup otherwise.
//! Set membership is the only input to that choice.

use super::{Artifact, CodeWriter, ExportError, managed_identifier, trampoline_symbol, write_artifact};
use crate::binding::{BindingContext, Dispatch, FunctionId};
use crate::layout::{FrameLayout, FrameSlot};
use crate::model::{
    FunctionRecord, ParamDirection, PropertyFlags, TypeFlags, TypeKind, TypeRecord, TypeRef,
};
use crate::report::{ExportReport, Stage};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

/// Base class of wrapper classes without a bound super type.
pub const ROOT_BASE_CLASS: &str = "NativeObject";
pub const RUNTIME_NAMESPACE: &str = "SharpBind.Runtime";

const BANNER: &[&str] = &[
    "<auto-generated>",
    "Generated by sharpbind. Changes to this file are lost on regeneration.",
    "</auto-generated>",
];

#[derive(Debug)]
pub struct WrapperOutput {
    pub root: PathBuf,
    pub artifacts: Vec<Artifact>,
    pub report: ExportReport,
}

pub struct WrapperExporter<'c> {
    context: &'c BindingContext,
}

impl<'c> WrapperExporter<'c> {
    pub fn new(context: &'c BindingContext) -> Self {
        Self { context }
    }

    pub fn root_directory(&self) -> PathBuf {
        self.context.managed_root()
    }

    /// Render every wrapper. Fails only if the fast-invoke set is not settled;
    /// per-type problems are recorded in the report.
    pub fn generate(&self) -> Result<WrapperOutput, ExportError> {
        let fast = self.context.fast_invoke_functions()?;
        let mut report = ExportReport::new(Stage::Wrappers);
        let mut artifacts = Vec::new();

        for ty in &self.context.document().types {
            match self.render_type(ty, fast, &mut report) {
                Ok(artifact) => {
                    report.record_success(&ty.name);
                    artifacts.push(artifact);
                }
                Err(err) => report.record_failure(&ty.name, err.to_string()),
            }
        }

        Ok(WrapperOutput {
            root: self.root_directory(),
            artifacts,
            report,
        })
    }

    pub fn export(&self) -> Result<WrapperOutput, ExportError> {
        let mut output = self.generate()?;
        for artifact in &output.artifacts {
            if let Err(err) = write_artifact(&output.root, artifact) {
                output
                    .report
                    .record_failure(artifact.relative_path.display().to_string(), err.to_string());
            }
        }
        info!(
            root = %output.root.display(),
            wrappers = output.artifacts.len(),
            "managed wrappers exported"
        );
        Ok(output)
    }

    fn render_type(
        &self,
        ty: &TypeRecord,
        fast: &BTreeSet<FunctionId>,
        report: &mut ExportReport,
    ) -> Result<Artifact, ExportError> {
        let name = managed_identifier(&ty.name)?;
        let module = managed_identifier(&ty.module)?;
        debug!(type_name = %ty.name, kind = ty.kind.as_str(), "rendering wrapper");

        let mut w = CodeWriter::new();
        w.banner("//", BANNER);
        w.line("#nullable enable");
        w.line("using System;");
        w.line("using System.Collections.Generic;");
        w.line("using System.Runtime.InteropServices;");
        w.line(&format!("using {RUNTIME_NAMESPACE};"));
        w.blank();
        w.open(&format!("namespace SharpBind.{module}"));
        if ty.flags.contains(TypeFlags::DEPRECATED) {
            w.line("[Obsolete]");
        }

        match ty.kind {
            TypeKind::Enum => render_enum(&mut w, ty, &name)?,
            TypeKind::Struct => {
                w.line("[StructLayout(LayoutKind.Sequential)]");
                w.open(&format!("public partial struct {name}"));
                for prop in &ty.properties {
                    w.line(&format!(
                        "public {} {};",
                        prop.ty.managed_name(),
                        managed_identifier(&prop.name)?
                    ));
                }
                self.render_functions(&mut w, ty, fast, report)?;
                w.close();
            }
            TypeKind::Class => {
                let base = match &ty.super_type {
                    Some(parent) => managed_identifier(parent)?,
                    None => ROOT_BASE_CLASS.to_string(),
                };
                let modifier = if ty.flags.contains(TypeFlags::ABSTRACT) {
                    "public abstract partial class"
                } else {
                    "public partial class"
                };
                w.open(&format!("{modifier} {name} : {base}"));
                w.line(&format!(
                    "public static readonly NativeType NativeType = NativeType.Find(\"{}\");",
                    ty.native_name()
                ));
                w.blank();
                w.open(&format!("public {name}(IntPtr handle) : base(handle)"));
                w.line("OnBindingInitialized();");
                w.close();
                w.blank();
                w.line("partial void OnBindingInitialized();");
                self.render_properties(&mut w, ty)?;
                self.render_functions(&mut w, ty, fast, report)?;
                w.close();
            }
        }

        w.close();
        Ok(Artifact::new(
            PathBuf::from(&ty.module).join(format!("{}.gen.cs", ty.name)),
            w.finish(),
        ))
    }

    fn render_properties(&self, w: &mut CodeWriter, ty: &TypeRecord) -> Result<(), ExportError> {
        let schema = self.context.schema();
        for prop in ty.properties.iter().filter(|p| schema.exposes_property(p)) {
            let ident = managed_identifier(&prop.name)?;
            let managed = prop.ty.managed_name();
            w.blank();
            w.open(&format!("public {managed} {ident}"));
            w.line(&format!(
                "get => ReflectionAccess.Get<{managed}>(this, \"{}\");",
                prop.name
            ));
            if !prop.flags.contains(PropertyFlags::READ_ONLY) {
                w.line(&format!(
                    "set => ReflectionAccess.Set(this, \"{}\", value);",
                    prop.name
                ));
            }
            w.close();
        }
        Ok(())
    }

    fn render_functions(
        &self,
        w: &mut CodeWriter,
        ty: &TypeRecord,
        fast: &BTreeSet<FunctionId>,
        report: &mut ExportReport,
    ) -> Result<(), ExportError> {
        let schema = self.context.schema();
        let mut bound = Vec::new();

        for function in ty.functions.iter().filter(|f| schema.exposes(f)) {
            let id = FunctionId::of(ty, function);
            if function.is_event() {
                w.blank();
                w.line(&format!("{};", event_signature(function)?));
                continue;
            }
            if ty.kind == TypeKind::Struct && !function.is_static() {
                report.record_recovered(id.to_string(), "instance functions on structs are not bound");
                continue;
            }

            let layout = match dispatch(&id, fast) {
                Dispatch::Direct => match FrameLayout::for_function(ty, function, self.context.document()) {
                    Ok(layout) => Some(layout),
                    Err(err) => {
                        report.record_recovered(
                            id.to_string(),
                            format!("frame layout unavailable, using reflection dispatch: {err}"),
                        );
                        None
                    }
                },
                Dispatch::Reflection => None,
            };
            bound.push((function, layout));
        }

        if bound.is_empty() {
            return Ok(());
        }

        w.blank();
        for (function, layout) in &bound {
            let field = invocable_field(function);
            match layout {
                Some(layout) => w.line(&format!(
                    "static readonly Invocable {field} = Invocable.Direct(\"{}\", {}, {});",
                    trampoline_symbol(&ty.name, &function.name),
                    layout.size,
                    layout.return_size()
                )),
                None => w.line(&format!(
                    "static readonly Invocable {field} = Invocable.Lookup(\"{}\", \"{}\");",
                    ty.name, function.name
                )),
            }
        }

        for (function, layout) in &bound {
            w.blank();
            w.open(&format!(
                "public {}{}",
                if function.is_static() { "static " } else { "" },
                method_signature(function)?
            ));
            match layout {
                Some(layout) => render_direct_body(w, function, layout)?,
                None => render_lookup_body(w, function)?,
            }
            w.close();
        }
        Ok(())
    }
}

fn dispatch(id: &FunctionId, fast: &BTreeSet<FunctionId>) -> Dispatch {
    if fast.contains(id) {
        Dispatch::Direct
    } else {
        Dispatch::Reflection
    }
}

fn render_enum(w: &mut CodeWriter, ty: &TypeRecord, name: &str) -> Result<(), ExportError> {
    w.open(&format!(
        "public enum {name} : {}",
        ty.enum_underlying().managed_name()
    ));
    for value in &ty.enum_values {
        w.line(&format!("{} = {},", managed_identifier(&value.name)?, value.value));
    }
    w.close();
    Ok(())
}

fn invocable_field(function: &FunctionRecord) -> String {
    format!("{}_Invocable", function.name)
}

fn return_type(function: &FunctionRecord) -> String {
    function
        .return_type
        .as_ref()
        .map_or_else(|| "void".to_string(), TypeRef::managed_name)
}

/// `Name(int a, ref float b, out bool c)` with escaped identifiers.
pub(crate) fn method_signature(function: &FunctionRecord) -> Result<String, ExportError> {
    let mut params = Vec::with_capacity(function.params.len());
    for param in &function.params {
        let prefix = match param.direction {
            ParamDirection::In => "",
            ParamDirection::Out => "out ",
            ParamDirection::InOut => "ref ",
        };
        params.push(format!(
            "{prefix}{} {}",
            param.ty.managed_name(),
            managed_identifier(&param.name)?
        ));
    }
    Ok(format!(
        "{} {}({})",
        return_type(function),
        managed_identifier(&function.name)?,
        params.join(", ")
    ))
}

pub(crate) fn event_signature(function: &FunctionRecord) -> Result<String, ExportError> {
    Ok(format!("public partial {}", method_signature(function)?))
}

fn write_slot(slot: &FrameSlot, ty: &TypeRef, value: &str) -> String {
    match ty {
        TypeRef::Object { .. } => format!("frame.WriteHandle({}, {value});", slot.offset),
        TypeRef::Class { .. } => format!("frame.WriteClass({}, {value});", slot.offset),
        other => format!("frame.Write<{}>({}, {value});", other.managed_name(), slot.offset),
    }
}

fn read_value(ty: &TypeRef, source: &str) -> String {
    match ty {
        TypeRef::Object { class } => format!("frame.{source}Handle<{class}>"),
        TypeRef::Class { meta } => format!("frame.{source}Class<{meta}>"),
        other => format!("frame.{source}<{}>", other.managed_name()),
    }
}

fn render_direct_body(
    w: &mut CodeWriter,
    function: &FunctionRecord,
    layout: &FrameLayout,
) -> Result<(), ExportError> {
    w.line(&format!(
        "using var frame = new InteropFrame({}, {});",
        layout.size,
        layout.return_size()
    ));
    if layout.has_receiver() {
        w.line("frame.WriteHandle(0, this);");
    }
    let slots = layout.params();
    for (param, slot) in function.params.iter().zip(slots) {
        if param.direction != ParamDirection::Out {
            w.line(&write_slot(slot, &param.ty, &managed_identifier(&param.name)?));
        }
    }
    w.line(&format!("{}.Invoke(frame);", invocable_field(function)));
    for (param, slot) in function.params.iter().zip(slots) {
        if param.direction.writes_back() {
            w.line(&format!(
                "{} = {}({});",
                managed_identifier(&param.name)?,
                read_value(&param.ty, "Read"),
                slot.offset
            ));
        }
    }
    if let Some(ret) = &function.return_type {
        w.line(&format!("return {}();", read_value(ret, "ReadReturn")));
    }
    Ok(())
}

fn render_lookup_body(w: &mut CodeWriter, function: &FunctionRecord) -> Result<(), ExportError> {
    let mut values = Vec::with_capacity(function.params.len());
    for param in &function.params {
        values.push(match param.direction {
            ParamDirection::Out => format!("default({})", param.ty.managed_name()),
            _ => managed_identifier(&param.name)?,
        });
    }
    w.line(&format!("object?[] args = {{ {} }};", values.join(", ")));

    let target = if function.is_static() { "null" } else { "this" };
    let call = format!("{}.Invoke({target}, args)", invocable_field(function));
    match &function.return_type {
        Some(_) => w.line(&format!("var result = {call};")),
        None => w.line(&format!("{call};")),
    }
    for (index, param) in function.params.iter().enumerate() {
        if param.direction.writes_back() {
            w.line(&format!(
                "{} = {};",
                managed_identifier(&param.name)?,
                cast(&param.ty, &format!("args[{index}]"))
            ));
        }
    }
    if let Some(ret) = &function.return_type {
        w.line(&format!("return {};", cast(ret, "result")));
    }
    Ok(())
}

fn cast(ty: &TypeRef, expr: &str) -> String {
    match ty {
        // Handles may legitimately be null.
        TypeRef::Object { .. } => format!("({}){expr}", ty.managed_name()),
        _ => format!("({}){expr}!", ty.managed_name()),
    }
}

/// Trampoline symbols a rendered wrapper binds directly.
pub fn referenced_symbols(contents: &str) -> Vec<&str> {
    contents
        .match_indices("Invocable.Direct(\"")
        .filter_map(|(start, pat)| {
            let rest = &contents[start + pat.len()..];
            rest.split('"').next()
        })
        .collect()
}
