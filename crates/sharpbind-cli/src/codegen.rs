//! `codegen` subcommand handler

use crate::SourceArgs;
use regex::Regex;
use sharpbind_core::BindingSchema;
use sharpbind_core::pipeline::{GenerateOptions, Pipeline, PipelineError};
use std::path::Path;
use std::{fs, process};
use tracing::info;

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    println!("FAIL");
    process::exit(1);
}

fn canonical(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Check the inputs in order and compile the ignore pattern last.
pub fn prepare(source: &SourceArgs, project: &Path, schema: BindingSchema) -> Result<GenerateOptions, PipelineError> {
    let mut options = source.options(project, schema);
    Pipeline::new(options.clone()).validate()?;
    if let Some(pattern) = &source.source_file_ignore_regex {
        let regex = Regex::new(pattern)
            .map_err(|e| PipelineError::Validation(format!("invalid source file ignore regex: {e}")))?;
        options.source_ignore = Some(regex);
    }
    Ok(options)
}

/// Generate every binding artifact and print the export report
pub fn handle_codegen(source: &SourceArgs, project: &Path, schema: BindingSchema) {
    let options = match prepare(source, project, schema) {
        Ok(options) => options,
        Err(err) => fail(&err.format_display()),
    };

    info!(
        version = crate::version(),
        mode = options.source_kind.as_str(),
        input = %canonical(&options.input),
        project = %canonical(&options.project_dir),
        schema = %options.schema,
        "sharpbind codegen"
    );

    let pipeline = Pipeline::new(options);
    let summary = match pipeline.run_all() {
        Ok(summary) => summary,
        Err(err) => fail(&err.format_display()),
    };

    for report in &summary.reports {
        info!("{report}");
    }
    info!(fast_invoke = summary.fast_invoke_functions.len(), "generation finished");

    for line in summary.problems() {
        println!("{line}");
    }
    match summary.verdict() {
        Ok(()) => println!("PASS"),
        Err(err) => {
            eprintln!("error: {err}");
            println!("FAIL");
            process::exit(1);
        }
    }
}
