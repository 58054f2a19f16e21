//! `document` subcommand handler (debug)

use crate::SourceArgs;
use crate::codegen::prepare;
use sharpbind_core::BindingSchema;
use sharpbind_core::pipeline::Pipeline;
use std::path::Path;
use std::process;

/// Build the type definition document and print or save it
pub fn handle_document(source: &SourceArgs, output: Option<&Path>) {
    let options = prepare(source, Path::new("."), BindingSchema::NativeBinding).unwrap_or_else(|err| {
        eprintln!("error: {}", err.format_display());
        process::exit(1);
    });

    let document = match Pipeline::new(options).build_document() {
        Ok(document) => document,
        Err(err) => {
            eprintln!("{}", err.format_display());
            process::exit(1);
        }
    };

    match output {
        Some(path) => {
            if let Err(err) = document.save_to_file(path) {
                eprintln!("Failed to write document '{}': {err}", path.display());
                process::exit(1);
            }
            println!("Document written to: {}", path.display());
        }
        None => match serde_json::to_string_pretty(&document) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to serialize document: {err}");
                process::exit(1);
            }
        },
    }
}
