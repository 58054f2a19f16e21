use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use sharpbind_core::BindingSchema;
use sharpbind_core::pipeline::GenerateOptions;
use sharpbind_core::model::DocumentAttributes;
use sharpbind_core::source::{SourceKind, SourceOptions};
use std::path::{Path, PathBuf};

mod codegen;
mod document;
mod logging;

use codegen::handle_codegen;
use document::handle_document;

/// Get the version string including git revision
fn version() -> &'static str {
    concat!(env!("CARGO_PKG_VERSION"), " (git:", env!("GIT_HASH"), ")")
}

#[derive(Parser)]
#[command(
    author,
    version = version(),
    about = "Binding generator for engine/.NET interop",
    long_about = None,
    disable_help_subcommand = true
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate trampolines, managed wrappers and placeholder definitions
    Codegen {
        #[command(flatten)]
        source: SourceArgs,
        /// Project directory that receives the generated files
        #[arg(short, long)]
        project: PathBuf,
        /// Binding schema
        #[arg(short, long, value_enum, default_value_t = SchemaArg::Native)]
        schema: SchemaArg,
    },
    /// Build the type definition document and print it as JSON (debug)
    #[command(hide = true)]
    Document {
        #[command(flatten)]
        source: SourceArgs,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    /// Binding manifest of a compiled assembly
    Assembly,
    /// Managed source file or directory
    Source,
    /// Previously saved document
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SchemaArg {
    Native,
    Blueprint,
    Csharp,
}

impl From<SchemaArg> for BindingSchema {
    fn from(schema: SchemaArg) -> Self {
        match schema {
            SchemaArg::Native => BindingSchema::NativeBinding,
            SchemaArg::Blueprint => BindingSchema::BlueprintBinding,
            SchemaArg::Csharp => BindingSchema::CSharpBinding,
        }
    }
}

#[derive(Args)]
struct SourceArgs {
    /// Kind of input
    #[arg(short = 't', long = "type", value_enum)]
    kind: SourceArg,
    /// Input file or directory
    #[arg(short, long)]
    input: PathBuf,
    /// Companion sources of an assembly
    #[arg(long = "source-directory")]
    source_directory: Option<PathBuf>,
    /// Skip source files whose path matches this pattern
    #[arg(long = "source-file-ignore-regex")]
    source_file_ignore_regex: Option<String>,
    /// Engine version recorded in the document
    #[arg(long)]
    engine_version: Option<String>,
    /// Allow fast-invoke trampolines for this document
    #[arg(long)]
    allow_fast_invoke: bool,
    /// Module for declarations that name none
    #[arg(long)]
    module: Option<String>,
}

impl SourceArgs {
    /// Options without the ignore pattern, which is compiled after the path checks.
    fn options(&self, project: &Path, schema: BindingSchema) -> GenerateOptions {
        let kind = match self.kind {
            SourceArg::Assembly => SourceKind::Assembly,
            SourceArg::Source => SourceKind::SourceCode,
            SourceArg::Json => SourceKind::JsonDocument,
        };
        let mut source_options = SourceOptions::default();
        if let Some(version) = &self.engine_version {
            source_options.engine_version = version.clone();
        }
        if let Some(module) = &self.module {
            source_options.default_module = module.clone();
        }
        if self.allow_fast_invoke {
            source_options.attributes |= DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION;
        }

        let mut options = GenerateOptions::new(kind, &self.input, project);
        options.source_dir = self.source_directory.clone();
        options.schema = schema;
        options.source_options = source_options;
        options
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match &cli.command {
        Commands::Codegen {
            source,
            project,
            schema,
        } => {
            handle_codegen(source, project, (*schema).into());
        }
        Commands::Document { source, output } => {
            handle_document(source, output.as_deref());
        }
    }
}
