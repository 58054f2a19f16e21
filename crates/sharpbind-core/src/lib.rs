pub mod binding;
pub mod codegen;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod source;

pub use binding::{BindingContext, BindingSchema, FunctionId};
pub use model::{DocumentError, TypeDefinitionDocument};
pub use pipeline::{GenerateOptions, Pipeline, PipelineError, RunSummary};
