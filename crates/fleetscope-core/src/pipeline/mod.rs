//! Prompt pipeline: templates, step registry, execution and merging.

pub mod executor;
pub mod merge;
pub mod registry;
pub mod sentinel;
pub mod templates;

pub use executor::{
    aggregate_context, ExecutionReport, ExecutionScope, InitialContext, NoopListener,
    PipelineExecutor, StepEvent, StepListener,
};
pub use merge::{MergedResult, Section};
pub use registry::{PromptPipeline, PromptStep, ResolvedStep, StepRegistry, StepScope};
pub use sentinel::is_not_applicable;
pub use templates::{render_prompt, Template, TemplateCatalog};
