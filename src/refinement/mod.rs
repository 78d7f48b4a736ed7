pub mod analysis;
pub mod generator;
pub mod orchestrator;
pub mod protection;

pub use analysis::{Analysis, AnalysisPolicy, Suggestion};
pub use generator::{
    CodeGenerator, Feedback, GeneratedStrategy, GenerationRequest, HttpCodeGenerator,
    RetryingGenerator, TemplateGenerator,
};
pub use orchestrator::{
    CancelFlag, IterationRecord, Orchestrator, Phase, RefinementOutcome, RefinementRequest,
    RefinementSettings, RunStatus,
};
pub use protection::ProtectedSet;
