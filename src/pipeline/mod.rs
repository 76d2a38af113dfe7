pub mod backends;
pub mod cancellation;
pub mod context;
pub mod executor;
pub mod materialize;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod steps;
pub mod variants;

pub use backends::Backends;
pub use cancellation::CancellationToken;
pub use executor::StageExecutor;
pub use orchestrator::{PipelineOrchestrator, RunOptions};
pub use plan::StagePlan;
pub use report::{RunReport, StageReport};
pub use variants::{AtlasCentricPreprocessor, NativeSpacePreprocessor, PipelineVariant};
