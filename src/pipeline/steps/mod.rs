use super::context::RunContext;
use crate::error::Result;
use crate::types::Stage;
use async_trait::async_trait;

/// One pipeline stage. Stages run strictly in sequence and each reads and
/// updates the shared run context.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome>;
}

/// What a stage touched
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub modalities: Vec<String>,
    pub message: String,
}

impl StageOutcome {
    pub fn new(modalities: Vec<String>, message: impl Into<String>) -> Self {
        Self { modalities, message: message.into() }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self { modalities: Vec::new(), message: message.into() }
    }
}

pub mod atlas_correction;
pub mod atlas_registration;
pub mod bias_correction;
pub mod brain_extraction;
pub mod coregistration;
pub mod defacing;

pub use atlas_correction::AtlasCorrectionStep;
pub use atlas_registration::AtlasRegistrationStep;
pub use bias_correction::BiasCorrectionStep;
pub use brain_extraction::BrainExtractionStep;
pub use coregistration::CoregistrationStep;
pub use defacing::DefacingStep;

/// The step implementing a stage
pub fn step_for(stage: Stage) -> Box<dyn PipelineStage> {
    match stage {
        Stage::Coregistration => Box::new(CoregistrationStep),
        Stage::AtlasRegistration => Box::new(AtlasRegistrationStep),
        Stage::AtlasCorrection => Box::new(AtlasCorrectionStep),
        Stage::BiasCorrection => Box::new(BiasCorrectionStep),
        Stage::BrainExtraction => Box::new(BrainExtractionStep),
        Stage::Defacing => Box::new(DefacingStep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_for_dispatches_to_matching_stage() {
        for stage in Stage::ALL {
            assert_eq!(step_for(stage).stage(), stage);
        }
    }
}
