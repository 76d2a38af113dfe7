use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// N4 bias field correction of every modality that enables it. Intensity
/// only, so nothing is recorded in the ledger.
pub struct BiasCorrectionStep;

#[async_trait]
impl PipelineStage for BiasCorrectionStep {
    fn stage(&self) -> Stage {
        Stage::BiasCorrection
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let stage = Stage::BiasCorrection;
        let targets = ctx.skull_images(|state| state.modality.bias_correction());
        if targets.is_empty() {
            return Ok(StageOutcome::skipped("no modality enables bias correction"));
        }

        let corrector = ctx
            .backends
            .bias_corrector
            .clone()
            .ok_or_else(|| PreprocessError::config("bias correction requires an N4 bias corrector"))?;
        info!("🩻 Bias-correcting {} modalities with {}", targets.len(), corrector.name());

        let results = ctx
            .executor
            .fan_out(stage, targets, move |_, image: Arc<Volume>| corrector.correct(&image))
            .await?;

        let mut touched = Vec::with_capacity(results.len());
        for (name, corrected) in results {
            ctx.set_current(&name, corrected);
            touched.push(name);
        }

        ctx.save_intermediates(stage, ImageStage::Skull).await?;
        let message = format!("bias-corrected {} modalities", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
