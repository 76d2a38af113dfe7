use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::ledger::Scope;
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Computes the brain mask once on the center and transfers it to every
/// modality that needs a brain-extracted image.
pub struct BrainExtractionStep;

#[async_trait]
impl PipelineStage for BrainExtractionStep {
    fn stage(&self) -> Stage {
        Stage::BrainExtraction
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let stage = Stage::BrainExtraction;
        let extractor = ctx.backends.brain_extractor.clone().ok_or_else(|| {
            PreprocessError::config("brain extraction requires a brain extractor")
        })?;
        let center_name = ctx.center_name().to_string();
        let center = ctx.center_image()?;

        info!("🧠 Computing brain mask on '{}' with {}", center_name, extractor.name());
        let mask = ctx
            .executor
            .call(stage, Some(center_name.as_str()), move || extractor.compute_mask(&center))
            .await?;
        let mask = Arc::new(mask);
        ctx.ledger.record_mask(stage, Scope::All, Arc::clone(&mask));

        let mask_output = ctx.center.bet_mask_output().map(|p| p.to_path_buf());
        ctx.save_center_mask(stage, &mask, mask_output).await?;

        let targets = ctx.skull_images(|state| ctx.needs_image(state, ImageStage::BrainExtracted));
        let ledger = ctx.ledger.clone();
        let extracted = ctx
            .executor
            .fan_out(stage, targets, move |name, image: Arc<Volume>| {
                Ok(ledger.apply_step(&image, stage, name)?)
            })
            .await?;

        let mut touched = Vec::with_capacity(extracted.len());
        for (name, brain) in extracted {
            ctx.set_image(&name, ImageStage::BrainExtracted, brain);
            touched.push(name);
        }

        ctx.save_intermediates(stage, ImageStage::BrainExtracted).await?;
        let message = format!("brain mask applied to {} modalities", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
