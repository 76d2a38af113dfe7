use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::ledger::Scope;
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Computes the defacing mask once on the center and applies it to the
/// skull images of every modality that needs a defaced image.
pub struct DefacingStep;

#[async_trait]
impl PipelineStage for DefacingStep {
    fn stage(&self) -> Stage {
        Stage::Defacing
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let stage = Stage::Defacing;
        let defacer = ctx
            .backends
            .defacer
            .clone()
            .ok_or_else(|| PreprocessError::config("defacing requires a defacer"))?;
        let center_name = ctx.center_name().to_string();

        // quickshear-style defacers locate the face from the brain surface
        let reference = if defacer.requires_brain_extraction() {
            ctx.center_state()?.brain.clone().ok_or_else(|| {
                PreprocessError::config(format!(
                    "defacer '{}' needs the brain-extracted image of '{}'",
                    defacer.name(),
                    center_name
                ))
            })?
        } else {
            ctx.center_image()?
        };

        info!("🎭 Computing defacing mask on '{}' with {}", center_name, defacer.name());
        let mask = ctx
            .executor
            .call(stage, Some(center_name.as_str()), move || defacer.compute_mask(&reference))
            .await?;
        let mask = Arc::new(mask);
        ctx.ledger.record_mask(stage, Scope::All, Arc::clone(&mask));

        let mask_output = ctx.center.defacing_mask_output().map(|p| p.to_path_buf());
        ctx.save_center_mask(stage, &mask, mask_output).await?;

        let targets = ctx.skull_images(|state| ctx.needs_image(state, ImageStage::Defaced));
        let ledger = ctx.ledger.clone();
        let defaced = ctx
            .executor
            .fan_out(stage, targets, move |name, image: Arc<Volume>| {
                Ok(ledger.apply_step(&image, stage, name)?)
            })
            .await?;

        let mut touched = Vec::with_capacity(defaced.len());
        for (name, image) in defaced {
            ctx.set_image(&name, ImageStage::Defaced, image);
            touched.push(name);
        }

        ctx.save_intermediates(stage, ImageStage::Defaced).await?;
        let message = format!("defacing mask applied to {} modalities", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
