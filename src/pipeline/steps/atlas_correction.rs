use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::ledger::Scope;
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Refines the atlas alignment of moving modalities by registering them
/// again, this time onto the center's atlas-space image.
pub struct AtlasCorrectionStep;

#[async_trait]
impl PipelineStage for AtlasCorrectionStep {
    fn stage(&self) -> Stage {
        Stage::AtlasCorrection
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let stage = Stage::AtlasCorrection;
        if ctx.center.modality().atlas_correction() {
            debug!("Center '{}' is its own atlas reference, nothing to correct", ctx.center_name());
        }

        let targets = ctx.moving_images(|m| m.atlas_correction());
        if targets.is_empty() {
            return Ok(StageOutcome::skipped("no moving modality enables atlas correction"));
        }

        let registrator = ctx.backends.atlas_registrator.clone().ok_or_else(|| {
            PreprocessError::config("atlas correction requires an atlas registrator")
        })?;
        let reference = ctx.center_image()?;
        info!(
            "🎯 Atlas-correcting {} modalities against '{}'",
            targets.len(),
            ctx.center_name()
        );

        let backend = Arc::clone(&registrator);
        let results = ctx
            .executor
            .fan_out(stage, targets, move |_, image: Arc<Volume>| {
                let (corrected, forward) = backend.register(&reference, &image)?;
                let inverse = backend.invert(&forward)?;
                Ok((corrected, forward, inverse))
            })
            .await?;

        let mut touched = Vec::with_capacity(results.len());
        for (name, (corrected, forward, inverse)) in results {
            ctx.ledger.record_transform(
                stage,
                Scope::modality(name.as_str()),
                forward,
                inverse,
                Arc::clone(&registrator),
            );
            ctx.set_current(&name, corrected);
            touched.push(name);
        }

        ctx.save_intermediates(stage, ImageStage::Skull).await?;
        let message = format!("atlas-corrected {} modalities", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
