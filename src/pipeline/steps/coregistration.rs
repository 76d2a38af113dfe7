use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::ledger::Scope;
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Registers every moving modality onto the center's native image. The center
/// is the reference and gets no ledger entry.
pub struct CoregistrationStep;

#[async_trait]
impl PipelineStage for CoregistrationStep {
    fn stage(&self) -> Stage {
        Stage::Coregistration
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let moving = ctx.moving_images(|_| true);
        if moving.is_empty() {
            info!("⏭️ No moving modalities, center '{}' stays as loaded", ctx.center_name());
            ctx.save_intermediates(Stage::Coregistration, ImageStage::Skull).await?;
            return Ok(StageOutcome::skipped("no moving modalities"));
        }

        let registrator = ctx.backends.registrator.clone().ok_or_else(|| {
            PreprocessError::config("moving modalities require a co-registration registrator")
        })?;
        let fixed = ctx.center_image()?;
        info!(
            "🧭 Co-registering {} modalities onto '{}' with {}",
            moving.len(),
            ctx.center_name(),
            registrator.name()
        );

        let backend = Arc::clone(&registrator);
        let results = ctx
            .executor
            .fan_out(Stage::Coregistration, moving, move |_, image: Arc<Volume>| {
                let (registered, forward) = backend.register(&fixed, &image)?;
                let inverse = backend.invert(&forward)?;
                Ok((registered, forward, inverse))
            })
            .await?;

        let mut touched = Vec::with_capacity(results.len());
        for (name, (registered, forward, inverse)) in results {
            ctx.ledger.record_transform(
                Stage::Coregistration,
                Scope::modality(name.as_str()),
                forward,
                inverse,
                Arc::clone(&registrator),
            );
            ctx.set_current(&name, registered);
            touched.push(name);
        }

        ctx.save_intermediates(Stage::Coregistration, ImageStage::Skull).await?;
        let message = format!("co-registered {} modalities", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
