use super::{PipelineStage, StageOutcome};
use crate::error::{PreprocessError, Result};
use crate::ledger::Scope;
use crate::pipeline::context::RunContext;
use crate::types::{ImageStage, Stage};
use crate::volume::Volume;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Registers the center onto the atlas and carries every moving modality
/// along with the same transform, composed after its co-registration.
pub struct AtlasRegistrationStep;

#[async_trait]
impl PipelineStage for AtlasRegistrationStep {
    fn stage(&self) -> Stage {
        Stage::AtlasRegistration
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<StageOutcome> {
        let stage = Stage::AtlasRegistration;
        let atlas_path = ctx
            .variant
            .atlas_image()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| PreprocessError::config("atlas registration needs an atlas image"))?;
        let registrator = ctx.backends.atlas_registrator.clone().ok_or_else(|| {
            PreprocessError::config("atlas registration requires an atlas registrator")
        })?;

        let io = Arc::clone(&ctx.backends.io);
        let atlas = ctx
            .executor
            .call(stage, None, move || {
                io.read(&atlas_path).map_err(|source| {
                    anyhow::Error::new(PreprocessError::Input {
                        modality: "atlas".to_string(),
                        path: atlas_path.clone(),
                        source,
                    })
                })
            })
            .await?;

        let center_name = ctx.center_name().to_string();
        let center = ctx.center_image()?;
        info!("🗺️ Registering center '{}' to atlas with {}", center_name, registrator.name());
        let backend = Arc::clone(&registrator);
        let (registered, forward, inverse) = ctx
            .executor
            .call(stage, Some(center_name.as_str()), move || {
                let (registered, forward) = backend.register(&atlas, &center)?;
                let inverse = backend.invert(&forward)?;
                Ok((registered, forward, inverse))
            })
            .await?;

        ctx.ledger.record_transform(stage, Scope::All, forward, inverse, registrator);
        ctx.set_current(&center_name, registered);

        // movings are already on the center grid; the shared transform takes them the rest of the way
        let ledger = ctx.ledger.clone();
        let moved = ctx
            .executor
            .fan_out(stage, ctx.moving_images(|_| true), move |name, image: Arc<Volume>| {
                Ok(ledger.apply_step(&image, stage, name)?)
            })
            .await?;

        let mut touched = vec![center_name];
        for (name, image) in moved {
            ctx.set_current(&name, image);
            touched.push(name);
        }

        ctx.save_intermediates(stage, ImageStage::Skull).await?;
        let message = format!("mapped {} modalities to atlas space", touched.len());
        Ok(StageOutcome::new(touched, message))
    }
}
