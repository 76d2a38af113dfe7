//! Writing requested outputs once their image stage is final.

use super::context::{write_volume, RunContext};
use crate::app::ports::Normalizer;
use crate::error::Result;
use crate::types::{ImageStage, OutputVariant, Stage};
use crate::volume::Volume;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

struct PendingOutputs {
    image: Arc<Volume>,
    normalizer: Option<Arc<dyn Normalizer>>,
    targets: Vec<(OutputVariant, PathBuf)>,
}

/// Write every output requested at `image_stage`. Raw outputs are written as
/// is; normalized ones go through the modality's normalizer first. Both share
/// all upstream work, and neither is produced unless requested.
pub async fn materialize(ctx: &mut RunContext, stage: Stage, image_stage: ImageStage) -> Result<usize> {
    let items: Vec<(String, PendingOutputs)> = ctx
        .states
        .iter()
        .filter_map(|(name, state)| {
            let targets: Vec<(OutputVariant, PathBuf)> = state
                .modality
                .outputs()
                .iter()
                .filter(|(variant, _)| variant.stage == image_stage)
                .map(|(variant, path)| (*variant, path.clone()))
                .collect();
            if targets.is_empty() {
                return None;
            }
            let image = Arc::clone(state.image(image_stage)?);
            let normalizer = state.modality.normalizer().cloned();
            Some((name.clone(), PendingOutputs { image, normalizer, targets }))
        })
        .collect();

    if items.is_empty() {
        debug!("No {} outputs requested", image_stage.as_str());
        return Ok(0);
    }

    let io = Arc::clone(&ctx.backends.io);
    let written = ctx
        .executor
        .fan_out(stage, items, move |name, pending: PendingOutputs| {
            let mut paths = Vec::with_capacity(pending.targets.len());
            for (variant, path) in pending.targets {
                if variant.is_normalized() {
                    let normalizer = pending
                        .normalizer
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("no normalizer for {variant} output"))?;
                    let normalized = normalizer.normalize(&pending.image)?;
                    write_volume(io.as_ref(), name, &normalized, &path)?;
                } else {
                    write_volume(io.as_ref(), name, &pending.image, &path)?;
                }
                paths.push(path);
            }
            Ok(paths)
        })
        .await?;

    let mut count = 0;
    for (name, paths) in written {
        for path in paths {
            info!("💾 Wrote {} output of '{}' to {}", image_stage.as_str(), name, path.display());
            ctx.record_written(&name, path);
            count += 1;
        }
    }
    Ok(count)
}
