use super::backends::Backends;
use super::executor::StageExecutor;
use super::plan::StagePlan;
use super::variants::PipelineVariant;
use crate::app::ports::VolumeIo;
use crate::constants::{intermediate_file_name, intermediate_mask_file_name};
use crate::error::{PreprocessError, Result};
use crate::ledger::TransformLedger;
use crate::modality::{CenterModality, Modality};
use crate::types::{ImageStage, Stage};
use crate::volume::{Mask, Volume};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Working images of one modality during a run
#[derive(Debug)]
pub struct ModalityState {
    pub modality: Modality,
    pub is_center: bool,
    /// Skull-on image, updated by every spatial and intensity stage
    pub current: Arc<Volume>,
    pub brain: Option<Arc<Volume>>,
    pub defaced: Option<Arc<Volume>>,
}

impl ModalityState {
    pub fn image(&self, stage: ImageStage) -> Option<&Arc<Volume>> {
        match stage {
            ImageStage::Skull => Some(&self.current),
            ImageStage::BrainExtracted => self.brain.as_ref(),
            ImageStage::Defaced => self.defaced.as_ref(),
        }
    }
}

/// Everything a run mutates. Created when `run()` starts and dropped when it
/// returns; only the report and the written files outlive it.
pub struct RunContext {
    pub executor: StageExecutor,
    pub backends: Backends,
    pub plan: StagePlan,
    pub variant: PipelineVariant,
    pub center: CenterModality,
    pub states: BTreeMap<String, ModalityState>,
    pub ledger: TransformLedger,
    pub save_dirs: HashMap<Stage, PathBuf>,
    pub written: BTreeMap<String, Vec<PathBuf>>,
}

impl RunContext {
    pub fn center_name(&self) -> &str {
        self.center.name()
    }

    pub fn center_state(&self) -> Result<&ModalityState> {
        self.states.get(self.center.name()).ok_or_else(|| {
            PreprocessError::config(format!("center modality '{}' was not loaded", self.center.name()))
        })
    }

    pub fn center_image(&self) -> Result<Arc<Volume>> {
        Ok(Arc::clone(&self.center_state()?.current))
    }

    /// Current skull images of the moving modalities selected by `filter`
    pub fn moving_images(&self, filter: impl Fn(&Modality) -> bool) -> Vec<(String, Arc<Volume>)> {
        self.states
            .iter()
            .filter(|(_, state)| !state.is_center && filter(&state.modality))
            .map(|(name, state)| (name.clone(), Arc::clone(&state.current)))
            .collect()
    }

    /// Current skull images of every modality selected by `filter`, center included
    pub fn skull_images(&self, filter: impl Fn(&ModalityState) -> bool) -> Vec<(String, Arc<Volume>)> {
        self.states
            .iter()
            .filter(|(_, state)| filter(state))
            .map(|(name, state)| (name.clone(), Arc::clone(&state.current)))
            .collect()
    }

    pub fn set_current(&mut self, name: &str, image: Volume) {
        if let Some(state) = self.states.get_mut(name) {
            state.current = Arc::new(image);
        }
    }

    pub fn set_image(&mut self, name: &str, stage: ImageStage, image: Volume) {
        let Some(state) = self.states.get_mut(name) else {
            return;
        };
        let image = Arc::new(image);
        match stage {
            ImageStage::Skull => state.current = image,
            ImageStage::BrainExtracted => state.brain = Some(image),
            ImageStage::Defaced => state.defaced = Some(image),
        }
    }

    /// Whether a masked image has to be built for this modality: an output
    /// asks for it, the stage's intermediates are saved, or the center's
    /// brain image feeds a defacer that needs it.
    pub fn needs_image(&self, state: &ModalityState, image_stage: ImageStage) -> bool {
        let stage = match image_stage {
            ImageStage::Skull => return true,
            ImageStage::BrainExtracted => Stage::BrainExtraction,
            ImageStage::Defaced => Stage::Defacing,
        };
        state.modality.requests(image_stage)
            || self.save_dirs.contains_key(&stage)
            || (state.is_center
                && image_stage == ImageStage::BrainExtracted
                && self.plan.contains(Stage::Defacing)
                && self.backends.defacer_requires_brain_extraction())
    }

    pub fn record_written(&mut self, modality: &str, path: PathBuf) {
        self.written.entry(modality.to_string()).or_default().push(path);
    }

    /// Write the images of a stage to its intermediate directory, if one was configured
    pub async fn save_intermediates(&mut self, stage: Stage, image_stage: ImageStage) -> Result<()> {
        let Some(dir) = self.save_dirs.get(&stage).cloned() else {
            return Ok(());
        };
        let items: Vec<(String, Arc<Volume>)> = self
            .states
            .iter()
            .filter_map(|(name, state)| state.image(image_stage).map(|img| (name.clone(), Arc::clone(img))))
            .collect();
        debug!("Saving {} intermediates of '{}' to {}", items.len(), stage, dir.display());

        let io = Arc::clone(&self.backends.io);
        let written = self
            .executor
            .fan_out(stage, items, move |name, image: Arc<Volume>| {
                let path = dir.join(intermediate_file_name(name, stage.as_str()));
                write_volume(io.as_ref(), name, &image, &path)?;
                Ok(path)
            })
            .await?;
        for (name, path) in written {
            self.record_written(&name, path);
        }
        Ok(())
    }

    /// Persist a center mask to its requested output and to the stage's intermediate directory
    pub async fn save_center_mask(
        &mut self,
        stage: Stage,
        mask: &Arc<Mask>,
        output: Option<PathBuf>,
    ) -> Result<()> {
        let center = self.center_name().to_string();
        let mut targets: Vec<PathBuf> = output.into_iter().collect();
        if let Some(dir) = self.save_dirs.get(&stage) {
            targets.push(dir.join(intermediate_mask_file_name(&center, stage.as_str())));
        }
        for path in targets {
            let io = Arc::clone(&self.backends.io);
            let mask = Arc::clone(mask);
            let (name, target) = (center.clone(), path.clone());
            self.executor
                .call(stage, Some(center.as_str()), move || {
                    io.write_mask(&mask, &target).map_err(|source| {
                        anyhow::Error::new(PreprocessError::Output {
                            modality: name,
                            path: target.clone(),
                            source,
                        })
                    })
                })
                .await?;
            info!("💾 Wrote {} mask of '{}' to {}", stage, center, path.display());
            self.record_written(&center, path);
        }
        Ok(())
    }
}

/// Write through the volume backend, tagging failures as output errors
pub(crate) fn write_volume(
    io: &dyn VolumeIo,
    modality: &str,
    image: &Volume,
    path: &Path,
) -> anyhow::Result<()> {
    io.write(image, path).map_err(|source| {
        anyhow::Error::new(PreprocessError::Output {
            modality: modality.to_string(),
            path: path.to_path_buf(),
            source,
        })
    })
}
