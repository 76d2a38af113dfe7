//! Backward inference of the stages a run needs.
//!
//! The plan is derived once, before any backend call, from what the caller
//! asked to have written. Each requested output pulls in the stage that
//! produces its image, and each stage pulls in its prerequisites from a
//! static table. A stage that nothing depends on is never executed.

use super::backends::Backends;
use super::variants::PipelineVariant;
use crate::error::{PreprocessError, Result};
use crate::modality::{CenterModality, Modality};
use crate::types::{ImageStage, Stage};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Stage that produces each image stage's image (`None`: the skull image exists after loading)
const OUTPUT_REQUIREMENTS: [(ImageStage, Option<Stage>); 3] = [
    (ImageStage::Skull, None),
    (ImageStage::BrainExtracted, Some(Stage::BrainExtraction)),
    (ImageStage::Defaced, Some(Stage::Defacing)),
];

/// Unconditional prerequisites of each stage
const STAGE_DEPENDENCIES: [(Stage, &[Stage]); 6] = [
    (Stage::Coregistration, &[]),
    (Stage::AtlasRegistration, &[Stage::Coregistration]),
    (Stage::AtlasCorrection, &[Stage::AtlasRegistration]),
    (Stage::BiasCorrection, &[Stage::Coregistration]),
    (Stage::BrainExtraction, &[Stage::Coregistration]),
    (Stage::Defacing, &[Stage::Coregistration]),
];

fn dependencies_of(stage: Stage, defacer_requires_bet: bool) -> Vec<Stage> {
    let mut deps: Vec<Stage> = STAGE_DEPENDENCIES
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, deps)| deps.to_vec())
        .unwrap_or_default();
    if stage == Stage::Defacing && defacer_requires_bet {
        deps.push(Stage::BrainExtraction);
    }
    deps
}

fn producing_stage(image_stage: ImageStage) -> Option<Stage> {
    OUTPUT_REQUIREMENTS
        .iter()
        .find(|(s, _)| *s == image_stage)
        .and_then(|(_, stage)| *stage)
}

/// The ordered set of stages a run executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: BTreeSet<Stage>,
}

impl StagePlan {
    /// Infer the required stages without looking at backend availability.
    /// Used on its own for dry runs; `build` adds validation.
    pub fn infer(
        variant: &PipelineVariant,
        center: &CenterModality,
        moving: &[Modality],
        defacer_requires_bet: bool,
    ) -> Self {
        let modalities: Vec<&Modality> =
            std::iter::once(center.modality()).chain(moving.iter()).collect();

        // co-registration is the identity-or-better baseline every output sits on
        let mut requested = BTreeSet::from([Stage::Coregistration]);

        for modality in &modalities {
            for variant in modality.outputs().keys() {
                if let Some(stage) = producing_stage(variant.stage) {
                    requested.insert(stage);
                }
            }
        }
        if center.bet_mask_output().is_some() {
            requested.insert(Stage::BrainExtraction);
        }
        if center.defacing_mask_output().is_some() {
            requested.insert(Stage::Defacing);
        }
        if modalities.iter().any(|m| m.bias_correction()) {
            requested.insert(Stage::BiasCorrection);
        }
        if variant.is_atlas_centric() {
            requested.insert(Stage::AtlasRegistration);
            if modalities.iter().any(|m| m.atlas_correction()) {
                requested.insert(Stage::AtlasCorrection);
            }
        }

        let mut stages = BTreeSet::new();
        let mut pending: Vec<Stage> = requested.into_iter().collect();
        while let Some(stage) = pending.pop() {
            if stages.insert(stage) {
                pending.extend(dependencies_of(stage, defacer_requires_bet));
            }
        }

        debug!("Inferred stage plan: {:?}", stages);
        Self { stages }
    }

    /// Infer the plan and check that every backend it needs is configured
    pub fn build(
        variant: &PipelineVariant,
        center: &CenterModality,
        moving: &[Modality],
        backends: &Backends,
    ) -> Result<Self> {
        validate_modalities(center, moving)?;
        if !variant.is_atlas_centric() {
            for modality in std::iter::once(center.modality()).chain(moving.iter()) {
                if modality.atlas_correction() {
                    warn!(
                        "⚠️ Atlas correction requested for '{}' in a native-space run; ignoring",
                        modality.name()
                    );
                }
            }
        }

        let plan = Self::infer(variant, center, moving, backends.defacer_requires_brain_extraction());

        if !moving.is_empty() && backends.registrator.is_none() {
            return Err(PreprocessError::config(
                "moving modalities require a co-registration registrator",
            ));
        }
        if plan.contains(Stage::AtlasRegistration) && backends.atlas_registrator.is_none() {
            let reason = if plan.contains(Stage::AtlasCorrection) {
                "atlas registration and atlas correction require an atlas registrator"
            } else {
                "atlas registration requires an atlas registrator"
            };
            return Err(PreprocessError::config(reason));
        }
        if plan.contains(Stage::BiasCorrection) && backends.bias_corrector.is_none() {
            return Err(PreprocessError::config("bias correction requires an N4 bias corrector"));
        }
        if plan.contains(Stage::BrainExtraction) && backends.brain_extractor.is_none() {
            return Err(PreprocessError::config(
                "requested outputs need brain extraction but no brain extractor is configured",
            ));
        }
        if plan.contains(Stage::Defacing) && backends.defacer.is_none() {
            return Err(PreprocessError::config(
                "requested outputs need defacing but no defacer is configured",
            ));
        }
        Ok(plan)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Planned stages in execution order
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for StagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(Stage::as_str).collect();
        f.write_str(&names.join(" → "))
    }
}

fn validate_modalities(center: &CenterModality, moving: &[Modality]) -> Result<()> {
    let mut seen = HashSet::new();
    for modality in std::iter::once(center.modality()).chain(moving.iter()) {
        if !seen.insert(modality.name()) {
            return Err(PreprocessError::config(format!(
                "duplicate modality name '{}'",
                modality.name()
            )));
        }
        if modality.requests_normalized() && modality.normalizer().is_none() {
            return Err(PreprocessError::config(format!(
                "modality '{}' requests normalized outputs but has no normalizer",
                modality.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{Defacer, VolumeIo};
    use crate::volume::{Mask, Volume};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct NullIo;

    impl VolumeIo for NullIo {
        fn read(&self, _path: &Path) -> anyhow::Result<Volume> {
            anyhow::bail!("not used")
        }

        fn write(&self, _volume: &Volume, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Quickshear;

    impl Defacer for Quickshear {
        fn name(&self) -> &str {
            "quickshear"
        }

        fn compute_mask(&self, image: &Volume) -> anyhow::Result<Mask> {
            Ok(Mask::from_threshold(image, 0.0))
        }

        fn requires_brain_extraction(&self) -> bool {
            true
        }
    }

    fn center_with_raw_skull() -> CenterModality {
        CenterModality::new(
            Modality::builder("t1c", "in/t1c.nii.gz")
                .raw_skull_output("out/t1c.nii.gz")
                .build()
                .unwrap(),
        )
    }

    fn native() -> PipelineVariant {
        PipelineVariant::NativeSpace
    }

    fn atlas() -> PipelineVariant {
        PipelineVariant::AtlasCentric { atlas_image: PathBuf::from("atlas/sri24.nii.gz") }
    }

    #[test]
    fn test_skull_outputs_only_need_coregistration() {
        let plan = StagePlan::infer(&native(), &center_with_raw_skull(), &[], false);
        assert_eq!(plan.stages().collect::<Vec<_>>(), vec![Stage::Coregistration]);
    }

    #[test]
    fn test_defaced_output_pulls_brain_extraction_for_quickshear() {
        let flair = Modality::builder("flair", "in/flair.nii.gz")
            .raw_defaced_output("out/flair_defaced.nii.gz")
            .build()
            .unwrap();

        let plain = StagePlan::infer(&native(), &center_with_raw_skull(), &[flair.clone()], false);
        assert!(plain.contains(Stage::Defacing));
        assert!(!plain.contains(Stage::BrainExtraction));

        let quickshear = StagePlan::infer(&native(), &center_with_raw_skull(), &[flair], true);
        assert!(quickshear.contains(Stage::BrainExtraction));
        assert_eq!(quickshear.to_string(), "coregistration → brain_extraction → defacing");
    }

    #[test]
    fn test_atlas_correction_only_in_atlas_variant() {
        let flair = Modality::builder("flair", "in/flair.nii.gz")
            .raw_skull_output("out/flair.nii.gz")
            .atlas_correction(true)
            .bias_correction(true)
            .build()
            .unwrap();

        let atlas_plan = StagePlan::infer(&atlas(), &center_with_raw_skull(), &[flair.clone()], false);
        assert!(atlas_plan.contains(Stage::AtlasRegistration));
        assert!(atlas_plan.contains(Stage::AtlasCorrection));
        assert!(atlas_plan.contains(Stage::BiasCorrection));

        let native_plan = StagePlan::infer(&native(), &center_with_raw_skull(), &[flair], false);
        assert!(!native_plan.contains(Stage::AtlasRegistration));
        assert!(!native_plan.contains(Stage::AtlasCorrection));
    }

    #[test]
    fn test_center_mask_output_pulls_its_stage() {
        let center = center_with_raw_skull().with_defacing_mask_output("out/deface_mask.nii.gz");
        let plan = StagePlan::infer(&native(), &center, &[], false);
        assert!(plan.contains(Stage::Defacing));
        assert!(!plan.contains(Stage::BrainExtraction));
    }

    #[test]
    fn test_build_rejects_missing_backends() {
        let backends = Backends::new(Arc::new(NullIo));
        let flair = Modality::builder("flair", "in/flair.nii.gz")
            .raw_skull_output("out/flair.nii.gz")
            .build()
            .unwrap();

        let err = StagePlan::build(&native(), &center_with_raw_skull(), &[flair], &backends)
            .unwrap_err();
        assert!(err.to_string().contains("co-registration registrator"));

        let err = StagePlan::build(&atlas(), &center_with_raw_skull(), &[], &backends).unwrap_err();
        assert!(matches!(err, PreprocessError::Configuration(_)));

        let bet = CenterModality::new(
            Modality::builder("t1c", "in/t1c.nii.gz")
                .raw_bet_output("out/t1c_bet.nii.gz")
                .build()
                .unwrap(),
        );
        let err = StagePlan::build(&native(), &bet, &[], &backends).unwrap_err();
        assert!(err.to_string().contains("brain extractor"));
    }

    #[test]
    fn test_build_uses_defacer_requirement() {
        let backends = Backends::new(Arc::new(NullIo)).with_defacer(Arc::new(Quickshear));
        let center = CenterModality::new(
            Modality::builder("t1c", "in/t1c.nii.gz")
                .raw_defaced_output("out/t1c_defaced.nii.gz")
                .build()
                .unwrap(),
        );
        // quickshear needs a brain extractor too
        let err = StagePlan::build(&native(), &center, &[], &backends).unwrap_err();
        assert!(err.to_string().contains("brain extractor"));
    }

    #[test]
    fn test_build_rejects_duplicate_names_and_missing_normalizer() {
        let backends = Backends::new(Arc::new(NullIo));
        let twin = Modality::builder("t1c", "in/other.nii.gz")
            .raw_skull_output("out/other.nii.gz")
            .build()
            .unwrap();
        let err = StagePlan::build(&native(), &center_with_raw_skull(), &[twin], &backends)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate modality name 't1c'"));

        let center = CenterModality::new(
            Modality::builder("t1c", "in/t1c.nii.gz")
                .normalized_skull_output("out/t1c_norm.nii.gz")
                .build()
                .unwrap(),
        );
        let err = StagePlan::build(&native(), &center, &[], &backends).unwrap_err();
        assert!(err.to_string().contains("no normalizer"));
    }
}
