//! TOML run descriptions.
//!
//! ```toml
//! variant = "atlas_centric"
//! atlas_image = "atlases/t1_brats_space.nii.gz"
//!
//! [run]
//! stage_timeout_secs = 900
//! transformations_dir = "out/transformations"
//!
//! [run.save_dirs]
//! coregistration = "out/intermediates/coregistration"
//!
//! [center]
//! name = "t1c"
//! input = "raw/t1c.nii.gz"
//! bet_mask = "out/masks/t1c_bet_mask.nii.gz"
//!
//! [center.outputs]
//! raw_bet = "out/t1c_bet.nii.gz"
//! normalized_bet = "out/t1c_bet_normalized.nii.gz"
//!
//! [center.normalizer]
//! kind = "percentile"
//! lower_percentile = 0.1
//! upper_percentile = 99.9
//!
//! [[moving]]
//! name = "flair"
//! input = "raw/flair.nii.gz"
//! bias_correction = true
//!
//! [moving.outputs]
//! raw_skull = "out/flair_skull.nii.gz"
//! ```

use crate::app::ports::Normalizer;
use crate::error::{PreprocessError, Result};
use crate::infra::normalizers::{PercentileNormalizer, WindowingNormalizer};
use crate::modality::{CenterModality, Modality};
use crate::pipeline::{PipelineVariant, RunOptions};
use crate::types::{OutputVariant, Stage};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    AtlasCentric,
    NativeSpace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub variant: VariantKind,
    #[serde(default)]
    pub atlas_image: Option<PathBuf>,
    #[serde(default)]
    pub run: RunSection,
    pub center: CenterConfig,
    #[serde(default)]
    pub moving: Vec<ModalityConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunSection {
    pub stage_timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub save_dirs: BTreeMap<String, PathBuf>,
    pub transformations_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModalityConfig {
    pub name: String,
    pub input: PathBuf,
    #[serde(default)]
    pub outputs: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub bias_correction: bool,
    #[serde(default)]
    pub atlas_correction: bool,
    pub normalizer: Option<NormalizerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CenterConfig {
    #[serde(flatten)]
    pub modality: ModalityConfig,
    pub bet_mask: Option<PathBuf>,
    pub defacing_mask: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizerConfig {
    Percentile {
        #[serde(default)]
        lower_percentile: Option<f64>,
        #[serde(default)]
        upper_percentile: Option<f64>,
        #[serde(default)]
        lower_limit: Option<f32>,
        #[serde(default)]
        upper_limit: Option<f32>,
    },
    Windowing {
        center: f32,
        width: f32,
    },
}

impl NormalizerConfig {
    pub fn build(&self) -> Result<Arc<dyn Normalizer>> {
        Ok(match self {
            NormalizerConfig::Percentile {
                lower_percentile,
                upper_percentile,
                lower_limit,
                upper_limit,
            } => Arc::new(PercentileNormalizer::new(
                lower_percentile.unwrap_or(0.0),
                upper_percentile.unwrap_or(100.0),
                lower_limit.unwrap_or(0.0),
                upper_limit.unwrap_or(1.0),
            )?),
            NormalizerConfig::Windowing { center, width } => {
                Arc::new(WindowingNormalizer::new(*center, *width)?)
            }
        })
    }
}

impl ModalityConfig {
    pub fn to_modality(&self) -> Result<Modality> {
        let mut builder = Modality::builder(self.name.as_str(), self.input.clone())
            .bias_correction(self.bias_correction)
            .atlas_correction(self.atlas_correction);
        for (key, path) in &self.outputs {
            let variant: OutputVariant = key.parse().map_err(|e: String| {
                PreprocessError::config(format!("modality '{}': {}", self.name, e))
            })?;
            builder = builder.output(variant, path.clone());
        }
        if let Some(normalizer) = &self.normalizer {
            builder = builder.normalizer(normalizer.build()?);
        }
        builder.build()
    }
}

impl CenterConfig {
    pub fn to_center(&self) -> Result<CenterModality> {
        let mut center = CenterModality::new(self.modality.to_modality()?);
        if let Some(path) = &self.bet_mask {
            center = center.with_bet_mask_output(path.clone());
        }
        if let Some(path) = &self.defacing_mask {
            center = center.with_defacing_mask_output(path.clone());
        }
        Ok(center)
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PreprocessError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        debug!("Loaded run config from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn variant(&self) -> Result<PipelineVariant> {
        match (self.variant, &self.atlas_image) {
            (VariantKind::AtlasCentric, Some(atlas_image)) => {
                Ok(PipelineVariant::AtlasCentric { atlas_image: atlas_image.clone() })
            }
            (VariantKind::AtlasCentric, None) => {
                Err(PreprocessError::config("atlas_centric runs need an atlas_image"))
            }
            (VariantKind::NativeSpace, _) => Ok(PipelineVariant::NativeSpace),
        }
    }

    pub fn center(&self) -> Result<CenterModality> {
        self.center.to_center()
    }

    pub fn moving(&self) -> Result<Vec<Modality>> {
        self.moving.iter().map(ModalityConfig::to_modality).collect()
    }

    pub fn run_options(&self) -> Result<RunOptions> {
        let mut options = RunOptions::default();
        if let Some(secs) = self.run.stage_timeout_secs {
            options = options.with_stage_timeout(Duration::from_secs(secs));
        }
        if let Some(max_parallel) = self.run.max_parallel {
            if max_parallel == 0 {
                return Err(PreprocessError::config("max_parallel must be at least 1"));
            }
            options = options.with_max_parallel(max_parallel);
        }
        for (name, dir) in &self.run.save_dirs {
            let stage: Stage = name.parse().map_err(PreprocessError::Configuration)?;
            options = options.with_save_dir(stage, dir.clone());
        }
        if let Some(dir) = &self.run.transformations_dir {
            options = options.with_transformations_dir(dir.clone());
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageStage;

    const ATLAS_RUN: &str = r#"
        variant = "atlas_centric"
        atlas_image = "atlases/sri24.nii.gz"

        [run]
        stage_timeout_secs = 30
        max_parallel = 2
        transformations_dir = "out/transformations"

        [run.save_dirs]
        brain_extraction = "out/bet"

        [center]
        name = "t1c"
        input = "raw/t1c.nii.gz"
        bet_mask = "out/t1c_bet_mask.nii.gz"

        [center.outputs]
        raw_bet = "out/t1c_bet.nii.gz"
        normalized_bet = "out/t1c_bet_norm.nii.gz"

        [center.normalizer]
        kind = "percentile"
        lower_percentile = 0.1
        upper_percentile = 99.9

        [[moving]]
        name = "flair"
        input = "raw/flair.nii.gz"
        bias_correction = true
        atlas_correction = true

        [moving.outputs]
        raw_skull = "out/flair_skull.nii.gz"

        [moving.normalizer]
        kind = "windowing"
        center = 0.5
        width = 1.0
    "#;

    #[test]
    fn test_parses_full_run_description() {
        let config = RunConfig::from_toml_str(ATLAS_RUN).unwrap();
        assert_eq!(
            config.variant().unwrap(),
            PipelineVariant::AtlasCentric { atlas_image: PathBuf::from("atlases/sri24.nii.gz") }
        );

        let center = config.center().unwrap();
        assert_eq!(center.name(), "t1c");
        assert_eq!(center.bet_mask_output(), Some(Path::new("out/t1c_bet_mask.nii.gz")));
        assert!(center.modality().requests(ImageStage::BrainExtracted));
        assert_eq!(center.modality().normalizer().map(|n| n.name()), Some("percentile"));

        let moving = config.moving().unwrap();
        assert_eq!(moving.len(), 1);
        assert!(moving[0].bias_correction());
        assert!(moving[0].atlas_correction());

        let options = config.run_options().unwrap();
        assert_eq!(options.stage_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.max_parallel, 2);
        assert_eq!(options.save_dirs.get(&Stage::BrainExtraction), Some(&PathBuf::from("out/bet")));
    }

    #[test]
    fn test_rejects_unknown_output_and_stage_names() {
        let bad_output = ATLAS_RUN.replace("raw_skull", "raw_brain");
        let err = RunConfig::from_toml_str(&bad_output).unwrap().moving().unwrap_err();
        assert!(err.to_string().contains("unknown output 'raw_brain'"));

        let bad_stage = ATLAS_RUN.replace("brain_extraction = \"out/bet\"", "skullstrip = \"out/bet\"");
        let err = RunConfig::from_toml_str(&bad_stage).unwrap().run_options().unwrap_err();
        assert!(matches!(err, PreprocessError::Configuration(_)));
    }

    #[test]
    fn test_atlas_variant_requires_atlas_image() {
        let config = RunConfig::from_toml_str(
            r#"
            variant = "atlas_centric"

            [center]
            name = "t1"
            input = "raw/t1.nii.gz"

            [center.outputs]
            raw_skull = "out/t1.nii.gz"
            "#,
        )
        .unwrap();
        assert!(config.variant().is_err());
        assert!(config.moving().unwrap().is_empty());
    }

    #[test]
    fn test_load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, ATLAS_RUN).unwrap();
        assert!(RunConfig::load(&path).is_ok());
        assert!(RunConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
