use crate::app::ports::Normalizer;
use crate::error::{PreprocessError, Result};
use crate::types::{ImageStage, OutputVariant};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One acquired image channel taking part in a run
#[derive(Clone)]
pub struct Modality {
    name: String,
    input_path: PathBuf,
    normalizer: Option<Arc<dyn Normalizer>>,
    outputs: BTreeMap<OutputVariant, PathBuf>,
    bias_correction: bool,
    atlas_correction: bool,
}

impl Modality {
    pub fn builder(name: impl Into<String>, input_path: impl Into<PathBuf>) -> ModalityBuilder {
        ModalityBuilder {
            name: name.into(),
            input_path: input_path.into(),
            normalizer: None,
            outputs: BTreeMap::new(),
            bias_correction: false,
            atlas_correction: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn normalizer(&self) -> Option<&Arc<dyn Normalizer>> {
        self.normalizer.as_ref()
    }

    pub fn outputs(&self) -> &BTreeMap<OutputVariant, PathBuf> {
        &self.outputs
    }

    pub fn output_path(&self, variant: OutputVariant) -> Option<&Path> {
        self.outputs.get(&variant).map(PathBuf::as_path)
    }

    /// Whether any output (raw or normalized) is requested at this image stage
    pub fn requests(&self, stage: ImageStage) -> bool {
        self.outputs.keys().any(|variant| variant.stage == stage)
    }

    pub fn requests_normalized(&self) -> bool {
        self.outputs.keys().any(OutputVariant::is_normalized)
    }

    pub fn bias_correction(&self) -> bool {
        self.bias_correction
    }

    pub fn atlas_correction(&self) -> bool {
        self.atlas_correction
    }
}

impl fmt::Debug for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modality")
            .field("name", &self.name)
            .field("input_path", &self.input_path)
            .field("normalizer", &self.normalizer.as_ref().map(|n| n.name().to_string()))
            .field("outputs", &self.outputs)
            .field("bias_correction", &self.bias_correction)
            .field("atlas_correction", &self.atlas_correction)
            .finish()
    }
}

pub struct ModalityBuilder {
    name: String,
    input_path: PathBuf,
    normalizer: Option<Arc<dyn Normalizer>>,
    outputs: BTreeMap<OutputVariant, PathBuf>,
    bias_correction: bool,
    atlas_correction: bool,
}

impl ModalityBuilder {
    pub fn normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn output(mut self, variant: OutputVariant, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(variant, path.into());
        self
    }

    pub fn raw_skull_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::RAW_SKULL, path)
    }

    pub fn normalized_skull_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::NORMALIZED_SKULL, path)
    }

    pub fn raw_bet_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::RAW_BET, path)
    }

    pub fn normalized_bet_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::NORMALIZED_BET, path)
    }

    pub fn raw_defaced_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::RAW_DEFACED, path)
    }

    pub fn normalized_defaced_output(self, path: impl Into<PathBuf>) -> Self {
        self.output(OutputVariant::NORMALIZED_DEFACED, path)
    }

    pub fn bias_correction(mut self, enabled: bool) -> Self {
        self.bias_correction = enabled;
        self
    }

    pub fn atlas_correction(mut self, enabled: bool) -> Self {
        self.atlas_correction = enabled;
        self
    }

    /// Rejects a modality without a name or without any requested output:
    /// its processing would produce nothing reachable.
    pub fn build(self) -> Result<Modality> {
        if self.name.trim().is_empty() {
            return Err(PreprocessError::config("modality name must not be empty"));
        }
        if self.outputs.is_empty() {
            return Err(PreprocessError::config(format!(
                "modality '{}' requests no output; at least one output path is required",
                self.name
            )));
        }
        Ok(Modality {
            name: self.name,
            input_path: self.input_path,
            normalizer: self.normalizer,
            outputs: self.outputs,
            bias_correction: self.bias_correction,
            atlas_correction: self.atlas_correction,
        })
    }
}

/// The registration reference; the only modality masks are computed from
#[derive(Debug, Clone)]
pub struct CenterModality {
    modality: Modality,
    bet_mask_output: Option<PathBuf>,
    defacing_mask_output: Option<PathBuf>,
}

impl CenterModality {
    pub fn new(modality: Modality) -> Self {
        Self { modality, bet_mask_output: None, defacing_mask_output: None }
    }

    pub fn with_bet_mask_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.bet_mask_output = Some(path.into());
        self
    }

    pub fn with_defacing_mask_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.defacing_mask_output = Some(path.into());
        self
    }

    pub fn modality(&self) -> &Modality {
        &self.modality
    }

    pub fn name(&self) -> &str {
        self.modality.name()
    }

    pub fn bet_mask_output(&self) -> Option<&Path> {
        self.bet_mask_output.as_deref()
    }

    pub fn defacing_mask_output(&self) -> Option<&Path> {
        self.defacing_mask_output.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_requires_an_output() {
        let err = Modality::builder("t1c", "in/t1c.nii.gz").build().unwrap_err();
        assert!(matches!(err, PreprocessError::Configuration(_)));
        assert!(err.to_string().contains("t1c"));
    }

    #[test]
    fn test_modality_requires_a_name() {
        let err = Modality::builder("  ", "in/x.nii.gz")
            .raw_skull_output("out/x.nii.gz")
            .build()
            .unwrap_err();
        assert!(matches!(err, PreprocessError::Configuration(_)));
    }

    #[test]
    fn test_requests_by_stage() {
        let modality = Modality::builder("flair", "in/flair.nii.gz")
            .raw_skull_output("out/flair_skull.nii.gz")
            .normalized_bet_output("out/flair_bet_norm.nii.gz")
            .bias_correction(true)
            .build()
            .unwrap();

        assert!(modality.requests(ImageStage::Skull));
        assert!(modality.requests(ImageStage::BrainExtracted));
        assert!(!modality.requests(ImageStage::Defaced));
        assert!(modality.requests_normalized());
        assert!(modality.bias_correction());
        assert!(!modality.atlas_correction());
        assert_eq!(
            modality.output_path(OutputVariant::RAW_SKULL),
            Some(Path::new("out/flair_skull.nii.gz"))
        );
        assert_eq!(modality.output_path(OutputVariant::RAW_BET), None);
    }

    #[test]
    fn test_center_mask_outputs() {
        let center = CenterModality::new(
            Modality::builder("t1c", "in/t1c.nii.gz")
                .raw_bet_output("out/t1c_bet.nii.gz")
                .build()
                .unwrap(),
        )
        .with_bet_mask_output("out/t1c_bet_mask.nii.gz");

        assert_eq!(center.name(), "t1c");
        assert_eq!(center.bet_mask_output(), Some(Path::new("out/t1c_bet_mask.nii.gz")));
        assert_eq!(center.defacing_mask_output(), None);
    }
}
