use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One pipeline operation. Ordering follows execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Coregistration,
    AtlasRegistration,
    AtlasCorrection,
    BiasCorrection,
    BrainExtraction,
    Defacing,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Coregistration,
        Stage::AtlasRegistration,
        Stage::AtlasCorrection,
        Stage::BiasCorrection,
        Stage::BrainExtraction,
        Stage::Defacing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Coregistration => "coregistration",
            Stage::AtlasRegistration => "atlas_registration",
            Stage::AtlasCorrection => "atlas_correction",
            Stage::BiasCorrection => "bias_correction",
            Stage::BrainExtraction => "brain_extraction",
            Stage::Defacing => "defacing",
        }
    }

    /// Whether the stage changes voxel geometry (and therefore lands in the ledger as a transform)
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            Stage::Coregistration | Stage::AtlasRegistration | Stage::AtlasCorrection
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// The point in a modality's lifecycle an output image is taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    /// Skull-on image after every spatial and intensity correction
    Skull,
    /// Skull image multiplied by the center's brain mask
    BrainExtracted,
    /// Skull image multiplied by the center's defacing mask
    Defaced,
}

impl ImageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStage::Skull => "skull",
            ImageStage::BrainExtracted => "bet",
            ImageStage::Defaced => "defaced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Raw,
    Normalized,
}

/// A requested output: which image stage, with or without normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputVariant {
    pub intensity: Intensity,
    pub stage: ImageStage,
}

impl OutputVariant {
    pub const RAW_SKULL: OutputVariant = OutputVariant::new(Intensity::Raw, ImageStage::Skull);
    pub const NORMALIZED_SKULL: OutputVariant =
        OutputVariant::new(Intensity::Normalized, ImageStage::Skull);
    pub const RAW_BET: OutputVariant =
        OutputVariant::new(Intensity::Raw, ImageStage::BrainExtracted);
    pub const NORMALIZED_BET: OutputVariant =
        OutputVariant::new(Intensity::Normalized, ImageStage::BrainExtracted);
    pub const RAW_DEFACED: OutputVariant = OutputVariant::new(Intensity::Raw, ImageStage::Defaced);
    pub const NORMALIZED_DEFACED: OutputVariant =
        OutputVariant::new(Intensity::Normalized, ImageStage::Defaced);

    pub const ALL: [OutputVariant; 6] = [
        OutputVariant::RAW_SKULL,
        OutputVariant::NORMALIZED_SKULL,
        OutputVariant::RAW_BET,
        OutputVariant::NORMALIZED_BET,
        OutputVariant::RAW_DEFACED,
        OutputVariant::NORMALIZED_DEFACED,
    ];

    pub const fn new(intensity: Intensity, stage: ImageStage) -> Self {
        Self { intensity, stage }
    }

    pub fn is_normalized(&self) -> bool {
        self.intensity == Intensity::Normalized
    }
}

impl fmt::Display for OutputVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intensity = match self.intensity {
            Intensity::Raw => "raw",
            Intensity::Normalized => "normalized",
        };
        write!(f, "{}_{}", intensity, self.stage.as_str())
    }
}

impl FromStr for OutputVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputVariant::ALL
            .iter()
            .copied()
            .find(|variant| variant.to_string() == s)
            .ok_or_else(|| format!("unknown output '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_follows_pipeline() {
        let mut stages = vec![Stage::Defacing, Stage::Coregistration, Stage::BiasCorrection];
        stages.sort();
        assert_eq!(
            stages,
            vec![Stage::Coregistration, Stage::BiasCorrection, Stage::Defacing]
        );
    }

    #[test]
    fn test_stage_round_trips_through_name() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("skull_stripping".parse::<Stage>().is_err());
    }

    #[test]
    fn test_output_variant_display() {
        assert_eq!(OutputVariant::RAW_SKULL.to_string(), "raw_skull");
        assert_eq!(OutputVariant::NORMALIZED_BET.to_string(), "normalized_bet");
        assert_eq!(OutputVariant::RAW_DEFACED.to_string(), "raw_defaced");
        assert_eq!("normalized_defaced".parse::<OutputVariant>(), Ok(OutputVariant::NORMALIZED_DEFACED));
        assert!("raw_brain".parse::<OutputVariant>().is_err());
    }
}
