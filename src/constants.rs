/// File naming constants shared by the orchestrator and the persistence helpers
/// so intermediate results and transformations land at stable locations.

// Volume files
pub const VOLUME_EXTENSION: &str = "nii.gz";
pub const MASK_SUFFIX: &str = "mask";

// Transformations
pub const TRANSFORMS_FILE_NAME: &str = "transforms.json";

// Logging
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "brainprep.log";
pub const DEFAULT_LOG_FILTER: &str = "brainprep=debug,info";

// Geometry comparison
pub const GEOMETRY_TOLERANCE: f64 = 1e-6;

/// Intermediate image file name for a modality at a stage: `{modality}_{stage}.nii.gz`
pub fn intermediate_file_name(modality_name: &str, stage_name: &str) -> String {
    format!("{modality_name}_{stage_name}.{VOLUME_EXTENSION}")
}

/// Mask file name for the center modality at a stage: `{modality}_{stage}_mask.nii.gz`
pub fn intermediate_mask_file_name(modality_name: &str, stage_name: &str) -> String {
    format!("{modality_name}_{stage_name}_{MASK_SUFFIX}.{VOLUME_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intermediate_file_names() {
        assert_eq!(intermediate_file_name("t1c", "coregistration"), "t1c_coregistration.nii.gz");
        assert_eq!(
            intermediate_mask_file_name("t1c", "brain_extraction"),
            "t1c_brain_extraction_mask.nii.gz"
        );
    }
}
