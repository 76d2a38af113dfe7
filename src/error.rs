use crate::types::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage '{stage}' failed for {}: {source:#}", .modality.as_deref().unwrap_or("all modalities"))]
    StageExecution {
        stage: Stage,
        modality: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("Transform recorded by stage '{step}' for modality '{modality}' is not invertible")]
    NonInvertibleTransform { step: Stage, modality: String },

    #[error("Stage '{stage}' timed out after {timeout:?} for {}", .modality.as_deref().unwrap_or("all modalities"))]
    StageTimeout {
        stage: Stage,
        modality: Option<String>,
        timeout: Duration,
    },

    #[error("Run cancelled before stage '{stage}'")]
    Cancelled { stage: Stage },

    #[error("Failed to read input of modality '{modality}' from {}: {source:#}", .path.display())]
    Input {
        modality: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write output of modality '{modality}' to {}: {source:#}", .path.display())]
    Output {
        modality: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PreprocessError {
    pub fn config(message: impl Into<String>) -> Self {
        PreprocessError::Configuration(message.into())
    }

    /// Wrap an opaque backend failure, keeping crate errors that were tunnelled through `anyhow`
    pub fn from_backend(stage: Stage, modality: Option<&str>, err: anyhow::Error) -> Self {
        match err.downcast::<PreprocessError>() {
            Ok(inner) => inner,
            Err(source) => PreprocessError::StageExecution {
                stage,
                modality: modality.map(str::to_string),
                source,
            },
        }
    }

    /// Stage the error is attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PreprocessError::StageExecution { stage, .. }
            | PreprocessError::StageTimeout { stage, .. }
            | PreprocessError::Cancelled { stage } => Some(*stage),
            PreprocessError::NonInvertibleTransform { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Bookkeeping failures on voxel grids
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VolumeError {
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: [usize; 3], found: [usize; 3] },

    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_execution_message_carries_context() {
        let err = PreprocessError::StageExecution {
            stage: Stage::BrainExtraction,
            modality: Some("t1c".to_string()),
            source: anyhow::anyhow!("model weights missing"),
        };
        let message = err.to_string();
        assert!(message.contains("brain_extraction"));
        assert!(message.contains("t1c"));
        assert!(message.contains("model weights missing"));
        assert_eq!(err.stage(), Some(Stage::BrainExtraction));
    }

    #[test]
    fn test_from_backend_unwraps_tunnelled_errors() {
        let tunnelled = anyhow::Error::new(PreprocessError::NonInvertibleTransform {
            step: Stage::AtlasRegistration,
            modality: "flair".to_string(),
        });
        let err = PreprocessError::from_backend(Stage::Defacing, Some("flair"), tunnelled);
        assert!(matches!(
            err,
            PreprocessError::NonInvertibleTransform { step: Stage::AtlasRegistration, .. }
        ));

        let plain = PreprocessError::from_backend(Stage::Defacing, None, anyhow::anyhow!("boom"));
        assert!(plain.to_string().contains("all modalities"));
    }
}
