pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod modality;
pub mod pipeline;
pub mod types;
pub mod volume;

// Backend boundaries and the reference implementations behind them
pub mod app;
pub mod infra;

pub use error::{PreprocessError, Result};
pub use ledger::{PersistedLedger, Scope, Transform, TransformLedger};
pub use modality::{CenterModality, Modality};
pub use pipeline::{
    AtlasCentricPreprocessor, Backends, CancellationToken, NativeSpacePreprocessor,
    PipelineOrchestrator, PipelineVariant, RunOptions, RunReport,
};
pub use types::{ImageStage, Intensity, OutputVariant, Stage};
pub use volume::{Geometry, Mask, Volume};
