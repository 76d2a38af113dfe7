//! The two public pipeline flavours. Both are thin configurations of one
//! `PipelineOrchestrator`; they differ only in whether atlas stages exist.

use super::backends::Backends;
use super::orchestrator::{PipelineOrchestrator, RunOptions};
use super::plan::StagePlan;
use super::report::RunReport;
use crate::error::Result;
use crate::modality::{CenterModality, Modality};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Everything ends up in the space of the given atlas image
    AtlasCentric { atlas_image: PathBuf },
    /// Everything stays in the center modality's native space
    NativeSpace,
}

impl PipelineVariant {
    pub fn is_atlas_centric(&self) -> bool {
        matches!(self, PipelineVariant::AtlasCentric { .. })
    }

    pub fn atlas_image(&self) -> Option<&Path> {
        match self {
            PipelineVariant::AtlasCentric { atlas_image } => Some(atlas_image),
            PipelineVariant::NativeSpace => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineVariant::AtlasCentric { .. } => "atlas_centric",
            PipelineVariant::NativeSpace => "native_space",
        }
    }
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Co-registers to the center, registers the center to an atlas and carries
/// every moving modality along, then corrects and extracts in atlas space.
pub struct AtlasCentricPreprocessor {
    center: CenterModality,
    moving: Vec<Modality>,
    atlas_image: PathBuf,
    backends: Backends,
    options: RunOptions,
}

impl AtlasCentricPreprocessor {
    pub fn new(
        center: CenterModality,
        moving: Vec<Modality>,
        atlas_image: impl Into<PathBuf>,
        backends: Backends,
    ) -> Self {
        Self {
            center,
            moving,
            atlas_image: atlas_image.into(),
            backends,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the configuration and return the orchestrator that would run it
    pub fn build(self) -> Result<PipelineOrchestrator> {
        PipelineOrchestrator::new(
            PipelineVariant::AtlasCentric { atlas_image: self.atlas_image },
            self.center,
            self.moving,
            self.backends,
            self.options,
        )
    }

    pub fn plan(self) -> Result<StagePlan> {
        Ok(self.build()?.plan().clone())
    }

    pub async fn run(self) -> Result<RunReport> {
        self.build()?.run().await
    }
}

/// Same stages minus the atlas ones; outputs stay in the center's native space
pub struct NativeSpacePreprocessor {
    center: CenterModality,
    moving: Vec<Modality>,
    backends: Backends,
    options: RunOptions,
}

impl NativeSpacePreprocessor {
    pub fn new(center: CenterModality, moving: Vec<Modality>, backends: Backends) -> Self {
        Self { center, moving, backends, options: RunOptions::default() }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator> {
        PipelineOrchestrator::new(
            PipelineVariant::NativeSpace,
            self.center,
            self.moving,
            self.backends,
            self.options,
        )
    }

    pub fn plan(self) -> Result<StagePlan> {
        Ok(self.build()?.plan().clone())
    }

    pub async fn run(self) -> Result<RunReport> {
        self.build()?.run().await
    }
}
