//! Capabilities the orchestrator invokes but never implements.
//!
//! Every call is synchronous from the orchestrator's point of view (an external
//! solver, a model, a file writer); the executor moves them onto blocking
//! threads and applies timeouts. Backend failures are opaque `anyhow` errors.

use crate::ledger::Transform;
use crate::volume::{Mask, Volume};
use anyhow::Result;
use std::path::Path;

/// Spatial registration backend (rigid, affine, deformable...)
pub trait Registrator: Send + Sync {
    /// Backend name, used in logs and persisted transforms
    fn name(&self) -> &str;

    /// Align `moving` onto `fixed`. Returns the resampled moving image and the transform used.
    fn register(&self, fixed: &Volume, moving: &Volume) -> Result<(Volume, Transform)>;

    /// Resample `image` with a transform previously produced by this backend
    fn transform(&self, image: &Volume, transform: &Transform) -> Result<Volume>;

    /// Inverse of `transform`, or `None` when the backend cannot invert it
    fn invert(&self, _transform: &Transform) -> Result<Option<Transform>> {
        Ok(None)
    }
}

pub trait BrainExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Binary brain mask in the geometry of `image`
    fn compute_mask(&self, image: &Volume) -> Result<Mask>;
}

pub trait Defacer: Send + Sync {
    fn name(&self) -> &str;

    /// Binary mask that is false over facial features
    fn compute_mask(&self, image: &Volume) -> Result<Mask>;

    /// Whether the mask must be computed from the brain-extracted image (Quickshear style)
    fn requires_brain_extraction(&self) -> bool {
        false
    }
}

pub trait N4BiasCorrector: Send + Sync {
    fn name(&self) -> &str;

    fn correct(&self, image: &Volume) -> Result<Volume>;
}

/// Pure per-voxel intensity function, applied only when an output is materialized
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;

    fn normalize(&self, image: &Volume) -> Result<Volume>;
}

/// Volume file access (NIfTI in production)
pub trait VolumeIo: Send + Sync {
    fn read(&self, path: &Path) -> Result<Volume>;

    fn write(&self, volume: &Volume, path: &Path) -> Result<()>;

    fn write_mask(&self, mask: &Mask, path: &Path) -> Result<()> {
        self.write(&mask.to_volume(), path)
    }
}
