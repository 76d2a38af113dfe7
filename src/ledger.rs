//! Append-only record of the spatial transforms and masks produced during a run.
//!
//! Entries are kept in recorded order and replayed in that order: atlas
//! registration is defined relative to the already co-registered image, so
//! composing out of order would map into the wrong space. Replaying the
//! entries of a modality from its input reconstructs the geometry of any
//! intermediate image it went through; replaying the inverses backwards maps
//! an atlas-space image (a segmentation, say) back to native space.

use crate::app::ports::Registrator;
use crate::constants::TRANSFORMS_FILE_NAME;
use crate::error::{PreprocessError, Result};
use crate::types::Stage;
use crate::volume::{Geometry, Mask, Volume};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque transform payload. Only the backend that produced it interprets
/// `kind` and `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub kind: String,
    pub parameters: Vec<f64>,
    pub source: Geometry,
    pub target: Geometry,
}

impl Transform {
    pub fn new(
        kind: impl Into<String>,
        parameters: Vec<f64>,
        source: Geometry,
        target: Geometry,
    ) -> Self {
        Self { kind: kind.into(), parameters, source, target }
    }
}

/// Which modalities an entry applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    Modality(String),
}

impl Scope {
    pub fn modality(name: impl Into<String>) -> Self {
        Scope::Modality(name.into())
    }

    pub fn covers(&self, modality: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Modality(name) => name == modality,
        }
    }
}

#[derive(Clone)]
pub enum LedgerAction {
    Transform {
        forward: Transform,
        inverse: Option<Transform>,
        registrator: Arc<dyn Registrator>,
    },
    Mask(Arc<Mask>),
}

impl fmt::Debug for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerAction::Transform { forward, inverse, registrator } => f
                .debug_struct("Transform")
                .field("registrator", &registrator.name())
                .field("kind", &forward.kind)
                .field("invertible", &inverse.is_some())
                .finish(),
            LedgerAction::Mask(mask) => f
                .debug_struct("Mask")
                .field("dims", &mask.geometry().dims)
                .field("voxels", &mask.voxel_count())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub step: Stage,
    pub scope: Scope,
    pub action: LedgerAction,
}

impl LedgerEntry {
    fn apply(&self, image: &Volume, modality: &str) -> Result<Volume> {
        match &self.action {
            LedgerAction::Transform { forward, registrator, .. } => registrator
                .transform(image, forward)
                .map_err(|e| PreprocessError::from_backend(self.step, Some(modality), e)),
            LedgerAction::Mask(mask) => Ok(image.apply_mask(mask)?),
        }
    }

    fn apply_inverse(&self, image: &Volume, modality: &str) -> Result<Volume> {
        match &self.action {
            LedgerAction::Transform { inverse: Some(inverse), registrator, .. } => registrator
                .transform(image, inverse)
                .map_err(|e| PreprocessError::from_backend(self.step, Some(modality), e)),
            LedgerAction::Transform { inverse: None, .. } => {
                Err(PreprocessError::NonInvertibleTransform {
                    step: self.step,
                    modality: modality.to_string(),
                })
            }
            // masks keep the grid; there is nothing to undo geometrically
            LedgerAction::Mask(_) => Ok(image.clone()),
        }
    }
}

/// Ordered transform history of one run
#[derive(Debug, Clone, Default)]
pub struct TransformLedger {
    entries: Vec<LedgerEntry>,
}

impl TransformLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transform(
        &mut self,
        step: Stage,
        scope: Scope,
        forward: Transform,
        inverse: Option<Transform>,
        registrator: Arc<dyn Registrator>,
    ) {
        debug!(
            "Ledger: recording {} transform from '{}' for {:?} (invertible: {})",
            step,
            registrator.name(),
            scope,
            inverse.is_some()
        );
        self.entries.push(LedgerEntry {
            step,
            scope,
            action: LedgerAction::Transform { forward, inverse, registrator },
        });
    }

    pub fn record_mask(&mut self, step: Stage, scope: Scope, mask: Arc<Mask>) {
        debug!("Ledger: recording {} mask for {:?}", step, scope);
        self.entries.push(LedgerEntry { step, scope, action: LedgerAction::Mask(mask) });
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries applicable to a modality, in recorded order
    pub fn entries_for<'a>(&'a self, modality: &'a str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.scope.covers(modality))
    }

    /// The mask recorded by `step`, if any
    pub fn mask(&self, step: Stage) -> Option<&Arc<Mask>> {
        self.entries.iter().find_map(|entry| match &entry.action {
            LedgerAction::Mask(mask) if entry.step == step => Some(mask),
            _ => None,
        })
    }

    /// Rebuild the image `modality` had at `up_to`: every transform recorded up
    /// to that stage, in recorded order, plus the mask of `up_to` itself.
    /// Masks of other stages are skipped since each masked image branches off
    /// the skull image (the defaced image is skull × defacing mask, not brain × defacing mask).
    pub fn apply(&self, image: &Volume, up_to: Stage, modality: &str) -> Result<Volume> {
        self.entries_for(modality)
            .filter(|entry| entry.step <= up_to)
            .filter(|entry| match entry.action {
                LedgerAction::Transform { .. } => true,
                LedgerAction::Mask(_) => entry.step == up_to,
            })
            .try_fold(image.clone(), |current, entry| entry.apply(&current, modality))
    }

    /// Compose only the entries recorded by `step`
    pub fn apply_step(&self, image: &Volume, step: Stage, modality: &str) -> Result<Volume> {
        self.entries_for(modality)
            .filter(|entry| entry.step == step)
            .try_fold(image.clone(), |current, entry| entry.apply(&current, modality))
    }

    /// Walk back from `from` towards native space, applying inverses in reverse order
    pub fn invert(&self, image: &Volume, from: Stage, modality: &str) -> Result<Volume> {
        let entries: Vec<&LedgerEntry> =
            self.entries_for(modality).filter(|entry| entry.step <= from).collect();
        entries
            .into_iter()
            .rev()
            .try_fold(image.clone(), |current, entry| entry.apply_inverse(&current, modality))
    }

    /// Spatial entries of a modality in a serializable form
    pub fn transforms_for(&self, modality: &str) -> PersistedLedger {
        let transforms = self
            .entries_for(modality)
            .filter_map(|entry| match &entry.action {
                LedgerAction::Transform { forward, inverse, registrator } => {
                    Some(PersistedTransform {
                        step: entry.step,
                        scope: entry.scope.clone(),
                        registrator: registrator.name().to_string(),
                        forward: forward.clone(),
                        inverse: inverse.clone(),
                    })
                }
                LedgerAction::Mask(_) => None,
            })
            .collect();
        PersistedLedger { modality: modality.to_string(), transforms }
    }

    /// Write `{dir}/{modality}/transforms.json` for every given modality
    pub fn save<'a>(
        &self,
        dir: &Path,
        modalities: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for modality in modalities {
            written.push(self.transforms_for(modality).save(dir)?);
        }
        info!("Saved transformations for {} modalities to {}", written.len(), dir.display());
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTransform {
    pub step: Stage,
    pub scope: Scope,
    pub registrator: String,
    pub forward: Transform,
    pub inverse: Option<Transform>,
}

/// Transform history of one modality as written to the transformations directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLedger {
    pub modality: String,
    pub transforms: Vec<PersistedTransform>,
}

impl PersistedLedger {
    pub fn path(dir: &Path, modality: &str) -> PathBuf {
        dir.join(modality).join(TRANSFORMS_FILE_NAME)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path(dir, &self.modality);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path, modality: &str) -> Result<Self> {
        let path = Self::path(dir, modality);
        let content = fs::read_to_string(&path).map_err(|e| {
            PreprocessError::config(format!(
                "no transformations for modality '{}' at {}: {}",
                modality,
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// The backend that produced `transform`, looked up by recorded name
    fn registrator_for<'r>(
        &self,
        transform: &PersistedTransform,
        registrators: &[&'r dyn Registrator],
    ) -> Result<&'r dyn Registrator> {
        registrators
            .iter()
            .copied()
            .find(|r| r.name() == transform.registrator)
            .ok_or_else(|| {
                PreprocessError::config(format!(
                    "{} transform of '{}' was produced by '{}', which is not among the given registrators",
                    transform.step, self.modality, transform.registrator
                ))
            })
    }

    /// Replay the forward transforms (native → last recorded space), each with
    /// the registrator that recorded it
    pub fn apply(&self, image: &Volume, registrators: &[&dyn Registrator]) -> Result<Volume> {
        self.transforms.iter().try_fold(image.clone(), |current, t| {
            self.registrator_for(t, registrators)?
                .transform(&current, &t.forward)
                .map_err(|e| PreprocessError::from_backend(t.step, Some(&self.modality), e))
        })
    }

    /// Map an image from the last recorded space back to native space
    pub fn invert(&self, image: &Volume, registrators: &[&dyn Registrator]) -> Result<Volume> {
        info!("Applying inverse transformation for {}", self.modality);
        self.transforms.iter().rev().try_fold(image.clone(), |current, t| {
            let inverse = t.inverse.as_ref().ok_or_else(|| {
                PreprocessError::NonInvertibleTransform {
                    step: t.step,
                    modality: self.modality.clone(),
                }
            })?;
            self.registrator_for(t, registrators)?
                .transform(&current, inverse)
                .map_err(|e| PreprocessError::from_backend(t.step, Some(&self.modality), e))
        })
    }
}
