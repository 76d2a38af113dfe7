//! In-memory voxel grids passed between the orchestrator and its backends.
//!
//! The orchestrator only ever does bookkeeping on these (shape checks, mask
//! multiplication); every other voxel operation belongs to a backend.

use crate::constants::GEOMETRY_TOLERANCE;
use crate::error::VolumeError;
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

/// Voxel grid layout and its placement in world coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub dims: [usize; 3],
    pub voxel_size: [f64; 3],
    pub affine: [[f64; 4]; 4],
}

impl Geometry {
    pub fn new(dims: [usize; 3], voxel_size: [f64; 3], affine: [[f64; 4]; 4]) -> Self {
        Self { dims, voxel_size, affine }
    }

    /// Geometry with isotropic 1mm voxels and an identity affine
    pub fn with_dims(dims: [usize; 3]) -> Self {
        let mut affine = [[0.0; 4]; 4];
        for (i, row) in affine.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self::new(dims, [1.0; 3], affine)
    }

    pub fn voxel_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Same grid and same world placement, within floating point tolerance
    pub fn matches(&self, other: &Geometry) -> bool {
        if self.dims != other.dims {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= GEOMETRY_TOLERANCE;
        let voxel_sizes = self
            .voxel_size
            .iter()
            .zip(other.voxel_size.iter())
            .all(|(a, b)| close(*a, *b));
        let affines = self
            .affine
            .iter()
            .flatten()
            .zip(other.affine.iter().flatten())
            .all(|(a, b)| close(*a, *b));
        voxel_sizes && affines
    }
}

fn shape_of<T>(data: &Array3<T>) -> [usize; 3] {
    let (x, y, z) = data.dim();
    [x, y, z]
}

/// A 3D intensity image
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    geometry: Geometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: Geometry) -> Result<Self, VolumeError> {
        let found = shape_of(&data);
        if found != geometry.dims {
            return Err(VolumeError::ShapeMismatch { expected: geometry.dims, found });
        }
        Ok(Self { data, geometry })
    }

    pub fn zeros(geometry: Geometry) -> Self {
        let [x, y, z] = geometry.dims;
        Self { data: Array3::zeros((x, y, z)), geometry }
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn into_parts(self) -> (Array3<f32>, Geometry) {
        (self.data, self.geometry)
    }

    /// Same voxels placed on another grid of identical shape
    pub fn with_geometry(&self, geometry: Geometry) -> Result<Self, VolumeError> {
        Volume::new(self.data.clone(), geometry)
    }

    /// Pointwise intensity transform; geometry is untouched
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self { data: self.data.mapv(f), geometry: self.geometry.clone() }
    }

    /// Image × mask. Produces a new volume, the input is never modified.
    pub fn apply_mask(&self, mask: &Mask) -> Result<Self, VolumeError> {
        if self.geometry.dims != mask.geometry.dims {
            return Err(VolumeError::ShapeMismatch {
                expected: self.geometry.dims,
                found: mask.geometry.dims,
            });
        }
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&mask.data).for_each(|voxel, &keep| {
            if !keep {
                *voxel = 0.0;
            }
        });
        Ok(Self { data, geometry: self.geometry.clone() })
    }
}

/// A binary volume produced by brain extraction or defacing
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array3<bool>,
    geometry: Geometry,
}

impl Mask {
    pub fn new(data: Array3<bool>, geometry: Geometry) -> Result<Self, VolumeError> {
        let found = shape_of(&data);
        if found != geometry.dims {
            return Err(VolumeError::ShapeMismatch { expected: geometry.dims, found });
        }
        Ok(Self { data, geometry })
    }

    /// Every voxel whose intensity is above `threshold`
    pub fn from_threshold(volume: &Volume, threshold: f32) -> Self {
        Self {
            data: volume.data.mapv(|v| v > threshold),
            geometry: volume.geometry.clone(),
        }
    }

    pub fn data(&self) -> &Array3<bool> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn voxel_count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    /// The mask as a 0/1 intensity image, for writers that only handle intensities
    pub fn to_volume(&self) -> Volume {
        Volume {
            data: self.data.mapv(|v| if v { 1.0 } else { 0.0 }),
            geometry: self.geometry.clone(),
        }
    }
}
