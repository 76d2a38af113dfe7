use crate::app::ports::VolumeIo;
use crate::volume::Volume;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Volume store keeping everything in memory, keyed by path. Clones share
/// the same contents, so a test can hand one clone to a run and inspect
/// what was written through another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVolumeStore {
    volumes: Arc<Mutex<HashMap<PathBuf, Volume>>>,
    writes: Arc<Mutex<Vec<PathBuf>>>,
}

impl InMemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a volume, as if it existed on disk
    pub fn insert(&self, path: impl Into<PathBuf>, volume: Volume) {
        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.insert(path.into(), volume);
        }
    }

    pub fn get(&self, path: &Path) -> Option<Volume> {
        self.volumes.lock().ok()?.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.volumes.lock().map(|v| v.contains_key(path)).unwrap_or(false)
    }

    /// Paths written through `VolumeIo`, in write order
    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

impl VolumeIo for InMemoryVolumeStore {
    fn read(&self, path: &Path) -> Result<Volume> {
        let volumes = self.volumes.lock().map_err(|_| anyhow!("volume store lock poisoned"))?;
        volumes
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no volume at {}", path.display()))
    }

    fn write(&self, volume: &Volume, path: &Path) -> Result<()> {
        let mut volumes = self.volumes.lock().map_err(|_| anyhow!("volume store lock poisoned"))?;
        volumes.insert(path.to_path_buf(), volume.clone());
        drop(volumes);

        self.writes
            .lock()
            .map_err(|_| anyhow!("volume store lock poisoned"))?
            .push(path.to_path_buf());
        debug!("Stored volume {:?} at {}", volume.geometry().dims, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;

    #[test]
    fn test_read_back_what_was_written() {
        let store = InMemoryVolumeStore::new();
        let volume = Volume::zeros(Geometry::with_dims([2, 3, 4]));
        store.write(&volume, Path::new("out/t1c.nii.gz")).unwrap();

        let shared = store.clone();
        assert_eq!(shared.read(Path::new("out/t1c.nii.gz")).unwrap(), volume);
        assert_eq!(shared.written_paths(), vec![PathBuf::from("out/t1c.nii.gz")]);
        assert!(shared.read(Path::new("missing.nii.gz")).is_err());
    }

    #[test]
    fn test_seeded_volumes_are_not_counted_as_writes() {
        let store = InMemoryVolumeStore::new();
        store.insert("in/flair.nii.gz", Volume::zeros(Geometry::with_dims([1, 1, 1])));
        assert!(store.contains(Path::new("in/flair.nii.gz")));
        assert!(store.written_paths().is_empty());
    }
}
