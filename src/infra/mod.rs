pub mod memory_store;
pub mod normalizers;

pub use memory_store::InMemoryVolumeStore;
pub use normalizers::{PercentileNormalizer, WindowingNormalizer};
