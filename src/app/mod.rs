pub mod ports;

pub use ports::{BrainExtractor, Defacer, N4BiasCorrector, Normalizer, Registrator, VolumeIo};
