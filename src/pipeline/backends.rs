use crate::app::ports::{BrainExtractor, Defacer, N4BiasCorrector, Registrator, VolumeIo};
use std::fmt;
use std::sync::Arc;

/// Step backends configured for a run. Only volume I/O is mandatory; which of
/// the others are needed follows from the requested outputs.
#[derive(Clone)]
pub struct Backends {
    pub io: Arc<dyn VolumeIo>,
    pub registrator: Option<Arc<dyn Registrator>>,
    pub atlas_registrator: Option<Arc<dyn Registrator>>,
    pub brain_extractor: Option<Arc<dyn BrainExtractor>>,
    pub defacer: Option<Arc<dyn Defacer>>,
    pub bias_corrector: Option<Arc<dyn N4BiasCorrector>>,
}

impl Backends {
    pub fn new(io: Arc<dyn VolumeIo>) -> Self {
        Self {
            io,
            registrator: None,
            atlas_registrator: None,
            brain_extractor: None,
            defacer: None,
            bias_corrector: None,
        }
    }

    /// Co-registration backend (moving → center)
    pub fn with_registrator(mut self, registrator: Arc<dyn Registrator>) -> Self {
        self.registrator = Some(registrator);
        self
    }

    /// Atlas registration and atlas correction backend; may be the same instance as the co-registration one
    pub fn with_atlas_registrator(mut self, registrator: Arc<dyn Registrator>) -> Self {
        self.atlas_registrator = Some(registrator);
        self
    }

    pub fn with_brain_extractor(mut self, extractor: Arc<dyn BrainExtractor>) -> Self {
        self.brain_extractor = Some(extractor);
        self
    }

    pub fn with_defacer(mut self, defacer: Arc<dyn Defacer>) -> Self {
        self.defacer = Some(defacer);
        self
    }

    pub fn with_bias_corrector(mut self, corrector: Arc<dyn N4BiasCorrector>) -> Self {
        self.bias_corrector = Some(corrector);
        self
    }

    pub fn defacer_requires_brain_extraction(&self) -> bool {
        self.defacer.as_ref().is_some_and(|d| d.requires_brain_extraction())
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("registrator", &self.registrator.as_ref().map(|r| r.name().to_string()))
            .field("atlas_registrator", &self.atlas_registrator.as_ref().map(|r| r.name().to_string()))
            .field("brain_extractor", &self.brain_extractor.as_ref().map(|b| b.name().to_string()))
            .field("defacer", &self.defacer.as_ref().map(|d| d.name().to_string()))
            .field("bias_corrector", &self.bias_corrector.as_ref().map(|c| c.name().to_string()))
            .finish_non_exhaustive()
    }
}
