use rand::{SeedableRng, rngs::StdRng};

use super::Net;
use crate::{Result, cancel::CancelEvent, recurrent::ArchitectureRegistry, specs::NetSpec};

/// Builds `Net`s given a graph description.
pub struct NetBuilder {
    spec: NetSpec,
    registry: ArchitectureRegistry,
    cancel: CancelEvent,
    seed: Option<u64>,
}

impl NetBuilder {
    /// Creates a new `NetBuilder` with the built-in architectures, a fresh cancellation signal
    /// and the description's own seed.
    ///
    /// # Arguments
    /// * `spec` - The graph description.
    pub fn new(spec: NetSpec) -> Self {
        Self {
            seed: spec.seed,
            spec,
            registry: ArchitectureRegistry::builtin(),
            cancel: CancelEvent::new(),
        }
    }

    /// Sets the architectures recurrent layers are resolved against.
    pub fn registry(mut self, registry: ArchitectureRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the cancellation signal the network polls between layers.
    pub fn cancel(mut self, cancel: CancelEvent) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the seed of the parameter fillers.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds a new `Net` following the description.
    ///
    /// # Returns
    /// The ready network or the first error raised while setting up its layers.
    pub fn build(self) -> Result<Net> {
        let mut rng = self.generate_rng(self.seed);
        Net::init(self.spec, &self.registry, self.cancel, &mut rng)
    }

    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
