use std::collections::HashMap;

use serde_json::Value;

use super::RnnArchitecture;
use crate::{NetErr, Result, specs::NetSpec};

/// The dimensions a recurrent layer is unrolled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unroll {
    /// The number of timesteps `T`, fixed for the lifetime of the layer.
    pub timesteps: usize,
    /// The number of independent streams `N` at setup time.
    pub streams: usize,
    /// Whether a static input `x_static` shaped `(N, ...)` is wired.
    pub static_input: bool,
    pub expose_hidden: bool,
}

/// The per timestep structure of a recurrent model.
///
/// The unrolled network already has an `Input` layer exposing `x` shaped `(T, N, ...)`, `cont`
/// shaped `(T, N)`, `x_static` when present, and every recurrent input. Implementations append
/// the layers computing the recurrent outputs and the outputs from them, sharing parameters
/// across timesteps through named `ParamSpec`s.
pub trait UnrolledArchitecture {
    /// The names of the blobs holding the hidden state at timestep 0.
    fn recurrent_input_names(&self) -> Vec<String>;

    /// The shapes of the recurrent inputs for the given number of streams.
    fn recurrent_input_shapes(&self, streams: usize) -> Vec<Vec<usize>>;

    /// The names of the blobs holding the hidden state after the last timestep, paired with the
    /// recurrent inputs.
    fn recurrent_output_names(&self, timesteps: usize) -> Vec<String>;

    /// The names of the blobs exposed as the layer's tops, each shaped `(T, N, ...)`.
    fn output_names(&self) -> Vec<String>;

    /// Appends the unrolled layers to `net`.
    fn fill_unrolled_net(&self, net: &mut NetSpec, unroll: &Unroll) -> Result<()>;
}

/// Builds an architecture from its opaque configuration.
pub type ArchitectureFactory = fn(&Value) -> Result<Box<dyn UnrolledArchitecture>>;

/// The table of architectures recurrent layers may name, built once before the networks using it.
#[derive(Clone, Default)]
pub struct ArchitectureRegistry {
    factories: HashMap<String, ArchitectureFactory>,
}

impl ArchitectureRegistry {
    /// Creates a registry holding the architectures shipped with the crate, `"rnn"`.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("rnn", build_rnn);
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: ArchitectureFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiates the architecture a recurrent layer names.
    ///
    /// # Arguments
    /// * `layer` - The name of the recurrent layer, for errors.
    /// * `name` - The registered name of the architecture.
    /// * `config` - The architecture's configuration.
    pub fn build(
        &self,
        layer: &str,
        name: &str,
        config: &Value,
    ) -> Result<Box<dyn UnrolledArchitecture>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| NetErr::config(layer, format!("unknown recurrent architecture {name}")))?;

        factory(config)
    }
}

fn build_rnn(config: &Value) -> Result<Box<dyn UnrolledArchitecture>> {
    Ok(Box::new(RnnArchitecture::from_config(config)?))
}
