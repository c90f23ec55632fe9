mod architecture;
mod layer;
mod rnn;

pub use architecture::{ArchitectureFactory, ArchitectureRegistry, Unroll, UnrolledArchitecture};
pub use layer::RecurrentLayer;
pub use rnn::{RnnArchitecture, RnnConfig};
