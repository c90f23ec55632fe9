mod argmax;
mod bias;
mod concat;
mod dummy_data;
mod eltwise;
mod euclidean_loss;
mod inner_product;
mod input;
mod layer;
mod memory_data;
mod neuron;
mod reduction;
mod reshape;
mod scale;
mod slice;

pub use argmax::ArgMax;
pub use bias::Bias;
pub use concat::Concat;
pub use dummy_data::DummyData;
pub use eltwise::Eltwise;
pub use euclidean_loss::EuclideanLoss;
pub use inner_product::InnerProduct;
pub use input::Input;
pub(crate) use layer::canonical_axis;
pub use layer::{Arity, Bounds, Layer, LayerOps, LayerState, LayerVariant, Propagate, SetupContext};
pub use memory_data::MemoryData;
pub use neuron::{ActFn, Neuron};
pub use reduction::Reduction;
pub use reshape::Reshape;
pub use scale::Scale;
pub use slice::Slice;
