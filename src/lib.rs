pub mod blob;
pub mod cancel;
pub mod error;
pub mod filler;
pub mod layers;
pub mod net;
pub mod recurrent;
pub mod specs;

pub use blob::{Alias, Blob, BlobId, BlobRef};
pub use cancel::CancelEvent;
pub use error::{ErrKind, NetErr, Result};
pub use filler::Filler;
pub use layers::{Layer, LayerOps, LayerState};
pub use net::{Net, NetBuilder, ParamState};
pub use recurrent::{
    ArchitectureRegistry, RecurrentLayer, RnnArchitecture, RnnConfig, Unroll,
    UnrolledArchitecture,
};
pub use specs::{LayerKind, LayerSpec, NetSpec, ParamSpec, Phase, RecurrentSpec};
