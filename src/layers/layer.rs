use log::debug;
use rand::rngs::StdRng;

use super::{
    ArgMax, Bias, Concat, DummyData, Eltwise, EuclideanLoss, InnerProduct, Input, MemoryData,
    Neuron, Reduction, Reshape, Scale, Slice,
    neuron::ActFn,
};
use crate::{
    NetErr, Result,
    blob::{Blob, BlobRef},
    cancel::CancelEvent,
    recurrent::{ArchitectureRegistry, RecurrentLayer},
    specs::{LayerKind, LayerSpec, ParamSpec, Phase},
};

/// Everything a layer may need while it is being set up.
pub struct SetupContext<'a> {
    pub phase: Phase,
    pub rng: &'a mut StdRng,
    pub registry: &'a ArchitectureRegistry,
    pub cancel: &'a CancelEvent,
}

/// Inclusive bounds on the number of blobs a layer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: usize,
    pub max: Option<usize>,
}

impl Bounds {
    pub const fn exact(n: usize) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub const fn at_least(n: usize) -> Self {
        Self { min: n, max: None }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub fn contains(&self, n: usize) -> bool {
        n >= self.min && self.max.is_none_or(|max| n <= max)
    }
}

/// The number of bottom and top blobs a layer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub bottoms: Bounds,
    pub tops: Bounds,
}

/// Which bottoms and which parameters a backward call should compute gradients for.
#[derive(Debug, Clone, Copy)]
pub struct Propagate<'a> {
    bottoms: &'a [bool],
    params: &'a [bool],
}

impl<'a> Propagate<'a> {
    pub fn new(bottoms: &'a [bool], params: &'a [bool]) -> Self {
        Self { bottoms, params }
    }

    pub fn bottom(&self, i: usize) -> bool {
        self.bottoms.get(i).copied().unwrap_or(false)
    }

    pub fn param(&self, i: usize) -> bool {
        self.params.get(i).copied().unwrap_or(false)
    }

    pub fn any_bottom(&self) -> bool {
        self.bottoms.iter().any(|&down| down)
    }
}

/// The behavior every layer variant implements.
///
/// `backward` must accumulate into bottom and parameter gradients, never overwrite them.
pub trait LayerOps {
    fn arity(&self) -> Arity;

    /// One time setup: option validation and parameter allocation.
    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        _bottom: &[BlobRef],
        _top: &[BlobRef],
    ) -> Result<()> {
        Ok(())
    }

    /// Recomputes top shapes from bottom shapes, must be idempotent.
    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()>;

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()>;

    fn backward(
        &mut self,
        _top: &[BlobRef],
        _propagate: Propagate<'_>,
        _bottom: &[BlobRef],
    ) -> Result<()> {
        Ok(())
    }

    fn params(&self) -> Vec<BlobRef> {
        Vec::new()
    }

    /// Whether gradients may ever flow into the given bottom.
    fn allow_backward_to(&self, _bottom: usize) -> bool {
        true
    }

    /// Loss weights used when the layer description gives none.
    fn default_loss_weights(&self) -> Vec<f32> {
        Vec::new()
    }

    /// Whether the tops are externally fed leaves that may receive gradients.
    fn is_differentiable_source(&self) -> bool {
        false
    }
}

/// The closed set of layer implementations.
pub enum LayerVariant {
    Input(Input),
    DummyData(DummyData),
    MemoryData(MemoryData),
    InnerProduct(InnerProduct),
    Bias(Bias),
    Scale(Scale),
    Eltwise(Eltwise),
    Neuron(Neuron),
    Slice(Slice),
    Concat(Concat),
    Reshape(Reshape),
    Reduction(Reduction),
    EuclideanLoss(EuclideanLoss),
    ArgMax(ArgMax),
    Recurrent(Box<RecurrentLayer>),
}
use LayerVariant as V;

impl LayerVariant {
    fn ops(&self) -> &dyn LayerOps {
        match self {
            V::Input(l) => l,
            V::DummyData(l) => l,
            V::MemoryData(l) => l,
            V::InnerProduct(l) => l,
            V::Bias(l) => l,
            V::Scale(l) => l,
            V::Eltwise(l) => l,
            V::Neuron(l) => l,
            V::Slice(l) => l,
            V::Concat(l) => l,
            V::Reshape(l) => l,
            V::Reduction(l) => l,
            V::EuclideanLoss(l) => l,
            V::ArgMax(l) => l,
            V::Recurrent(l) => l.as_ref(),
        }
    }

    fn ops_mut(&mut self) -> &mut dyn LayerOps {
        match self {
            V::Input(l) => l,
            V::DummyData(l) => l,
            V::MemoryData(l) => l,
            V::InnerProduct(l) => l,
            V::Bias(l) => l,
            V::Scale(l) => l,
            V::Eltwise(l) => l,
            V::Neuron(l) => l,
            V::Slice(l) => l,
            V::Concat(l) => l,
            V::Reshape(l) => l,
            V::Reduction(l) => l,
            V::EuclideanLoss(l) => l,
            V::ArgMax(l) => l,
            V::Recurrent(l) => l.as_mut(),
        }
    }
}

/// The lifecycle of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerState {
    Uninitialized,
    Configured,
    Shaped,
    Ready,
}

/// A node of the graph: the generic layer contract wrapped around one `LayerVariant`.
pub struct Layer {
    name: String,
    type_name: &'static str,
    state: LayerState,
    loss_weights: Vec<f32>,
    param_specs: Vec<ParamSpec>,
    param_propagate_down: Vec<bool>,
    propagate_down: Vec<bool>,
    variant: LayerVariant,
}

impl Layer {
    /// Instantiates the layer a spec describes.
    ///
    /// # Arguments
    /// * `spec` - The layer's description.
    /// * `registry` - Resolves the architecture of recurrent layers.
    ///
    /// # Returns
    /// The new, uninitialized layer or an error if the description names an unknown architecture.
    pub fn new(spec: &LayerSpec, registry: &ArchitectureRegistry) -> Result<Self> {
        let name = spec.name.clone();

        let variant = match &spec.kind {
            LayerKind::Input { shape } => V::Input(Input::new(&name, shape.clone())),
            LayerKind::DummyData { shape, filler } => {
                V::DummyData(DummyData::new(&name, shape.clone(), filler.clone()))
            }
            LayerKind::MemoryData {
                batch_size,
                channels,
                height,
                width,
            } => V::MemoryData(MemoryData::new(
                &name,
                *batch_size,
                *channels,
                *height,
                *width,
            )),
            LayerKind::InnerProduct(ip) => V::InnerProduct(InnerProduct::new(&name, ip.clone())),
            LayerKind::Bias(bias) => V::Bias(Bias::new(&name, bias.clone())),
            LayerKind::Scale { axis } => V::Scale(Scale::new(&name, *axis)),
            LayerKind::Eltwise { operation, coeff } => {
                V::Eltwise(Eltwise::new(&name, *operation, coeff.clone()))
            }
            LayerKind::TanH => V::Neuron(Neuron::new(ActFn::TanH)),
            LayerKind::Sigmoid => V::Neuron(Neuron::new(ActFn::Sigmoid)),
            LayerKind::ReLU { negative_slope } => V::Neuron(Neuron::new(ActFn::ReLU {
                negative_slope: *negative_slope,
            })),
            LayerKind::Slice { axis, slice_point } => {
                V::Slice(Slice::new(&name, *axis, slice_point.clone()))
            }
            LayerKind::Concat { axis } => V::Concat(Concat::new(&name, *axis)),
            LayerKind::Reshape { shape } => V::Reshape(Reshape::new(&name, shape.clone())),
            LayerKind::Reduction {
                operation,
                axis,
                coeff,
            } => V::Reduction(Reduction::new(&name, *operation, *axis, *coeff)),
            LayerKind::EuclideanLoss => V::EuclideanLoss(EuclideanLoss::new(&name)),
            LayerKind::ArgMax {
                out_max_val,
                top_k,
                axis,
            } => V::ArgMax(ArgMax::new(&name, *out_max_val, *top_k, *axis)),
            LayerKind::Recurrent(recurrent) => {
                let architecture = registry.build(&name, &recurrent.architecture, &recurrent.config)?;
                V::Recurrent(Box::new(RecurrentLayer::new(
                    &name,
                    recurrent.expose_hidden,
                    architecture,
                )))
            }
        };

        Ok(Self {
            name,
            type_name: spec.kind.type_name(),
            state: LayerState::Uninitialized,
            loss_weights: spec.loss_weight.clone(),
            param_specs: spec.params.clone(),
            param_propagate_down: Vec::new(),
            propagate_down: spec.propagate_down.clone(),
            variant,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn arity(&self) -> Arity {
        self.variant.ops().arity()
    }

    /// Validates the wiring, performs the one time setup and shapes the tops.
    ///
    /// # Arguments
    /// * `ctx` - The setup context.
    /// * `bottom` - The input blobs.
    /// * `top` - The output blobs.
    pub fn setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        bottom: &[BlobRef],
        top: &[BlobRef],
    ) -> Result<()> {
        if self.state != LayerState::Uninitialized {
            return Err(NetErr::invariant(&self.name, "layer set up twice"));
        }

        self.check_blob_counts(bottom.len(), top.len())?;

        if !self.propagate_down.is_empty() && self.propagate_down.len() != bottom.len() {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "propagate_down has {} entries for {} bottoms",
                    self.propagate_down.len(),
                    bottom.len()
                ),
            ));
        }

        self.variant.ops_mut().layer_setup(ctx, bottom, top)?;
        self.state = LayerState::Configured;

        if self.loss_weights.is_empty() {
            self.loss_weights = self.variant.ops().default_loss_weights();
        }
        if self.loss_weights.len() > top.len() {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "{} loss weights given for {} tops",
                    self.loss_weights.len(),
                    top.len()
                ),
            ));
        }

        self.reshape(bottom, top)?;

        let num_params = self.params().len();
        if self.param_specs.len() > num_params {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "{} param specs given for {num_params} parameters",
                    self.param_specs.len()
                ),
            ));
        }
        self.param_propagate_down = (0..num_params)
            .map(|i| self.param_specs.get(i).is_none_or(|p| p.lr_mult != 0.0))
            .collect();

        for (i, blob) in top.iter().enumerate() {
            debug!(layer = self.name.as_str(), top = i; "top shape: {}", blob.borrow().shape_string());
        }

        self.state = LayerState::Ready;
        Ok(())
    }

    fn check_blob_counts(&self, bottoms: usize, tops: usize) -> Result<()> {
        let arity = self.arity();

        for (what, bounds, got) in [("bottom", arity.bottoms, bottoms), ("top", arity.tops, tops)] {
            if !bounds.contains(got) {
                return Err(NetErr::Arity {
                    layer: self.name.clone(),
                    what,
                    got,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }

        Ok(())
    }

    /// Recomputes the top shapes from the current bottom shapes.
    pub fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        if self.state == LayerState::Uninitialized {
            return Err(NetErr::invariant(&self.name, "reshape called before setup"));
        }

        self.variant.ops_mut().reshape(bottom, top)?;

        for (blob, &weight) in top.iter().zip(&self.loss_weights) {
            if weight != 0.0 {
                blob.borrow().set_diff(weight);
            }
        }

        if self.state == LayerState::Configured {
            self.state = LayerState::Shaped;
        }

        Ok(())
    }

    /// Computes the tops from the bottoms and the current parameters.
    ///
    /// # Returns
    /// The weighted loss produced by this layer, zero for non loss layers.
    pub fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<f32> {
        if self.state != LayerState::Ready {
            return Err(NetErr::invariant(&self.name, "forward called before setup"));
        }

        self.variant.ops_mut().forward(bottom, top)?;

        let loss = top
            .iter()
            .zip(&self.loss_weights)
            .filter(|&(_, &weight)| weight != 0.0)
            .map(|(blob, &weight)| weight * blob.borrow().data().iter().sum::<f32>())
            .sum();

        Ok(loss)
    }

    /// Accumulates the bottom and parameter gradients from the top gradients.
    ///
    /// # Arguments
    /// * `top` - The output blobs, their gradients are read.
    /// * `propagate_down` - One flag per bottom, whether to compute its gradient.
    /// * `bottom` - The input blobs, their gradients are accumulated into.
    pub fn backward(
        &mut self,
        top: &[BlobRef],
        propagate_down: &[bool],
        bottom: &[BlobRef],
    ) -> Result<()> {
        if self.state != LayerState::Ready {
            return Err(NetErr::invariant(&self.name, "backward called before setup"));
        }

        if propagate_down.len() != bottom.len() {
            return Err(NetErr::invariant(
                &self.name,
                format!(
                    "{} propagate flags given for {} bottoms",
                    propagate_down.len(),
                    bottom.len()
                ),
            ));
        }

        let propagate = Propagate::new(propagate_down, &self.param_propagate_down);
        self.variant.ops_mut().backward(top, propagate, bottom)
    }

    /// The trainable parameters of this layer.
    pub fn params(&self) -> Vec<BlobRef> {
        self.variant.ops().params()
    }

    pub fn param_specs(&self) -> &[ParamSpec] {
        &self.param_specs
    }

    pub fn param_propagate_down(&self, i: usize) -> bool {
        self.param_propagate_down.get(i).copied().unwrap_or(false)
    }

    pub fn set_param_propagate_down(&mut self, i: usize, value: bool) {
        if let Some(flag) = self.param_propagate_down.get_mut(i) {
            *flag = value;
        }
    }

    /// The loss weight of the given top.
    pub fn loss(&self, top: usize) -> f32 {
        self.loss_weights.get(top).copied().unwrap_or(0.0)
    }

    /// Whether gradients may flow into the given bottom, combining the layer's own rule with the
    /// spec's `propagate_down` mask.
    pub fn allow_backward_to(&self, bottom: usize) -> bool {
        self.variant.ops().allow_backward_to(bottom)
            && self.propagate_down.get(bottom).copied().unwrap_or(true)
    }

    pub fn is_differentiable_source(&self) -> bool {
        self.variant.ops().is_differentiable_source()
    }

    pub fn variant(&self) -> &LayerVariant {
        &self.variant
    }

    pub fn as_recurrent(&self) -> Option<&RecurrentLayer> {
        match &self.variant {
            V::Recurrent(l) => Some(l.as_ref()),
            _ => None,
        }
    }

    pub fn as_recurrent_mut(&mut self) -> Option<&mut RecurrentLayer> {
        match &mut self.variant {
            V::Recurrent(l) => Some(l.as_mut()),
            _ => None,
        }
    }

    pub fn as_memory_data_mut(&mut self) -> Option<&mut MemoryData> {
        match &mut self.variant {
            V::MemoryData(l) => Some(l),
            _ => None,
        }
    }
}

/// Resolves a spec axis against a bottom blob.
pub(crate) fn canonical_axis(layer: &str, blob: &Blob, axis: isize) -> Result<usize> {
    blob.canonical_axis(axis).ok_or_else(|| {
        NetErr::config(
            layer,
            format!(
                "axis {axis} out of range for blob {} with {} axes",
                blob.name(),
                blob.num_axes()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{ErrKind, specs::InnerProductSpec};

    fn blobs(shapes: &[&[usize]]) -> Vec<BlobRef> {
        shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| Blob::with_shape(format!("b{i}"), shape).into_ref())
            .collect()
    }

    #[test]
    fn bounds_contain() {
        assert!(Bounds::exact(2).contains(2));
        assert!(!Bounds::exact(2).contains(3));
        assert!(Bounds::at_least(1).contains(10));
        assert!(Bounds::between(2, 3).contains(3));
        assert!(!Bounds::between(2, 3).contains(1));
    }

    #[test]
    fn setup_rejects_bad_arity() {
        let registry = ArchitectureRegistry::builtin();
        let spec = LayerSpec::new("tanh", LayerKind::TanH);
        let mut layer = Layer::new(&spec, &registry).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let cancel = CancelEvent::new();
        let mut ctx = SetupContext {
            phase: Phase::Train,
            rng: &mut rng,
            registry: &registry,
            cancel: &cancel,
        };

        let bottom = blobs(&[&[2], &[2]]);
        let top = blobs(&[&[2]]);
        let err = layer.setup(&mut ctx, &bottom, &top).unwrap_err();
        assert_eq!(err.kind(), ErrKind::Configuration);
        assert_eq!(layer.state(), LayerState::Uninitialized);
    }

    #[test]
    fn lifecycle_reaches_ready() {
        let registry = ArchitectureRegistry::builtin();
        let spec = LayerSpec::new("ip", LayerKind::InnerProduct(InnerProductSpec::new(3)))
            .param(ParamSpec::default())
            .param(ParamSpec::default().lr_mult(0.0));
        let mut layer = Layer::new(&spec, &registry).unwrap();

        let bottom = blobs(&[&[2, 4]]);
        let top = blobs(&[&[1]]);
        assert!(layer.forward(&bottom, &top).is_err());

        let mut rng = StdRng::seed_from_u64(0);
        let cancel = CancelEvent::new();
        let mut ctx = SetupContext {
            phase: Phase::Train,
            rng: &mut rng,
            registry: &registry,
            cancel: &cancel,
        };
        layer.setup(&mut ctx, &bottom, &top).unwrap();

        assert_eq!(layer.state(), LayerState::Ready);
        assert_eq!(top[0].borrow().shape(), &[2, 3]);
        assert!(layer.param_propagate_down(0));
        assert!(!layer.param_propagate_down(1));
    }

    #[test]
    fn loss_layers_weight_their_output() {
        let registry = ArchitectureRegistry::builtin();
        let spec = LayerSpec::new("loss", LayerKind::EuclideanLoss).loss_weight(2.0);
        let mut layer = Layer::new(&spec, &registry).unwrap();

        let bottom = blobs(&[&[2, 1], &[2, 1]]);
        let top = blobs(&[&[1]]);
        let mut rng = StdRng::seed_from_u64(0);
        let cancel = CancelEvent::new();
        let mut ctx = SetupContext {
            phase: Phase::Train,
            rng: &mut rng,
            registry: &registry,
            cancel: &cancel,
        };
        layer.setup(&mut ctx, &bottom, &top).unwrap();

        bottom[0].borrow().copy_data_from_slice(&[1.0, 3.0]).unwrap();
        let loss = layer.forward(&bottom, &top).unwrap();

        // 0.5 * (1 + 9) / 2 = 2.5, weighted by 2
        assert!((loss - 5.0).abs() < 1e-6);
        assert_eq!(top[0].borrow().diff()[0], 2.0);
    }
}
