use std::rc::Rc;

use log::{debug, info};
use rand::Rng;

use super::{Unroll, UnrolledArchitecture};
use crate::{
    NetErr, Result,
    blob::BlobRef,
    layers::{Arity, Bounds, LayerOps, Propagate, SetupContext},
    net::Net,
    specs::{LayerKind, LayerSpec, NetSpec, Phase, ReductionOp},
};

const NOT_READY: &str = "recurrent layer used before setup";

/// The blobs of the unrolled network the recurrent layer binds to its own bottoms and tops.
struct Unrolled {
    net: Net,
    x: BlobRef,
    cont: BlobRef,
    x_static: Option<BlobRef>,
    recur_inputs: Vec<BlobRef>,
    recur_outputs: Vec<BlobRef>,
    outputs: Vec<BlobRef>,
}

/// A layer running a network unrolled over `T` timesteps.
///
/// Bottoms are `[x, cont, x_static?, h_0...]`: the signal shaped `(T, N, ...)`, the continuation
/// flags shaped `(T, N)`, an optional static signal shaped `(N, ...)` and, when the hidden state
/// is exposed, one initial state per recurrent input. Tops are the architecture's outputs
/// followed, when exposed, by the final hidden states.
///
/// Inputs and outputs are bound to the unrolled network by aliasing their storage. Without an
/// exposed hidden state, the final state of one forward pass seeds the next.
pub struct RecurrentLayer {
    name: String,
    expose_hidden: bool,
    architecture: Box<dyn UnrolledArchitecture>,
    phase: Phase,
    timesteps: usize,
    static_input: bool,
    params: Vec<BlobRef>,
    unrolled: Option<Unrolled>,
}

impl RecurrentLayer {
    /// Creates a new `RecurrentLayer`, the unrolled network is only built at setup.
    ///
    /// # Arguments
    /// * `name` - The name of the layer, prefixed to every unrolled layer.
    /// * `expose_hidden` - Whether the hidden state is an explicit bottom and top.
    /// * `architecture` - The per timestep structure.
    pub fn new(
        name: &str,
        expose_hidden: bool,
        architecture: Box<dyn UnrolledArchitecture>,
    ) -> Self {
        Self {
            name: name.to_string(),
            expose_hidden,
            architecture,
            phase: Phase::Train,
            timesteps: 0,
            static_input: false,
            params: Vec::new(),
            unrolled: None,
        }
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn has_static_input(&self) -> bool {
        self.static_input
    }

    /// The unrolled network, once the layer is set up.
    pub fn net(&self) -> Option<&Net> {
        self.unrolled.as_ref().map(|u| &u.net)
    }

    pub fn net_mut(&mut self) -> Option<&mut Net> {
        self.unrolled.as_mut().map(|u| &mut u.net)
    }

    /// Clears the hidden state carried between forward passes.
    pub fn reset(&mut self) {
        if let Some(unrolled) = &self.unrolled {
            for blob in &unrolled.recur_outputs {
                blob.borrow().set_data(0.0);
            }
        }
    }

    fn num_exposed(&self) -> usize {
        if self.expose_hidden {
            self.architecture.recurrent_input_names().len()
        } else {
            0
        }
    }

    /// Checks the bottoms against the unrolled dimensions.
    ///
    /// # Returns
    /// The number of streams `N`.
    fn check_bottoms(&self, bottom: &[BlobRef]) -> Result<usize> {
        let x = bottom[0].borrow();
        if x.num_axes() < 2 {
            return Err(NetErr::config(
                &self.name,
                format!("bottom {} must have at least 2 axes, got {}", x.name(), x.num_axes()),
            ));
        }

        let (timesteps, streams) = (x.dim(0), x.dim(1));
        if timesteps == 0 {
            return Err(NetErr::config(&self.name, "the input has no timesteps"));
        }
        if self.timesteps != 0 && timesteps != self.timesteps {
            return Err(NetErr::invariant(
                &self.name,
                format!("timesteps changed from {} to {timesteps}", self.timesteps),
            ));
        }

        let cont = bottom[1].borrow();
        if cont.shape() != [timesteps, streams].as_slice() {
            return Err(NetErr::shape(
                &self.name,
                format!("continuation flags {}", cont.name()),
                cont.shape(),
                &[timesteps, streams],
            ));
        }

        if self.static_input {
            let x_static = bottom[2].borrow();
            if x_static.shape().first() != Some(&streams) {
                let mut expected = x_static.shape().to_vec();
                match expected.first_mut() {
                    Some(first) => *first = streams,
                    None => expected.push(streams),
                }
                return Err(NetErr::shape(
                    &self.name,
                    format!("static input {}", x_static.name()),
                    x_static.shape(),
                    &expected,
                ));
            }
        }

        if self.expose_hidden {
            let first = 2 + usize::from(self.static_input);
            let shapes = self.architecture.recurrent_input_shapes(streams);
            for (blob, shape) in bottom[first..].iter().zip(&shapes) {
                let blob = blob.borrow();
                if blob.shape() != shape.as_slice() {
                    return Err(NetErr::shape(
                        &self.name,
                        format!("initial hidden state {}", blob.name()),
                        blob.shape(),
                        shape,
                    ));
                }
            }
        }

        Ok(streams)
    }

    /// Describes the unrolled network: the input layer, the architecture and one pseudo-loss per
    /// output, every layer name prefixed with this layer's.
    fn unrolled_spec(&self, bottom: &[BlobRef], unroll: &Unroll) -> Result<NetSpec> {
        let mut tops = vec!["x".to_string(), "cont".to_string()];
        let mut shapes = vec![
            bottom[0].borrow().shape().to_vec(),
            bottom[1].borrow().shape().to_vec(),
        ];
        if unroll.static_input {
            tops.push("x_static".to_string());
            shapes.push(bottom[2].borrow().shape().to_vec());
        }
        tops.extend(self.architecture.recurrent_input_names());
        shapes.extend(self.architecture.recurrent_input_shapes(unroll.streams));

        let mut spec = NetSpec::new(format!("{}_unrolled", self.name)).phase(self.phase);
        spec.layers
            .push(LayerSpec::new("input", LayerKind::Input { shape: shapes }).tops(tops));

        self.architecture.fill_unrolled_net(&mut spec, unroll)?;

        for output in self.architecture.output_names() {
            let name = format!("{output}_pseudoloss");
            spec.layers.push(
                LayerSpec::new(
                    name.clone(),
                    LayerKind::Reduction {
                        operation: ReductionOp::Sum,
                        axis: 0,
                        coeff: 1.0,
                    },
                )
                .bottom(output)
                .top(name)
                .loss_weight(1.0),
            );
        }

        for layer in &mut spec.layers {
            layer.name = format!("{}_{}", self.name, layer.name);
        }

        Ok(spec)
    }

    /// Excludes the trailing pseudo-losses from ordinary passes.
    fn truncate_pseudo_losses(&self, net: &mut Net) -> Result<()> {
        let outputs = self.architecture.output_names();
        let names = net.layer_names();
        let last_runnable = names.len().checked_sub(outputs.len()).ok_or_else(|| {
            NetErr::invariant(&self.name, "unrolled network has fewer layers than outputs")
        })?;

        for (layer, output) in names[last_runnable..].iter().zip(&outputs) {
            let expected = format!("{}_{output}_pseudoloss", self.name);
            if *layer != expected {
                return Err(NetErr::invariant(
                    &self.name,
                    format!("expected pseudo-loss {expected} at the end of the unrolled network, found {layer}"),
                ));
            }
        }

        net.set_last_runnable(last_runnable)
    }

    /// Fails unless every parameter of the unrolled network receives gradients.
    fn check_param_propagation(&self, net: &Net) -> Result<()> {
        for layer in net.layers() {
            for i in 0..layer.params().len() {
                if !layer.param_propagate_down(i) {
                    return Err(NetErr::invariant(
                        &self.name,
                        format!("parameter {i} of unrolled layer {} does not propagate", layer.name()),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl LayerOps for RecurrentLayer {
    fn arity(&self) -> Arity {
        let min = 2 + self.num_exposed();
        let tops = self.architecture.output_names().len() + self.num_exposed();

        Arity {
            bottoms: Bounds::between(min, min + 1),
            tops: Bounds::exact(tops),
        }
    }

    fn layer_setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        bottom: &[BlobRef],
        _top: &[BlobRef],
    ) -> Result<()> {
        let inputs = self.architecture.recurrent_input_names();
        let outputs_names = self.architecture.recurrent_output_names(1);
        if inputs.len() != outputs_names.len() {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "architecture pairs {} recurrent inputs with {} recurrent outputs",
                    inputs.len(),
                    outputs_names.len()
                ),
            ));
        }

        self.phase = ctx.phase;
        self.static_input = bottom.len() == 3 + self.num_exposed();
        let streams = self.check_bottoms(bottom)?;
        self.timesteps = bottom[0].borrow().dim(0);

        info!(
            layer = self.name.as_str();
            "assuming input batch contains {} timesteps of {streams} independent streams",
            self.timesteps
        );

        let unroll = Unroll {
            timesteps: self.timesteps,
            streams,
            static_input: self.static_input,
            expose_hidden: self.expose_hidden,
        };
        let spec = self.unrolled_spec(bottom, &unroll)?;

        let mut net = Net::builder(spec)
            .registry(ctx.registry.clone())
            .cancel(ctx.cancel.clone())
            .seed(ctx.rng.random())
            .build()?;

        self.truncate_pseudo_losses(&mut net)?;
        self.check_param_propagation(&net)?;

        net.mark_external_gradient("x")?;
        if self.static_input {
            net.mark_external_gradient("x_static")?;
        }

        let blobs = |names: Vec<String>| -> Result<Vec<BlobRef>> {
            names.iter().map(|name| net.blob(name)).collect()
        };
        let recur_inputs = blobs(inputs)?;
        let recur_outputs = blobs(self.architecture.recurrent_output_names(self.timesteps))?;
        let outputs = blobs(self.architecture.output_names())?;

        // backpropagation through time is truncated at the batch boundary
        for blob in &recur_outputs {
            blob.borrow().set_diff(0.0);
        }

        self.params = net.learnable_params();
        for param in &self.params {
            let param = param.borrow();
            debug!(layer = self.name.as_str(); "adopting parameter {} shaped {}", param.name(), param.shape_string());
        }

        self.unrolled = Some(Unrolled {
            x: net.blob("x")?,
            cont: net.blob("cont")?,
            x_static: if self.static_input {
                Some(net.blob("x_static")?)
            } else {
                None
            },
            recur_inputs,
            recur_outputs,
            outputs,
            net,
        });

        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let streams = self.check_bottoms(bottom)?;
        let shapes = self.architecture.recurrent_input_shapes(streams);
        let exposed = self.num_exposed();
        let unrolled = self
            .unrolled
            .as_mut()
            .ok_or_else(|| NetErr::invariant(&self.name, NOT_READY))?;

        {
            let x = bottom[0].borrow();
            let mut inner = unrolled.x.borrow_mut();
            inner.reshape_like(&x);
            inner.share_data(&x)?;
            inner.share_diff(&x)?;
        }
        {
            let cont = bottom[1].borrow();
            let mut inner = unrolled.cont.borrow_mut();
            inner.reshape_like(&cont);
            inner.share_data(&cont)?;
        }
        if let Some(inner) = &unrolled.x_static {
            let x_static = bottom[2].borrow();
            let mut inner = inner.borrow_mut();
            inner.reshape_like(&x_static);
            inner.share_data(&x_static)?;
            inner.share_diff(&x_static)?;
        }

        let first_hidden = bottom.len() - exposed;
        for (i, (blob, shape)) in unrolled.recur_inputs.iter().zip(&shapes).enumerate() {
            let mut blob = blob.borrow_mut();
            blob.reshape(shape);
            if exposed > 0 {
                blob.share_data(&bottom[first_hidden + i].borrow())?;
            }
        }

        unrolled.net.share_weights()?;
        unrolled.net.reshape()?;

        for (input, output) in unrolled.recur_inputs.iter().zip(&unrolled.recur_outputs) {
            let (input, output) = (input.borrow(), output.borrow());
            if input.shape() != output.shape() {
                return Err(NetErr::invariant(
                    &self.name,
                    format!(
                        "recurrent output {} shaped {} does not match recurrent input {} shaped {}",
                        output.name(),
                        output.shape_string(),
                        input.name(),
                        input.shape_string()
                    ),
                ));
            }
        }

        let exposed_outputs = if exposed > 0 {
            unrolled.recur_outputs.as_slice()
        } else {
            &[]
        };
        for (top, inner) in top.iter().zip(unrolled.outputs.iter().chain(exposed_outputs)) {
            let inner = inner.borrow();
            let mut top = top.borrow_mut();
            top.reshape_like(&inner);
            top.share_data(&inner)?;
            top.share_diff(&inner)?;
        }

        Ok(())
    }

    fn forward(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        let unrolled = self
            .unrolled
            .as_mut()
            .ok_or_else(|| NetErr::invariant(&self.name, NOT_READY))?;

        if self.phase == Phase::Test {
            unrolled.net.share_weights()?;
        }

        if !self.expose_hidden {
            for (input, output) in unrolled.recur_inputs.iter().zip(&unrolled.recur_outputs) {
                input.borrow().copy_from(&output.borrow(), false)?;
            }
        }

        unrolled.net.forward()?;
        Ok(())
    }

    fn backward(
        &mut self,
        _top: &[BlobRef],
        propagate: Propagate<'_>,
        _bottom: &[BlobRef],
    ) -> Result<()> {
        if propagate.bottom(1) {
            return Err(NetErr::invariant(
                &self.name,
                "cannot backpropagate to the continuation flags",
            ));
        }

        let unrolled = self
            .unrolled
            .as_mut()
            .ok_or_else(|| NetErr::invariant(&self.name, NOT_READY))?;

        // the unrolled network always adds into the shared input gradients, so the ones not
        // asked for are restored afterwards
        let mut kept = Vec::new();
        if !propagate.bottom(0) {
            kept.push(Rc::clone(&unrolled.x));
        }
        if let Some(x_static) = &unrolled.x_static
            && !propagate.bottom(2)
        {
            kept.push(Rc::clone(x_static));
        }
        let saved: Vec<Vec<f32>> = kept.iter().map(|b| b.borrow().diff().to_vec()).collect();

        unrolled.net.backward()?;

        for (blob, diff) in kept.iter().zip(saved) {
            blob.borrow().diff_mut().copy_from_slice(&diff);
        }

        Ok(())
    }

    fn params(&self) -> Vec<BlobRef> {
        self.params.clone()
    }

    fn allow_backward_to(&self, bottom: usize) -> bool {
        match bottom {
            0 => true,
            1 => false,
            2 => self.static_input,
            _ => false,
        }
    }
}
