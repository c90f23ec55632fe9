mod builder;
mod params;

use std::{collections::HashMap, rc::Rc};

use log::{debug, info};
use rand::rngs::StdRng;

use crate::{
    NetErr, Result,
    blob::{Blob, BlobRef},
    cancel::CancelEvent,
    layers::{Layer, SetupContext},
    recurrent::ArchitectureRegistry,
    specs::{LayerSpec, NetSpec, Phase},
};
pub use builder::NetBuilder;
pub use params::ParamState;

/// An ordered composition of layers wired by named blobs.
///
/// Layers run in construction order. Every blob name maps to exactly one blob, produced by
/// exactly one layer. Parameters sharing a name share a single physical copy owned by their
/// first occurrence.
pub struct Net {
    name: String,
    phase: Phase,
    cancel: CancelEvent,

    layers: Vec<Layer>,
    layer_index: HashMap<String, usize>,
    bottom_vecs: Vec<Vec<BlobRef>>,
    top_vecs: Vec<Vec<BlobRef>>,
    bottom_ids: Vec<Vec<usize>>,
    top_ids: Vec<Vec<usize>>,
    bottom_shapes: Vec<Vec<Vec<usize>>>,

    blobs: Vec<BlobRef>,
    blob_names: Vec<String>,
    blob_index: HashMap<String, usize>,
    blob_loss_weights: Vec<f32>,
    external_diffs: Vec<bool>,
    input_blob_ids: Vec<usize>,
    output_blob_ids: Vec<usize>,

    layer_need_backward: Vec<bool>,
    bottom_need_backward: Vec<Vec<bool>>,

    params: Vec<BlobRef>,
    param_owners: Vec<Option<usize>>,
    param_display_names: Vec<String>,
    param_layer_indices: Vec<(usize, usize)>,
    param_names_index: HashMap<String, usize>,
    learnable_param_ids: Vec<usize>,

    last_runnable: usize,
}

impl Net {
    /// Builds a network from its description with the built-in architectures, a fresh
    /// cancellation signal and the description's seed.
    pub fn new(spec: NetSpec) -> Result<Self> {
        NetBuilder::new(spec).build()
    }

    /// Returns a builder to customize how the network is built.
    pub fn builder(spec: NetSpec) -> NetBuilder {
        NetBuilder::new(spec)
    }

    /// Instantiates, wires and sets up every layer of `spec` kept in its phase.
    ///
    /// # Arguments
    /// * `spec` - The graph description.
    /// * `registry` - Resolves the architectures of recurrent layers.
    /// * `cancel` - The signal polled at layer boundaries.
    /// * `rng` - The random source used by every parameter filler.
    ///
    /// # Returns
    /// The ready network or the first error raised while building it.
    pub(crate) fn init(
        spec: NetSpec,
        registry: &ArchitectureRegistry,
        cancel: CancelEvent,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut net = Self {
            name: spec.name.clone(),
            phase: spec.phase,
            cancel,
            layers: Vec::new(),
            layer_index: HashMap::new(),
            bottom_vecs: Vec::new(),
            top_vecs: Vec::new(),
            bottom_ids: Vec::new(),
            top_ids: Vec::new(),
            bottom_shapes: Vec::new(),
            blobs: Vec::new(),
            blob_names: Vec::new(),
            blob_index: HashMap::new(),
            blob_loss_weights: Vec::new(),
            external_diffs: Vec::new(),
            input_blob_ids: Vec::new(),
            output_blob_ids: Vec::new(),
            layer_need_backward: Vec::new(),
            bottom_need_backward: Vec::new(),
            params: Vec::new(),
            param_owners: Vec::new(),
            param_display_names: Vec::new(),
            param_layer_indices: Vec::new(),
            param_names_index: HashMap::new(),
            learnable_param_ids: Vec::new(),
            last_runnable: 0,
        };

        let mut consumed = Vec::new();
        for layer_spec in &spec.layers {
            if layer_spec.include.is_some_and(|phase| phase != spec.phase) {
                debug!(net = net.name.as_str(), layer = layer_spec.name.as_str(); "layer excluded from phase {:?}", spec.phase);
                continue;
            }

            net.append_layer(layer_spec, registry, rng, &mut consumed)?;
        }

        net.output_blob_ids = (0..net.blobs.len()).filter(|&id| !consumed[id]).collect();
        net.analyze_backward(spec.force_backward);
        net.last_runnable = net.layers.len();

        info!(
            net = net.name.as_str();
            "network initialized with {} layers, {} blobs and {} learnable parameters",
            net.layers.len(),
            net.blobs.len(),
            net.learnable_param_ids.len()
        );

        Ok(net)
    }

    fn append_layer(
        &mut self,
        spec: &LayerSpec,
        registry: &ArchitectureRegistry,
        rng: &mut StdRng,
        consumed: &mut Vec<bool>,
    ) -> Result<()> {
        let layer_id = self.layers.len();

        if self.layer_index.contains_key(&spec.name) {
            return Err(NetErr::config(&spec.name, "duplicate layer name"));
        }

        let mut layer = Layer::new(spec, registry)?;
        debug!(net = self.name.as_str(), layer = spec.name.as_str(); "creating {} layer", layer.type_name());

        let mut bottom_ids = Vec::with_capacity(spec.bottom.len());
        for name in &spec.bottom {
            let &blob_id = self
                .blob_index
                .get(name)
                .ok_or_else(|| NetErr::UnknownBlob {
                    layer: spec.name.clone(),
                    blob: name.clone(),
                })?;

            consumed[blob_id] = true;
            bottom_ids.push(blob_id);
        }

        let mut top_ids = Vec::with_capacity(spec.top.len());
        for name in &spec.top {
            if spec.bottom.contains(name) {
                return Err(NetErr::config(
                    &spec.name,
                    format!("in-place computation on blob {name} is not supported"),
                ));
            }

            if self.blob_index.contains_key(name) {
                return Err(NetErr::DuplicateTop {
                    layer: spec.name.clone(),
                    blob: name.clone(),
                });
            }

            let blob_id = self.blobs.len();
            self.blobs.push(Blob::new(name.clone()).into_ref());
            self.blob_names.push(name.clone());
            self.blob_index.insert(name.clone(), blob_id);
            self.blob_loss_weights.push(0.0);
            self.external_diffs.push(false);
            consumed.push(false);
            top_ids.push(blob_id);
        }

        let bottoms: Vec<BlobRef> = bottom_ids.iter().map(|&id| Rc::clone(&self.blobs[id])).collect();
        let tops: Vec<BlobRef> = top_ids.iter().map(|&id| Rc::clone(&self.blobs[id])).collect();

        let mut ctx = SetupContext {
            phase: self.phase,
            rng,
            registry,
            cancel: &self.cancel,
        };
        layer.setup(&mut ctx, &bottoms, &tops)?;

        if layer.is_differentiable_source() {
            self.input_blob_ids.extend(&top_ids);
        }

        for (i, &blob_id) in top_ids.iter().enumerate() {
            let weight = layer.loss(i);
            if weight != 0.0 {
                debug!(layer = spec.name.as_str(); "top {} involved in loss with weight {weight}", self.blob_names[blob_id]);
                self.blob_loss_weights[blob_id] = weight;
            }
        }

        self.bottom_shapes.push(shapes_of(&bottoms));
        self.layer_index.insert(spec.name.clone(), layer_id);
        self.layers.push(layer);
        self.bottom_vecs.push(bottoms);
        self.top_vecs.push(tops);
        self.bottom_ids.push(bottom_ids);
        self.top_ids.push(top_ids);

        self.append_params(layer_id)
    }

    /// Registers the parameters of a freshly set up layer, aliasing named ones that already
    /// have an owner.
    fn append_params(&mut self, layer_id: usize) -> Result<()> {
        let layer = &self.layers[layer_id];

        for (param_id, param) in layer.params().into_iter().enumerate() {
            let net_param_id = self.params.len();
            let shared_name = layer.param_specs().get(param_id).and_then(|p| p.name.clone());
            let display_name = shared_name
                .clone()
                .unwrap_or_else(|| param.borrow().name().to_string());

            let owner_id = shared_name
                .as_ref()
                .and_then(|name| self.param_names_index.get(name).copied());

            match owner_id {
                None => {
                    if let Some(name) = shared_name {
                        self.param_names_index.insert(name, net_param_id);
                    }
                    self.learnable_param_ids.push(net_param_id);
                }
                Some(owner_id) => {
                    let owner = self.params[owner_id].borrow();
                    let mut shared = param.borrow_mut();

                    if shared.shape() != owner.shape() {
                        return Err(NetErr::shape(
                            layer.name(),
                            format!("shared parameter {display_name}"),
                            shared.shape(),
                            owner.shape(),
                        ));
                    }

                    shared.share_data(&owner)?;
                    shared.share_diff(&owner)?;
                    debug!(layer = layer.name(), param = net_param_id; "sharing parameter {display_name} owned by parameter {owner_id}");
                }
            }

            self.params.push(param);
            self.param_owners.push(owner_id);
            self.param_display_names.push(display_name);
            self.param_layer_indices.push((layer_id, param_id));
        }

        Ok(())
    }

    /// Decides which layers run backward and which of their bottoms receive gradients.
    ///
    /// A blob needs a gradient if it is a differentiable input or depends on a learnable
    /// parameter, as long as every consumer on the way allows it. Layers that do not feed a
    /// loss weighted top are pruned unless `force_backward` is set.
    fn analyze_backward(&mut self, force_backward: bool) {
        let num_blobs = self.blobs.len();
        let mut blob_need = vec![false; num_blobs];

        self.layer_need_backward.clear();
        self.bottom_need_backward.clear();

        for (layer_id, layer) in self.layers.iter().enumerate() {
            let bottom_need: Vec<bool> = self.bottom_ids[layer_id]
                .iter()
                .enumerate()
                .map(|(i, &blob_id)| blob_need[blob_id] && layer.allow_backward_to(i))
                .collect();

            let param_need = (0..layer.params().len()).any(|i| layer.param_propagate_down(i));
            let need = param_need || bottom_need.contains(&true);

            for &top_id in &self.top_ids[layer_id] {
                blob_need[top_id] = need || layer.is_differentiable_source();
            }

            self.layer_need_backward.push(need);
            self.bottom_need_backward.push(bottom_need);
        }

        let mut under_loss = vec![false; num_blobs];
        let mut grad_needed = vec![false; num_blobs];

        for layer_id in (0..self.layers.len()).rev() {
            let layer = &self.layers[layer_id];
            let tops = &self.top_ids[layer_id];

            let contributes = tops
                .iter()
                .enumerate()
                .any(|(i, &id)| layer.loss(i) != 0.0 || under_loss[id]);
            let receives = tops
                .iter()
                .enumerate()
                .any(|(i, &id)| layer.loss(i) != 0.0 || grad_needed[id]);

            if force_backward {
                self.layer_need_backward[layer_id] = true;
                for (i, need) in self.bottom_need_backward[layer_id].iter_mut().enumerate() {
                    *need = layer.allow_backward_to(i);
                }
            } else if !contributes || !receives {
                self.layer_need_backward[layer_id] = false;
                self.bottom_need_backward[layer_id].fill(false);
            }

            for (i, &blob_id) in self.bottom_ids[layer_id].iter().enumerate() {
                under_loss[blob_id] |= contributes;
                grad_needed[blob_id] |= self.bottom_need_backward[layer_id][i];
            }
        }

        for (layer, need) in self.layers.iter().zip(&self.layer_need_backward) {
            debug!(net = self.name.as_str(), layer = layer.name(); "needs backward computation: {need}");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cancel_event(&self) -> &CancelEvent {
        &self.cancel
    }

    /// Runs the forward pass over `[0, last_runnable)`.
    ///
    /// # Returns
    /// The sum of the weighted losses.
    pub fn forward(&mut self) -> Result<f32> {
        self.forward_range(0, self.last_runnable)
    }

    /// Runs the forward pass of the layers in `[from, to)`.
    ///
    /// A layer is reshaped first whenever its bottom shapes changed since it was last shaped.
    /// The cancellation signal is checked before every layer.
    ///
    /// # Arguments
    /// * `from` - The first layer to run.
    /// * `to` - One past the last layer to run.
    ///
    /// # Returns
    /// The sum of the weighted losses of the layers that ran.
    pub fn forward_range(&mut self, from: usize, to: usize) -> Result<f32> {
        if from > to || to > self.layers.len() {
            return Err(NetErr::invariant(
                &self.name,
                format!("forward range {from}..{to} out of 0..{}", self.layers.len()),
            ));
        }

        let mut loss = 0.0;
        for i in from..to {
            let layer = &mut self.layers[i];
            if self.cancel.is_cancelled() {
                return Err(NetErr::Cancelled {
                    layer: layer.name().to_string(),
                });
            }

            let bottoms = &self.bottom_vecs[i];
            let tops = &self.top_vecs[i];

            let shapes = shapes_of(bottoms);
            if shapes != self.bottom_shapes[i] {
                debug!(layer = layer.name(); "bottom shapes changed, reshaping");
                layer.reshape(bottoms, tops)?;
                self.bottom_shapes[i] = shapes;
            }

            loss += layer.forward(bottoms, tops)?;
        }

        Ok(loss)
    }

    /// Runs the backward pass over the whole runnable range.
    pub fn backward(&mut self) -> Result<()> {
        self.backward_to(0)
    }

    /// Runs the backward pass of the layers in `[to, last_runnable)`, in reverse order.
    ///
    /// The gradients of the blobs consumed in the range are first reset to their loss weight,
    /// except blobs marked as external. Parameter gradients accumulate.
    pub fn backward_to(&mut self, to: usize) -> Result<()> {
        let end = self.last_runnable;
        if to > end {
            return Err(NetErr::invariant(
                &self.name,
                format!("backward down to layer {to} past the last runnable layer {end}"),
            ));
        }

        for i in to..end {
            for (b, &blob_id) in self.bottom_ids[i].iter().enumerate() {
                if self.bottom_need_backward[i][b] && !self.external_diffs[blob_id] {
                    self.blobs[blob_id]
                        .borrow()
                        .set_diff(self.blob_loss_weights[blob_id]);
                }
            }
        }

        for i in (to..end).rev() {
            let layer = &mut self.layers[i];
            if self.cancel.is_cancelled() {
                return Err(NetErr::Cancelled {
                    layer: layer.name().to_string(),
                });
            }

            if self.layer_need_backward[i] {
                layer.backward(
                    &self.top_vecs[i],
                    &self.bottom_need_backward[i],
                    &self.bottom_vecs[i],
                )?;
            }
        }

        Ok(())
    }

    /// Reshapes every layer from the current shapes of the blobs.
    pub fn reshape(&mut self) -> Result<()> {
        for i in 0..self.layers.len() {
            self.layers[i].reshape(&self.bottom_vecs[i], &self.top_vecs[i])?;
            self.bottom_shapes[i] = shapes_of(&self.bottom_vecs[i]);
        }

        Ok(())
    }

    /// Declares that the gradient of a blob belongs to an enclosing network, which resets it.
    pub fn mark_external_gradient(&mut self, name: &str) -> Result<()> {
        let id = self.blob_id(name)?;
        self.external_diffs[id] = true;
        Ok(())
    }

    fn blob_id(&self, name: &str) -> Result<usize> {
        self.blob_index
            .get(name)
            .copied()
            .ok_or_else(|| NetErr::UnknownBlob {
                layer: self.name.clone(),
                blob: name.to_string(),
            })
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.blob_index.contains_key(name)
    }

    pub fn blob(&self, name: &str) -> Result<BlobRef> {
        Ok(Rc::clone(&self.blobs[self.blob_id(name)?]))
    }

    pub fn blobs(&self) -> &[BlobRef] {
        &self.blobs
    }

    pub fn blob_names(&self) -> &[String] {
        &self.blob_names
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(Layer::name).collect()
    }

    pub fn layer(&self, i: usize) -> Option<&Layer> {
        self.layers.get(i)
    }

    pub fn layer_mut(&mut self, i: usize) -> Option<&mut Layer> {
        self.layers.get_mut(i)
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layer_index.get(name).map(|&i| &self.layers[i])
    }

    pub fn layer_by_name_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layer_index.get(name).map(|&i| &mut self.layers[i])
    }

    pub fn bottom_blobs(&self, i: usize) -> &[BlobRef] {
        &self.bottom_vecs[i]
    }

    pub fn top_blobs(&self, i: usize) -> &[BlobRef] {
        &self.top_vecs[i]
    }

    /// Whether the layer runs during the backward pass.
    pub fn layer_needs_backward(&self, i: usize) -> bool {
        self.layer_need_backward.get(i).copied().unwrap_or(false)
    }

    /// Which bottoms of the layer receive gradients during the backward pass.
    pub fn bottom_need_backward(&self, i: usize) -> &[bool] {
        &self.bottom_need_backward[i]
    }

    /// The tops of the `Input` layers, in construction order.
    pub fn input_blobs(&self) -> Vec<BlobRef> {
        self.input_blob_ids.iter().map(|&id| Rc::clone(&self.blobs[id])).collect()
    }

    /// The blobs no layer consumes, in construction order.
    pub fn output_blobs(&self) -> Vec<BlobRef> {
        self.output_blob_ids.iter().map(|&id| Rc::clone(&self.blobs[id])).collect()
    }

    /// Every parameter of every layer, including the aliased ones.
    pub fn params(&self) -> &[BlobRef] {
        &self.params
    }

    /// For each parameter, the index of the parameter owning its storage, `None` for owners.
    pub fn param_owners(&self) -> &[Option<usize>] {
        &self.param_owners
    }

    /// For each parameter, the `(layer, parameter within the layer)` it belongs to.
    pub fn param_layer_indices(&self) -> &[(usize, usize)] {
        &self.param_layer_indices
    }

    pub fn param_display_names(&self) -> &[String] {
        &self.param_display_names
    }

    /// The distinct parameters, the owners in first occurrence order.
    pub fn learnable_params(&self) -> Vec<BlobRef> {
        self.learnable_param_ids
            .iter()
            .map(|&id| Rc::clone(&self.params[id]))
            .collect()
    }

    pub fn last_runnable(&self) -> usize {
        self.last_runnable
    }

    /// Truncates ordinary forward and backward passes to `[0, last_runnable)`.
    pub fn set_last_runnable(&mut self, last_runnable: usize) -> Result<()> {
        if last_runnable > self.layers.len() {
            return Err(NetErr::invariant(
                &self.name,
                format!(
                    "last runnable layer {last_runnable} past the {} layers",
                    self.layers.len()
                ),
            ));
        }

        self.last_runnable = last_runnable;
        Ok(())
    }
}

fn shapes_of(blobs: &[BlobRef]) -> Vec<Vec<usize>> {
    blobs.iter().map(|b| b.borrow().shape().to_vec()).collect()
}
