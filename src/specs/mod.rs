mod layer;

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::Result;
pub use layer::{
    BiasSpec, EltwiseOp, InnerProductSpec, LayerKind, RecurrentSpec, ReductionOp,
};

/// The phase a network runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// The description of a trainable parameter of a layer.
///
/// Parameters with the same name inside one network share a single physical copy, the first
/// occurrence owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ParamSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_lr_mult")]
    pub lr_mult: f32,
}

fn default_lr_mult() -> f32 {
    1.0
}

impl Default for ParamSpec {
    fn default() -> Self {
        Self {
            name: None,
            lr_mult: default_lr_mult(),
        }
    }
}

impl ParamSpec {
    /// Creates a new `ParamSpec` shared under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Sets the learning rate multiplier, zero disables gradient propagation to the parameter.
    pub fn lr_mult(mut self, lr_mult: f32) -> Self {
        self.lr_mult = lr_mult;
        self
    }
}

/// The description of a single node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub loss_weight: Vec<f32>,
    #[serde(default)]
    pub propagate_down: Vec<bool>,
    #[serde(default)]
    pub include: Option<Phase>,
}

impl LayerSpec {
    /// Creates a new `LayerSpec` without any wiring.
    ///
    /// # Arguments
    /// * `name` - The unique name of the layer.
    /// * `kind` - The layer type and its type specific configuration.
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            bottom: Vec::new(),
            top: Vec::new(),
            params: Vec::new(),
            loss_weight: Vec::new(),
            propagate_down: Vec::new(),
            include: None,
        }
    }

    pub fn bottom(mut self, name: impl Into<String>) -> Self {
        self.bottom.push(name.into());
        self
    }

    pub fn bottoms<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bottom.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn top(mut self, name: impl Into<String>) -> Self {
        self.top.push(name.into());
        self
    }

    pub fn tops<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.top.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn loss_weight(mut self, weight: f32) -> Self {
        self.loss_weight.push(weight);
        self
    }

    /// Sets the per bottom mask of which inputs may receive gradients.
    pub fn propagate_down<I>(mut self, mask: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        self.propagate_down = mask.into_iter().collect();
        self
    }

    pub fn include(mut self, phase: Phase) -> Self {
        self.include = Some(phase);
        self
    }
}

/// The graph description a `Net` is built from: an ordered list of layers wired by blob names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NetSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub force_backward: bool,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
}

impl NetSpec {
    /// Creates a new, empty `NetSpec`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn force_backward(mut self, force_backward: bool) -> Self {
        self.force_backward = force_backward;
        self
    }

    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    /// Parses a `NetSpec` from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses a `NetSpec` from a reader yielding its JSON representation.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Serializes this `NetSpec` to pretty printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrKind, filler::Filler};

    #[test]
    fn parses_json_description() {
        let json = r#"{
            "name": "tiny",
            "seed": 7,
            "layers": [
                { "name": "input", "type": "input", "top": ["x"], "shape": [[2, 3]] },
                {
                    "name": "ip", "type": "inner_product", "bottom": ["x"], "top": ["y"],
                    "num_output": 4,
                    "weight_filler": { "type": "gaussian", "std": 0.1 },
                    "params": [{ "name": "w" }, { "lr_mult": 0.0 }]
                },
                { "name": "act", "type": "tanh", "bottom": ["y"], "top": ["z"] }
            ]
        }"#;

        let spec = NetSpec::from_json(json).unwrap();
        assert_eq!(spec.seed, Some(7));
        assert_eq!(spec.phase, Phase::Train);
        assert_eq!(spec.layers.len(), 3);

        let LayerKind::InnerProduct(ip) = &spec.layers[1].kind else {
            panic!("expected an inner product layer");
        };
        assert_eq!(ip.num_output, 4);
        assert!(ip.bias_term);
        assert_eq!(ip.axis, 1);
        assert_eq!(
            ip.weight_filler,
            Filler::Gaussian {
                mean: 0.0,
                std: 0.1
            }
        );
        assert_eq!(spec.layers[1].params[0].name.as_deref(), Some("w"));
        assert_eq!(spec.layers[1].params[1].lr_mult, 0.0);
        assert_eq!(spec.layers[2].kind, LayerKind::TanH);
    }

    #[test]
    fn json_round_trips_through_builder() {
        let spec = NetSpec::new("rt").seed(3).layer(
            LayerSpec::new("loss", LayerKind::EuclideanLoss)
                .bottoms(["a", "b"])
                .top("loss")
                .loss_weight(0.5),
        );

        let parsed = NetSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = NetSpec::from_json(r#"{ "layers": [{ "name": "x", "type": "nope" }] }"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrKind::Configuration);
    }
}
