use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Unroll, UnrolledArchitecture};
use crate::{
    NetErr, Result,
    filler::Filler,
    specs::{EltwiseOp, InnerProductSpec, LayerKind, LayerSpec, NetSpec, ParamSpec},
};

/// The configuration of an `RnnArchitecture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RnnConfig {
    pub num_output: usize,
    #[serde(default)]
    pub weight_filler: Filler,
    #[serde(default)]
    pub bias_filler: Filler,
}

/// An Elman network:
///
/// ```text
/// h_t = tanh(W_hh · (cont_t ⊙ h_{t-1}) + W_xh · x_t + W_xh_static · x_static + b_h)
/// o_t = tanh(W_ho · h_t + b_o)
/// ```
///
/// The static term is present only when the layer has a static input.
pub struct RnnArchitecture {
    config: RnnConfig,
}

impl RnnArchitecture {
    pub fn new(config: RnnConfig) -> Self {
        Self { config }
    }

    /// Parses the configuration of a recurrent layer.
    ///
    /// # Returns
    /// An error if `config` is not a valid `RnnConfig` or has no outputs.
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: RnnConfig = serde_json::from_value(config.clone())?;
        if config.num_output == 0 {
            return Err(NetErr::config("rnn", "num_output must be positive"));
        }

        Ok(Self::new(config))
    }

    fn inner_product(&self, name: &str, axis: isize, bias_term: bool) -> LayerSpec {
        let spec = InnerProductSpec::new(self.config.num_output)
            .axis(axis)
            .bias_term(bias_term)
            .weight_filler(self.config.weight_filler.clone())
            .bias_filler(self.config.bias_filler.clone());

        LayerSpec::new(name, LayerKind::InnerProduct(spec))
    }
}

impl UnrolledArchitecture for RnnArchitecture {
    fn recurrent_input_names(&self) -> Vec<String> {
        vec!["h_0".to_string()]
    }

    fn recurrent_input_shapes(&self, streams: usize) -> Vec<Vec<usize>> {
        vec![vec![1, streams, self.config.num_output]]
    }

    fn recurrent_output_names(&self, timesteps: usize) -> Vec<String> {
        vec![format!("h_{timesteps}")]
    }

    fn output_names(&self) -> Vec<String> {
        vec!["o".to_string()]
    }

    fn fill_unrolled_net(&self, net: &mut NetSpec, unroll: &Unroll) -> Result<()> {
        let timesteps = unroll.timesteps;

        // the input transform is computed for every timestep at once
        net.layers.push(
            self.inner_product("W_xh_x", 2, true)
                .bottom("x")
                .top("W_xh_x")
                .param(ParamSpec::named("W_xh"))
                .param(ParamSpec::named("b_h")),
        );

        if unroll.static_input {
            net.layers.push(
                self.inner_product("W_xh_x_static", 1, false)
                    .bottom("x_static")
                    .top("W_xh_x_static_preshape")
                    .param(ParamSpec::named("W_xh_static")),
            );
            net.layers.push(
                LayerSpec::new(
                    "W_xh_x_static_reshape",
                    LayerKind::Reshape {
                        shape: vec![1, -1, self.config.num_output as i64],
                    },
                )
                .bottom("W_xh_x_static_preshape")
                .top("W_xh_x_static"),
            );
        }

        net.layers.push(
            LayerSpec::new(
                "W_xh_x_slice",
                LayerKind::Slice {
                    axis: 0,
                    slice_point: Vec::new(),
                },
            )
            .bottom("W_xh_x")
            .tops((1..=timesteps).map(|t| format!("W_xh_x_{t}"))),
        );
        net.layers.push(
            LayerSpec::new(
                "cont_slice",
                LayerKind::Slice {
                    axis: 0,
                    slice_point: Vec::new(),
                },
            )
            .bottom("cont")
            .tops((1..=timesteps).map(|t| format!("cont_{t}"))),
        );

        for t in 1..=timesteps {
            let tm1 = t - 1;

            // a zero continuation flag starts a new sequence on that stream
            net.layers.push(
                LayerSpec::new(format!("h_conted_{tm1}"), LayerKind::Scale { axis: 0 })
                    .bottoms([format!("h_{tm1}"), format!("cont_{t}")])
                    .top(format!("h_conted_{tm1}"))
                    .propagate_down([true, false]),
            );
            net.layers.push(
                self.inner_product(&format!("W_hh_h_{tm1}"), 2, false)
                    .bottom(format!("h_conted_{tm1}"))
                    .top(format!("W_hh_h_{tm1}"))
                    .param(ParamSpec::named("W_hh")),
            );

            let mut sum = LayerSpec::new(
                format!("h_input_{t}"),
                LayerKind::Eltwise {
                    operation: EltwiseOp::Sum,
                    coeff: Vec::new(),
                },
            )
            .bottoms([format!("W_hh_h_{tm1}"), format!("W_xh_x_{t}")])
            .top(format!("h_neuron_input_{t}"));
            if unroll.static_input {
                sum = sum.bottom("W_xh_x_static");
            }
            net.layers.push(sum);

            net.layers.push(
                LayerSpec::new(format!("h_{t}"), LayerKind::TanH)
                    .bottom(format!("h_neuron_input_{t}"))
                    .top(format!("h_{t}")),
            );
            net.layers.push(
                self.inner_product(&format!("W_ho_h_{t}"), 2, true)
                    .bottom(format!("h_{t}"))
                    .top(format!("W_ho_h_{t}"))
                    .param(ParamSpec::named("W_ho"))
                    .param(ParamSpec::named("b_o")),
            );
            net.layers.push(
                LayerSpec::new(format!("o_{t}"), LayerKind::TanH)
                    .bottom(format!("W_ho_h_{t}"))
                    .top(format!("o_{t}")),
            );
        }

        net.layers.push(
            LayerSpec::new("o_concat", LayerKind::Concat { axis: 0 })
                .bottoms((1..=timesteps).map(|t| format!("o_{t}")))
                .top("o"),
        );

        Ok(())
    }
}
