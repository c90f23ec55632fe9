use log::debug;
use serde::{Deserialize, Serialize};

use super::Net;
use crate::{NetErr, Result};

/// The persisted values of one distinct learnable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Net {
    /// Snapshots the distinct learnable parameters, in first occurrence order.
    pub fn export_params(&self) -> Vec<ParamState> {
        self.learnable_param_ids
            .iter()
            .map(|&id| {
                let param = self.params[id].borrow();
                ParamState {
                    name: self.param_display_names[id].clone(),
                    shape: param.shape().to_vec(),
                    data: param.data().to_vec(),
                }
            })
            .collect()
    }

    /// Loads values previously produced by `export_params` on an identical description.
    ///
    /// # Arguments
    /// * `states` - One record per distinct learnable parameter, in first occurrence order.
    ///
    /// # Returns
    /// An error if the number of records, any of their shapes or any of their value counts
    /// disagree with this network. Nothing is written unless every record is valid.
    pub fn import_params(&mut self, states: &[ParamState]) -> Result<()> {
        if states.len() != self.learnable_param_ids.len() {
            return Err(NetErr::CountMismatch {
                what: format!("parameters of net {}", self.name),
                got: states.len(),
                expected: self.learnable_param_ids.len(),
            });
        }

        for (state, &id) in states.iter().zip(&self.learnable_param_ids) {
            let param = self.params[id].borrow();
            if param.shape() != state.shape.as_slice() {
                return Err(NetErr::shape(
                    &self.name,
                    format!("imported parameter {}", state.name),
                    &state.shape,
                    param.shape(),
                ));
            }
            if state.data.len() != param.count() {
                return Err(NetErr::CountMismatch {
                    what: format!("values of imported parameter {}", state.name),
                    got: state.data.len(),
                    expected: param.count(),
                });
            }
        }

        for (state, &id) in states.iter().zip(&self.learnable_param_ids) {
            self.params[id].borrow().copy_data_from_slice(&state.data)?;
        }

        debug!(net = self.name.as_str(); "imported {} parameters", states.len());
        Ok(())
    }

    /// Re-binds the storage of every shared parameter to its owner's.
    pub fn share_weights(&self) -> Result<()> {
        for (param, owner) in self.params.iter().zip(&self.param_owners) {
            let Some(owner) = *owner else {
                continue;
            };

            let owner = self.params[owner].borrow();
            let mut param = param.borrow_mut();
            param.share_data(&owner)?;
            param.share_diff(&owner)?;
        }

        Ok(())
    }

    /// Zeroes the gradients of every distinct learnable parameter.
    pub fn clear_param_diffs(&self) {
        for &id in &self.learnable_param_ids {
            self.params[id].borrow().set_diff(0.0);
        }
    }
}
