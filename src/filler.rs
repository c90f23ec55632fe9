use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::{NetErr, Result, blob::Blob};

/// How to initialize the values of a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filler {
    Constant {
        #[serde(default)]
        value: f32,
    },
    Uniform {
        #[serde(default)]
        min: f32,
        #[serde(default = "default_max")]
        max: f32,
    },
    Gaussian {
        #[serde(default)]
        mean: f32,
        #[serde(default = "default_std")]
        std: f32,
    },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in)]` where `fan_in = count / shape[0]`.
    Xavier,
}

fn default_max() -> f32 {
    1.0
}

fn default_std() -> f32 {
    1.0
}

impl Default for Filler {
    fn default() -> Self {
        Self::Constant { value: 0.0 }
    }
}

impl Filler {
    pub fn constant(value: f32) -> Self {
        Self::Constant { value }
    }

    pub fn uniform(min: f32, max: f32) -> Self {
        Self::Uniform { min, max }
    }

    pub fn gaussian(mean: f32, std: f32) -> Self {
        Self::Gaussian { mean, std }
    }

    /// Whether this filler always yields the same values.
    pub fn is_constant(&self) -> bool {
        matches!(self, Filler::Constant { .. })
    }

    /// Fills the value array of `blob`.
    ///
    /// # Arguments
    /// * `blob` - The blob to fill.
    /// * `rng` - The random source for the non constant fillers.
    ///
    /// # Returns
    /// An error if the distribution's parameters are invalid.
    pub fn fill<R: Rng>(&self, blob: &Blob, rng: &mut R) -> Result<()> {
        match *self {
            Filler::Constant { value } => blob.set_data(value),
            Filler::Uniform { min, max } => {
                let distribution = Uniform::new_inclusive(min, max)
                    .map_err(|e| NetErr::config(blob.name(), format!("uniform filler: {e}")))?;
                sample_into(blob, distribution, rng);
            }
            Filler::Gaussian { mean, std } => {
                let distribution = Normal::new(mean, std)
                    .map_err(|e| NetErr::config(blob.name(), format!("gaussian filler: {e}")))?;
                sample_into(blob, distribution, rng);
            }
            Filler::Xavier => {
                let count = blob.count();
                let fan_in = match blob.shape().first() {
                    Some(&n) if n > 0 => count / n,
                    _ => count,
                };
                let scale = (3.0 / fan_in.max(1) as f32).sqrt();
                let distribution = Uniform::new_inclusive(-scale, scale)
                    .map_err(|e| NetErr::config(blob.name(), format!("xavier filler: {e}")))?;
                sample_into(blob, distribution, rng);
            }
        }

        Ok(())
    }
}

fn sample_into<D, R>(blob: &Blob, distribution: D, rng: &mut R)
where
    D: Distribution<f32>,
    R: Rng,
{
    for x in blob.data_mut().iter_mut() {
        *x = distribution.sample(rng);
    }
}
