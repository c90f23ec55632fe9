use super::{Arity, Bounds, LayerOps, Propagate};
use crate::{Result, blob::BlobRef};

/// An element wise activation function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActFn {
    TanH,
    Sigmoid,
    ReLU { negative_slope: f32 },
}

impl ActFn {
    pub fn f(&self, x: f32) -> f32 {
        match *self {
            ActFn::TanH => x.tanh(),
            ActFn::Sigmoid => 1. / (1. + (-x).exp()),
            ActFn::ReLU { negative_slope } => {
                if x > 0. {
                    x
                } else {
                    negative_slope * x
                }
            }
        }
    }

    /// The derivative, given both the input `x` and the output `y = f(x)`.
    pub fn df(&self, x: f32, y: f32) -> f32 {
        match *self {
            ActFn::TanH => 1. - y * y,
            ActFn::Sigmoid => y * (1. - y),
            ActFn::ReLU { negative_slope } => {
                if x > 0. {
                    1.
                } else {
                    negative_slope
                }
            }
        }
    }
}

/// Applies an `ActFn` to every element of its bottom.
pub struct Neuron {
    act_fn: ActFn,
}

impl Neuron {
    pub fn new(act_fn: ActFn) -> Self {
        Self { act_fn }
    }
}

impl LayerOps for Neuron {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        top[0].borrow_mut().reshape_like(&bottom[0].borrow());
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let y = top[0].borrow();

        for (y, &x) in y.data_mut().iter_mut().zip(x.data().iter()) {
            *y = self.act_fn.f(x);
        }

        Ok(())
    }

    fn backward(
        &mut self,
        top: &[BlobRef],
        propagate: Propagate<'_>,
        bottom: &[BlobRef],
    ) -> Result<()> {
        if !propagate.bottom(0) {
            return Ok(());
        }

        let top = top[0].borrow();
        let (y, dy) = (top.data(), top.diff());
        let bottom = bottom[0].borrow();
        let x = bottom.data();

        for (i, dx) in bottom.diff_mut().iter_mut().enumerate() {
            *dx += dy[i] * self.act_fn.df(x[i], y[i]);
        }

        Ok(())
    }
}
