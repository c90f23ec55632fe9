use super::{Arity, Bounds, LayerOps, Propagate, SetupContext, canonical_axis};
use crate::{
    NetErr, Result,
    blob::{Blob, BlobRef},
    specs::BiasSpec,
};

/// Adds a learned bias broadcast over `shape[axis..axis + num_axes]` of the bottom.
///
/// With `num_axes` zero the bias is a single scalar.
pub struct Bias {
    name: String,
    spec: BiasSpec,
    outer: usize,
    dim: usize,
    inner: usize,
    bias: Option<BlobRef>,
}

impl Bias {
    pub fn new(name: &str, spec: BiasSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
            outer: 0,
            dim: 0,
            inner: 0,
            bias: None,
        }
    }

    /// The bias shape implied by a bottom blob.
    fn bias_shape(&self, x: &Blob) -> Result<(usize, Vec<usize>)> {
        if self.spec.num_axes == 0 {
            return Ok((0, Vec::new()));
        }

        let axis = canonical_axis(&self.name, x, self.spec.axis)?;
        let end = axis + self.spec.num_axes;
        if end > x.num_axes() {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "bias spans axes {axis}..{end} of blob {} with {} axes",
                    x.name(),
                    x.num_axes()
                ),
            ));
        }

        Ok((axis, x.shape()[axis..end].to_vec()))
    }

    fn bias(&self) -> Result<&BlobRef> {
        self.bias
            .as_ref()
            .ok_or_else(|| NetErr::invariant(&self.name, "bias used before setup"))
    }
}

impl LayerOps for Bias {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::exact(1),
        }
    }

    fn layer_setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        bottom: &[BlobRef],
        _top: &[BlobRef],
    ) -> Result<()> {
        let (_, shape) = self.bias_shape(&bottom[0].borrow())?;

        let bias = Blob::with_shape(format!("{}_bias", self.name), &shape);
        self.spec.filler.fill(&bias, ctx.rng)?;
        self.bias = Some(bias.into_ref());
        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let (axis, shape) = self.bias_shape(&x)?;

        let (dim, bias_shape) = {
            let bias = self.bias()?.borrow();
            (bias.count(), bias.shape().to_vec())
        };
        if bias_shape != shape {
            return Err(NetErr::shape(&self.name, "bias", &shape, &bias_shape));
        }

        self.outer = x.count_range(0, axis);
        self.dim = dim;
        self.inner = x.count_range(axis + shape.len(), x.num_axes());

        top[0].borrow_mut().reshape_like(&x);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let x = x.data();
        let y = top[0].borrow();
        let mut y = y.data_mut();
        let bias = self.bias()?.borrow();
        let b = bias.data();

        let mut i = 0;
        for _ in 0..self.outer {
            for &b in b.iter() {
                for _ in 0..self.inner {
                    y[i] = x[i] + b;
                    i += 1;
                }
            }
        }

        Ok(())
    }

    fn backward(
        &mut self,
        top: &[BlobRef],
        propagate: Propagate<'_>,
        bottom: &[BlobRef],
    ) -> Result<()> {
        let dy = top[0].borrow();
        let dy = dy.diff();

        if propagate.bottom(0) {
            let x = bottom[0].borrow();
            for (dx, &dy) in x.diff_mut().iter_mut().zip(dy.iter()) {
                *dx += dy;
            }
        }

        if propagate.param(0) {
            let bias = self.bias()?.borrow();
            let mut db = bias.diff_mut();

            let mut i = 0;
            for _ in 0..self.outer {
                for d in 0..self.dim {
                    db[d] += dy[i..i + self.inner].iter().sum::<f32>();
                    i += self.inner;
                }
            }
        }

        Ok(())
    }

    fn params(&self) -> Vec<BlobRef> {
        self.bias.iter().cloned().collect()
    }
}
