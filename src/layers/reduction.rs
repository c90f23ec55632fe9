use super::{Arity, Bounds, LayerOps, Propagate, canonical_axis};
use crate::{Result, blob::BlobRef, specs::ReductionOp};

/// Reduces every axis from `axis` onward, the top keeps `shape[..axis]`.
pub struct Reduction {
    name: String,
    op: ReductionOp,
    axis: isize,
    coeff: f32,
    num: usize,
    dim: usize,
}

impl Reduction {
    pub fn new(name: &str, op: ReductionOp, axis: isize, coeff: f32) -> Self {
        Self {
            name: name.to_string(),
            op,
            axis,
            coeff,
            num: 0,
            dim: 0,
        }
    }
}

impl LayerOps for Reduction {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let axis = canonical_axis(&self.name, &x, self.axis)?;

        self.num = x.count_range(0, axis);
        self.dim = x.count_range(axis, x.num_axes());
        top[0].borrow_mut().reshape(&x.shape()[..axis]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let x = x.data();
        let y = top[0].borrow();
        let mut y = y.data_mut();

        for (y, x) in y.iter_mut().zip(x.chunks(self.dim.max(1))) {
            let reduced = match self.op {
                ReductionOp::Sum => x.iter().sum::<f32>(),
                ReductionOp::Asum => x.iter().map(|x| x.abs()).sum(),
                ReductionOp::SumSq => x.iter().map(|x| x * x).sum(),
                ReductionOp::Mean => x.iter().sum::<f32>() / self.dim as f32,
            };
            *y = self.coeff * reduced;
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

        let y = top[0].borrow();
        let dy = y.diff();
        let blob = bottom[0].borrow();
        let x = blob.data();
        let mut dx = blob.diff_mut();

        let grad = |x: f32| match self.op {
            ReductionOp::Sum => 1.,
            ReductionOp::Asum if x > 0. => 1.,
            ReductionOp::Asum if x < 0. => -1.,
            ReductionOp::Asum => 0.,
            ReductionOp::SumSq => 2. * x,
            ReductionOp::Mean => 1. / self.dim as f32,
        };

        let chunks = dx.chunks_mut(self.dim.max(1)).zip(x.chunks(self.dim.max(1)));
        for ((dx, x), &dy) in chunks.zip(dy.iter()) {
            let scale = self.coeff * dy;
            for (dx, &x) in dx.iter_mut().zip(x) {
                *dx += scale * grad(x);
            }
        }

        Ok(())
    }
}
