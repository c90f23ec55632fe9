use super::{Arity, Bounds, LayerOps, Propagate, canonical_axis};
use crate::{NetErr, Result, blob::BlobRef};

/// Multiplies the first bottom by the second, broadcast over `shape[axis..axis + num_axes]` of
/// the first where `num_axes` is the number of axes of the second.
pub struct Scale {
    name: String,
    axis: isize,
    outer: usize,
    dim: usize,
    inner: usize,
}

impl Scale {
    pub fn new(name: &str, axis: isize) -> Self {
        Self {
            name: name.to_string(),
            axis,
            outer: 0,
            dim: 0,
            inner: 0,
        }
    }
}

impl LayerOps for Scale {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(2),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let s = bottom[1].borrow();

        let axis = canonical_axis(&self.name, &x, self.axis)?;
        let end = axis + s.num_axes();
        if end > x.num_axes() || &x.shape()[axis..end] != s.shape() {
            let spanned = &x.shape()[axis..end.min(x.num_axes())];
            return Err(NetErr::shape(
                &self.name,
                format!("scale {} against axes of {} from {axis}", s.name(), x.name()),
                s.shape(),
                spanned,
            ));
        }

        self.outer = x.count_range(0, axis);
        self.dim = s.count();
        self.inner = x.count_range(end, x.num_axes());

        top[0].borrow_mut().reshape_like(&x);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let x = x.data();
        let s = bottom[1].borrow();
        let s = s.data();
        let y = top[0].borrow();
        let mut y = y.data_mut();

        let mut i = 0;
        for _ in 0..self.outer {
            for &s in s.iter() {
                for _ in 0..self.inner {
                    y[i] = x[i] * s;
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
        let x = bottom[0].borrow();
        let s = bottom[1].borrow();

        if propagate.bottom(0) {
            let s = s.data();
            let mut dx = x.diff_mut();

            let mut i = 0;
            for _ in 0..self.outer {
                for &s in s.iter() {
                    for _ in 0..self.inner {
                        dx[i] += dy[i] * s;
                        i += 1;
                    }
                }
            }
        }

        if propagate.bottom(1) {
            let x = x.data();
            let mut ds = s.diff_mut();

            let mut i = 0;
            for _ in 0..self.outer {
                for d in 0..self.dim {
                    for _ in 0..self.inner {
                        ds[d] += dy[i] * x[i];
                        i += 1;
                    }
                }
            }
        }

        Ok(())
    }
}
