use super::{Arity, Bounds, LayerOps, Propagate, canonical_axis};
use crate::{NetErr, Result, blob::BlobRef};

/// Joins its bottoms along `axis`, every other axis must agree.
pub struct Concat {
    name: String,
    axis: isize,
    outer: usize,
    inner: usize,
    dim: usize,
    sizes: Vec<usize>,
}

impl Concat {
    pub fn new(name: &str, axis: isize) -> Self {
        Self {
            name: name.to_string(),
            axis,
            outer: 0,
            inner: 0,
            dim: 0,
            sizes: Vec::new(),
        }
    }
}

impl LayerOps for Concat {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::at_least(1),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let first = bottom[0].borrow();
        let axis = canonical_axis(&self.name, &first, self.axis)?;

        let mut shape = first.shape().to_vec();
        self.sizes.clear();
        self.sizes.push(first.dim(axis));

        for blob in &bottom[1..] {
            let blob = blob.borrow();
            let mut expected = blob.shape().to_vec();
            if expected.len() == shape.len() {
                expected[axis] = shape[axis];
            }
            if expected != shape {
                let mut wanted = shape.clone();
                if blob.num_axes() == shape.len() {
                    wanted[axis] = blob.dim(axis);
                }
                return Err(NetErr::shape(
                    &self.name,
                    format!("bottom {}", blob.name()),
                    blob.shape(),
                    &wanted,
                ));
            }
            self.sizes.push(blob.dim(axis));
        }

        shape[axis] = self.sizes.iter().sum();
        self.dim = shape[axis];
        self.outer = first.count_range(0, axis);
        self.inner = first.count_range(axis + 1, first.num_axes());

        top[0].borrow_mut().reshape(&shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let y = top[0].borrow();
        let mut y = y.data_mut();
        let mut offset = 0;

        for (blob, &size) in bottom.iter().zip(&self.sizes) {
            let chunk = size * self.inner;
            let blob = blob.borrow();
            let x = blob.data();

            for o in 0..self.outer {
                let start = (o * self.dim + offset) * self.inner;
                y[start..start + chunk].copy_from_slice(&x[o * chunk..(o + 1) * chunk]);
            }
            offset += size;
        }

        Ok(())
    }

    fn backward(
        &mut self,
        top: &[BlobRef],
        propagate: Propagate<'_>,
        bottom: &[BlobRef],
    ) -> Result<()> {
        let y = top[0].borrow();
        let dy = y.diff();
        let mut offset = 0;

        for (i, (blob, &size)) in bottom.iter().zip(&self.sizes).enumerate() {
            if propagate.bottom(i) {
                let chunk = size * self.inner;
                let blob = blob.borrow();
                let mut dx = blob.diff_mut();

                for o in 0..self.outer {
                    let start = (o * self.dim + offset) * self.inner;
                    for (dx, &dy) in dx[o * chunk..(o + 1) * chunk]
                        .iter_mut()
                        .zip(&dy[start..start + chunk])
                    {
                        *dx += dy;
                    }
                }
            }
            offset += size;
        }

        Ok(())
    }
}
