use super::{Arity, Bounds, LayerOps, Propagate, SetupContext, canonical_axis};
use crate::{NetErr, Result, blob::BlobRef};

/// Splits its bottom along `axis` into one top per slice.
///
/// Without slice points the axis is split evenly, otherwise `slice_point` lists the strictly
/// increasing offsets where each slice after the first starts.
pub struct Slice {
    name: String,
    axis: isize,
    slice_point: Vec<usize>,
    outer: usize,
    inner: usize,
    dim: usize,
    sizes: Vec<usize>,
}

impl Slice {
    pub fn new(name: &str, axis: isize, slice_point: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            axis,
            slice_point,
            outer: 0,
            inner: 0,
            dim: 0,
            sizes: Vec::new(),
        }
    }

    fn slice_sizes(&self, dim: usize, num_top: usize) -> Result<Vec<usize>> {
        if self.slice_point.is_empty() {
            if dim % num_top != 0 {
                return Err(NetErr::shape(
                    &self.name,
                    format!("axis of size {dim} split into {num_top} equal slices"),
                    &[dim],
                    &[dim - dim % num_top],
                ));
            }
            return Ok(vec![dim / num_top; num_top]);
        }

        let mut sizes = Vec::with_capacity(num_top);
        let mut prev = 0;
        for &point in &self.slice_point {
            if point <= prev || point >= dim {
                return Err(NetErr::config(
                    &self.name,
                    format!("slice points {:?} invalid for axis of size {dim}", self.slice_point),
                ));
            }
            sizes.push(point - prev);
            prev = point;
        }
        sizes.push(dim - prev);

        Ok(sizes)
    }
}

impl LayerOps for Slice {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::at_least(1),
        }
    }

    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        _bottom: &[BlobRef],
        top: &[BlobRef],
    ) -> Result<()> {
        if !self.slice_point.is_empty() && self.slice_point.len() != top.len() - 1 {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "{} slice points for {} tops",
                    self.slice_point.len(),
                    top.len()
                ),
            ));
        }

        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let axis = canonical_axis(&self.name, &x, self.axis)?;

        self.dim = x.dim(axis);
        self.sizes = self.slice_sizes(self.dim, top.len())?;
        self.outer = x.count_range(0, axis);
        self.inner = x.count_range(axis + 1, x.num_axes());

        let mut shape = x.shape().to_vec();
        for (blob, &size) in top.iter().zip(&self.sizes) {
            shape[axis] = size;
            blob.borrow_mut().reshape(&shape);
        }

        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let x = x.data();
        let mut offset = 0;

        for (blob, &size) in top.iter().zip(&self.sizes) {
            let chunk = size * self.inner;
            let blob = blob.borrow();
            let mut y = blob.data_mut();

            for o in 0..self.outer {
                let start = (o * self.dim + offset) * self.inner;
                y[o * chunk..(o + 1) * chunk].copy_from_slice(&x[start..start + chunk]);
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
        if !propagate.bottom(0) {
            return Ok(());
        }

        let x = bottom[0].borrow();
        let mut dx = x.diff_mut();
        let mut offset = 0;

        for (blob, &size) in top.iter().zip(&self.sizes) {
            let chunk = size * self.inner;
            let blob = blob.borrow();
            let dy = blob.diff();

            for o in 0..self.outer {
                let start = (o * self.dim + offset) * self.inner;
                for (dx, &dy) in dx[start..start + chunk]
                    .iter_mut()
                    .zip(&dy[o * chunk..(o + 1) * chunk])
                {
                    *dx += dy;
                }
            }
            offset += size;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrKind,
        layers::test_util::{assert_close, backward_all, blob, empty, setup},
    };

    #[test]
    fn even_split_along_leading_axis() {
        let mut layer = Slice::new("slice", 0, Vec::new());
        let bottom = [blob("x", &[2, 1, 2], &[1.0, 2.0, 3.0, 4.0])];
        let top = [empty("a"), empty("b")];
        setup(&mut layer, &bottom, &top);

        layer.forward(&bottom, &top).unwrap();
        assert_eq!(top[0].borrow().shape(), &[1, 1, 2]);
        assert_close(&top[1].borrow().data(), &[3.0, 4.0]);

        top[1].borrow().set_diff(1.0);
        backward_all(&mut layer, &top, &bottom);
        assert_close(&bottom[0].borrow().diff(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn slice_points_split_inner_axis() {
        let mut layer = Slice::new("slice", 1, vec![1]);
        let bottom = [blob("x", &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])];
        let top = [empty("a"), empty("b")];
        setup(&mut layer, &bottom, &top);

        layer.forward(&bottom, &top).unwrap();
        assert_close(&top[0].borrow().data(), &[1.0, 4.0]);
        assert_close(&top[1].borrow().data(), &[2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn uneven_split_is_rejected() {
        let mut layer = Slice::new("slice", 0, Vec::new());
        let bottom = [blob("x", &[3], &[])];
        let top = [empty("a"), empty("b")];

        let err = layer.reshape(&bottom, &top).unwrap_err();
        assert_eq!(err.kind(), ErrKind::Shape);
    }
}
