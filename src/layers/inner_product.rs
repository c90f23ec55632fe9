use ndarray::{Axis, linalg, prelude::*};

use super::{Arity, Bounds, LayerOps, Propagate, SetupContext, canonical_axis};
use crate::{
    NetErr, Result,
    blob::{Blob, BlobRef},
    specs::InnerProductSpec,
};

/// A fully connected layer: flattens the bottom from `axis` onward into `K` features and maps
/// them to `num_output` values, `y = x · Wᵀ + b`.
///
/// The weight is shaped `(num_output, K)` and the bias `(num_output)`.
pub struct InnerProduct {
    name: String,
    spec: InnerProductSpec,
    axis: usize,
    m: usize,
    k: usize,
    weight: Option<BlobRef>,
    bias: Option<BlobRef>,
}

impl InnerProduct {
    pub fn new(name: &str, spec: InnerProductSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
            axis: 0,
            m: 0,
            k: 0,
            weight: None,
            bias: None,
        }
    }

    fn weight(&self) -> Result<&BlobRef> {
        self.weight
            .as_ref()
            .ok_or_else(|| NetErr::invariant(&self.name, "weights used before setup"))
    }
}

impl LayerOps for InnerProduct {
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
        let n = self.spec.num_output;
        if n == 0 {
            return Err(NetErr::config(&self.name, "num_output must be positive"));
        }

        let x = bottom[0].borrow();
        self.axis = canonical_axis(&self.name, &x, self.spec.axis)?;
        self.k = x.count_range(self.axis, x.num_axes());

        let weight = Blob::with_shape(format!("{}_weight", self.name), &[n, self.k]);
        self.spec.weight_filler.fill(&weight, ctx.rng)?;
        self.weight = Some(weight.into_ref());

        if self.spec.bias_term {
            let bias = Blob::with_shape(format!("{}_bias", self.name), &[n]);
            self.spec.bias_filler.fill(&bias, ctx.rng)?;
            self.bias = Some(bias.into_ref());
        }

        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let axis = canonical_axis(&self.name, &x, self.spec.axis)?;
        let k = x.count_range(axis, x.num_axes());

        if k != self.k {
            return Err(NetErr::shape(
                &self.name,
                format!("features of {} from axis {axis}", x.name()),
                &[k],
                &[self.k],
            ));
        }

        self.axis = axis;
        self.m = x.count_range(0, axis);

        let mut shape = x.shape()[..axis].to_vec();
        shape.push(self.spec.num_output);
        top[0].borrow_mut().reshape(&shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.spec.num_output);

        let x_blob = bottom[0].borrow();
        let x_data = x_blob.data();
        let x = ArrayView2::from_shape((m, k), &*x_data)?;

        let w_blob = self.weight()?.borrow();
        let w_data = w_blob.data();
        let w = ArrayView2::from_shape((n, k), &*w_data)?;

        let y_blob = top[0].borrow();
        let mut y_data = y_blob.data_mut();
        let mut y = ArrayViewMut2::from_shape((m, n), &mut *y_data)?;

        linalg::general_mat_mul(1.0, &x, &w.t(), 0.0, &mut y);

        if let Some(bias) = &self.bias {
            let b_blob = bias.borrow();
            let b_data = b_blob.data();
            y += &ArrayView1::from_shape(n, &*b_data)?;
        }

        Ok(())
    }

    fn backward(
        &mut self,
        top: &[BlobRef],
        propagate: Propagate<'_>,
        bottom: &[BlobRef],
    ) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.spec.num_output);

        let dy_blob = top[0].borrow();
        let dy_data = dy_blob.diff();
        let dy = ArrayView2::from_shape((m, n), &*dy_data)?;

        let x_blob = bottom[0].borrow();
        let w_blob = self.weight()?.borrow();

        if propagate.param(0) {
            let x_data = x_blob.data();
            let x = ArrayView2::from_shape((m, k), &*x_data)?;

            let mut dw_data = w_blob.diff_mut();
            let mut dw = ArrayViewMut2::from_shape((n, k), &mut *dw_data)?;
            linalg::general_mat_mul(1.0, &dy.t(), &x, 1.0, &mut dw);
        }

        if let Some(bias) = &self.bias
            && propagate.param(1)
        {
            let b_blob = bias.borrow();
            let mut db_data = b_blob.diff_mut();
            let mut db = ArrayViewMut1::from_shape(n, &mut *db_data)?;
            db += &dy.sum_axis(Axis(0));
        }

        if propagate.bottom(0) {
            let w_data = w_blob.data();
            let w = ArrayView2::from_shape((n, k), &*w_data)?;

            let mut dx_data = x_blob.diff_mut();
            let mut dx = ArrayViewMut2::from_shape((m, k), &mut *dx_data)?;
            linalg::general_mat_mul(1.0, &dy, &w, 1.0, &mut dx);
        }

        Ok(())
    }

    fn params(&self) -> Vec<BlobRef> {
        self.weight.iter().chain(&self.bias).cloned().collect()
    }
}
