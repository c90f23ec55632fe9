use super::{Arity, Bounds, LayerOps, Propagate, SetupContext};
use crate::{NetErr, Result, blob::BlobRef, specs::EltwiseOp};

/// Combines equally shaped bottoms element by element, either as a weighted sum or a product.
pub struct Eltwise {
    name: String,
    op: EltwiseOp,
    coeff: Vec<f32>,
}

impl Eltwise {
    pub fn new(name: &str, op: EltwiseOp, coeff: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            op,
            coeff,
        }
    }

    fn coeff(&self, i: usize) -> f32 {
        self.coeff.get(i).copied().unwrap_or(1.0)
    }
}

impl LayerOps for Eltwise {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::at_least(2),
            tops: Bounds::exact(1),
        }
    }

    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        bottom: &[BlobRef],
        _top: &[BlobRef],
    ) -> Result<()> {
        if !self.coeff.is_empty() {
            if self.op != EltwiseOp::Sum {
                return Err(NetErr::config(&self.name, "coefficients only apply to sums"));
            }

            if self.coeff.len() != bottom.len() {
                return Err(NetErr::config(
                    &self.name,
                    format!("{} coefficients for {} bottoms", self.coeff.len(), bottom.len()),
                ));
            }
        }

        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let first = bottom[0].borrow();

        for blob in &bottom[1..] {
            let blob = blob.borrow();
            if blob.shape() != first.shape() {
                return Err(NetErr::shape(
                    &self.name,
                    format!("bottom {}", blob.name()),
                    blob.shape(),
                    first.shape(),
                ));
            }
        }

        top[0].borrow_mut().reshape_like(&first);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let y = top[0].borrow();
        let mut y = y.data_mut();

        match self.op {
            EltwiseOp::Sum => {
                y.fill(0.0);
                for (i, blob) in bottom.iter().enumerate() {
                    let coeff = self.coeff(i);
                    for (y, &x) in y.iter_mut().zip(blob.borrow().data().iter()) {
                        *y += coeff * x;
                    }
                }
            }
            EltwiseOp::Prod => {
                y.fill(1.0);
                for blob in bottom {
                    for (y, &x) in y.iter_mut().zip(blob.borrow().data().iter()) {
                        *y *= x;
                    }
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

        for (i, blob) in bottom.iter().enumerate() {
            if !propagate.bottom(i) {
                continue;
            }

            match self.op {
                EltwiseOp::Sum => {
                    let coeff = self.coeff(i);
                    let blob = blob.borrow();
                    for (dx, &dy) in blob.diff_mut().iter_mut().zip(dy.iter()) {
                        *dx += coeff * dy;
                    }
                }
                EltwiseOp::Prod => {
                    let mut grad = dy.to_vec();
                    for (j, other) in bottom.iter().enumerate() {
                        if j == i {
                            continue;
                        }
                        for (g, &x) in grad.iter_mut().zip(other.borrow().data().iter()) {
                            *g *= x;
                        }
                    }

                    let blob = blob.borrow();
                    for (dx, g) in blob.diff_mut().iter_mut().zip(grad) {
                        *dx += g;
                    }
                }
            }
        }

        Ok(())
    }
}
