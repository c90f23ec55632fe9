use std::cmp::Ordering;

use super::{Arity, Bounds, LayerOps, Propagate, SetupContext, canonical_axis};
use crate::{NetErr, Result, blob::BlobRef};

/// Finds the `top_k` largest values, either along `axis` or over each flattened item.
///
/// Without an axis the top is shaped `(N, 1 or 2, top_k)`, holding the indices and, when
/// `out_max_val` is set, the values after them. With an axis, the axis is replaced by `top_k`
/// and the top holds the values if `out_max_val` is set and the indices otherwise.
///
/// Ties are broken in favour of the larger index. The layer has no gradient.
pub struct ArgMax {
    name: String,
    out_max_val: bool,
    top_k: usize,
    axis: Option<isize>,
    resolved_axis: Option<usize>,
}

impl ArgMax {
    pub fn new(name: &str, out_max_val: bool, top_k: usize, axis: Option<isize>) -> Self {
        Self {
            name: name.to_string(),
            out_max_val,
            top_k,
            axis,
            resolved_axis: None,
        }
    }

    /// The `top_k` largest `(value, index)` pairs, largest first.
    fn top_k_of(&self, values: impl Iterator<Item = f32>) -> Vec<(f32, usize)> {
        let mut pairs: Vec<(f32, usize)> = values.enumerate().map(|(i, v)| (v, i)).collect();
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        pairs.truncate(self.top_k);
        pairs
    }
}

impl LayerOps for ArgMax {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::exact(1),
        }
    }

    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        bottom: &[BlobRef],
        _top: &[BlobRef],
    ) -> Result<()> {
        if self.top_k == 0 {
            return Err(NetErr::config(&self.name, "top_k must be positive"));
        }

        let x = bottom[0].borrow();
        let limit = match self.axis {
            Some(axis) => {
                let axis = canonical_axis(&self.name, &x, axis)?;
                self.resolved_axis = Some(axis);
                x.dim(axis)
            }
            None => x.count_range(1.min(x.num_axes()), x.num_axes()),
        };

        if self.top_k > limit {
            return Err(NetErr::config(
                &self.name,
                format!("top_k {} exceeds the {limit} candidates", self.top_k),
            ));
        }

        Ok(())
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();

        let shape = match self.resolved_axis {
            Some(axis) => {
                let mut shape = x.shape().to_vec();
                shape[axis] = self.top_k;
                shape
            }
            None => {
                let mut shape = vec![1; x.num_axes().max(3)];
                shape[0] = x.shape().first().copied().unwrap_or(1);
                shape[1] = if self.out_max_val { 2 } else { 1 };
                shape[2] = self.top_k;
                shape
            }
        };

        top[0].borrow_mut().reshape(&shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let y = top[0].borrow();
        let mut y = y.data_mut();
        let top_k = self.top_k;

        match self.resolved_axis {
            Some(axis) => {
                let dim = x.dim(axis);
                let inner = x.count_range(axis + 1, x.num_axes());
                let num = x.count() / dim.max(1);
                let x = x.data();

                for i in 0..num {
                    let (o, r) = (i / inner, i % inner);
                    let pairs = self.top_k_of((0..dim).map(|j| x[(o * dim + j) * inner + r]));

                    for (j, (value, index)) in pairs.into_iter().enumerate() {
                        y[(o * top_k + j) * inner + r] =
                            if self.out_max_val { value } else { index as f32 };
                    }
                }
            }
            None => {
                let num = x.shape().first().copied().unwrap_or(1);
                let dim = x.count() / num.max(1);
                let stride = if self.out_max_val { 2 * top_k } else { top_k };
                let x = x.data();

                for i in 0..num {
                    let pairs = self.top_k_of(x[i * dim..(i + 1) * dim].iter().copied());

                    for (j, (value, index)) in pairs.into_iter().enumerate() {
                        y[i * stride + j] = index as f32;
                        if self.out_max_val {
                            y[i * stride + top_k + j] = value;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn backward(
        &mut self,
        _top: &[BlobRef],
        propagate: Propagate<'_>,
        _bottom: &[BlobRef],
    ) -> Result<()> {
        if propagate.any_bottom() {
            return Err(NetErr::invariant(&self.name, "argmax has no gradient"));
        }

        Ok(())
    }

    fn allow_backward_to(&self, _bottom: usize) -> bool {
        false
    }
}
