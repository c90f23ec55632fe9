use super::{Arity, Bounds, LayerOps, Propagate};
use crate::{NetErr, Result, blob::BlobRef};

/// The halved sum of squared differences between its two bottoms, averaged over the leading
/// axis: `Σ (a - b)² / (2 · shape[0])`.
pub struct EuclideanLoss {
    name: String,
    diff: Vec<f32>,
    num: usize,
}

impl EuclideanLoss {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            diff: Vec::new(),
            num: 1,
        }
    }
}

impl LayerOps for EuclideanLoss {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(2),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let a = bottom[0].borrow();
        let b = bottom[1].borrow();

        if a.count() != b.count() {
            return Err(NetErr::shape(
                &self.name,
                format!("{} against {}", b.name(), a.name()),
                b.shape(),
                a.shape(),
            ));
        }

        self.num = a.shape().first().copied().unwrap_or(1).max(1);
        self.diff.resize(a.count(), 0.0);
        top[0].borrow_mut().reshape(&[]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let a = bottom[0].borrow();
        let b = bottom[1].borrow();

        for ((d, &a), &b) in self.diff.iter_mut().zip(a.data().iter()).zip(b.data().iter()) {
            *d = a - b;
        }

        let dot: f32 = self.diff.iter().map(|d| d * d).sum();
        top[0].borrow().data_mut()[0] = dot / self.num as f32 / 2.;
        Ok(())
    }

    fn backward(
        &mut self,
        top: &[BlobRef],
        propagate: Propagate<'_>,
        bottom: &[BlobRef],
    ) -> Result<()> {
        let loss_weight = top[0].borrow().diff()[0];

        for (i, blob) in bottom.iter().enumerate() {
            if !propagate.bottom(i) {
                continue;
            }

            let sign = if i == 0 { 1. } else { -1. };
            let alpha = sign * loss_weight / self.num as f32;
            let blob = blob.borrow();
            for (dx, &d) in blob.diff_mut().iter_mut().zip(&self.diff) {
                *dx += alpha * d;
            }
        }

        Ok(())
    }

    fn default_loss_weights(&self) -> Vec<f32> {
        vec![1.0]
    }
}
