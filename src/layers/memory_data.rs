use log::debug;

use super::{Arity, Bounds, LayerOps, SetupContext};
use crate::{NetErr, Result, blob::BlobRef};

/// A source serving batches out of host memory handed over through `reset`.
///
/// Its tops are the data batch, shaped `(batch_size, channels, height, width)`, and the labels,
/// shaped `(batch_size)`. Batches are served in order and wrap around at the end of the data.
pub struct MemoryData {
    name: String,
    batch_size: usize,
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
    labels: Vec<f32>,
    n: usize,
    pos: usize,
}

impl MemoryData {
    pub fn new(name: &str, batch_size: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            name: name.to_string(),
            batch_size,
            channels,
            height,
            width,
            data: Vec::new(),
            labels: Vec::new(),
            n: 0,
            pos: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The number of values in a single item of the data top.
    pub fn item_size(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Replaces the served data and rewinds to the first batch.
    ///
    /// # Arguments
    /// * `data` - `n` items of `item_size()` values each.
    /// * `labels` - `n` labels.
    /// * `n` - The number of items, a multiple of the batch size.
    pub fn reset(&mut self, data: &[f32], labels: &[f32], n: usize) -> Result<()> {
        if n == 0 || self.batch_size == 0 || n % self.batch_size != 0 {
            return Err(NetErr::config(
                &self.name,
                format!("{n} items is not a positive multiple of the batch size {}", self.batch_size),
            ));
        }

        let item_size = self.item_size();
        if data.len() != n * item_size {
            return Err(NetErr::CountMismatch {
                what: format!("data handed to {}", self.name),
                got: data.len(),
                expected: n * item_size,
            });
        }

        if labels.len() != n {
            return Err(NetErr::CountMismatch {
                what: format!("labels handed to {}", self.name),
                got: labels.len(),
                expected: n,
            });
        }

        self.data = data.to_vec();
        self.labels = labels.to_vec();
        self.n = n;
        self.pos = 0;

        debug!(layer = self.name.as_str(), items = n; "memory data reset");
        Ok(())
    }
}

impl LayerOps for MemoryData {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(0),
            tops: Bounds::exact(2),
        }
    }

    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        _bottom: &[BlobRef],
        top: &[BlobRef],
    ) -> Result<()> {
        if self.batch_size == 0 || self.item_size() == 0 {
            return Err(NetErr::config(
                &self.name,
                "batch_size, channels, height and width must be positive",
            ));
        }

        top[0].borrow_mut().reshape(&[
            self.batch_size,
            self.channels,
            self.height,
            self.width,
        ]);
        top[1].borrow_mut().reshape(&[self.batch_size]);
        Ok(())
    }

    fn reshape(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        if self.n == 0 {
            return Err(NetErr::invariant(&self.name, "forward called before reset"));
        }

        let item_size = self.item_size();
        let (start, end) = (self.pos, self.pos + self.batch_size);

        top[0]
            .borrow()
            .copy_data_from_slice(&self.data[start * item_size..end * item_size])?;
        top[1]
            .borrow()
            .copy_data_from_slice(&self.labels[start..end])?;

        self.pos = end % self.n;
        Ok(())
    }
}
