use super::{Arity, Bounds, LayerOps, SetupContext};
use crate::{NetErr, Result, blob::BlobRef};

/// An externally fed source: its tops get their shapes once, at setup, and the caller writes
/// their values before every forward pass.
pub struct Input {
    name: String,
    shapes: Vec<Vec<usize>>,
}

impl Input {
    /// Creates a new `Input` layer.
    ///
    /// # Arguments
    /// * `name` - The name of the layer.
    /// * `shapes` - Either one shape shared by every top or exactly one shape per top.
    pub fn new(name: &str, shapes: Vec<Vec<usize>>) -> Self {
        Self {
            name: name.to_string(),
            shapes,
        }
    }
}

impl LayerOps for Input {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(0),
            tops: Bounds::at_least(1),
        }
    }

    fn layer_setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        _bottom: &[BlobRef],
        top: &[BlobRef],
    ) -> Result<()> {
        if self.shapes.len() != 1 && self.shapes.len() != top.len() {
            return Err(NetErr::config(
                &self.name,
                format!(
                    "{} shapes given for {} tops, expected 1 or one per top",
                    self.shapes.len(),
                    top.len()
                ),
            ));
        }

        for (i, blob) in top.iter().enumerate() {
            let shape = &self.shapes[i.min(self.shapes.len() - 1)];
            blob.borrow_mut().reshape(shape);
        }

        Ok(())
    }

    fn reshape(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        Ok(())
    }

    fn is_differentiable_source(&self) -> bool {
        true
    }
}
