use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Arity, Bounds, LayerOps, SetupContext};
use crate::{NetErr, Result, blob::BlobRef, filler::Filler};

/// A source whose tops are produced by fillers.
///
/// Constant fillers run once at setup, random ones refill their top on every forward pass.
pub struct DummyData {
    name: String,
    shapes: Vec<Vec<usize>>,
    fillers: Vec<Filler>,
    rng: StdRng,
}

impl DummyData {
    /// Creates a new `DummyData` layer.
    ///
    /// # Arguments
    /// * `name` - The name of the layer.
    /// * `shapes` - One shape shared by every top or one per top.
    /// * `fillers` - None (zeros), one shared filler or one per top.
    pub fn new(name: &str, shapes: Vec<Vec<usize>>, fillers: Vec<Filler>) -> Self {
        Self {
            name: name.to_string(),
            shapes,
            fillers,
            rng: StdRng::seed_from_u64(0),
        }
    }

    fn filler(&self, top: usize) -> Filler {
        match self.fillers.len() {
            0 => Filler::default(),
            1 => self.fillers[0].clone(),
            _ => self.fillers[top].clone(),
        }
    }
}

impl LayerOps for DummyData {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(0),
            tops: Bounds::at_least(1),
        }
    }

    fn layer_setup(
        &mut self,
        ctx: &mut SetupContext<'_>,
        _bottom: &[BlobRef],
        top: &[BlobRef],
    ) -> Result<()> {
        let num_top = top.len();

        if self.shapes.len() != 1 && self.shapes.len() != num_top {
            return Err(NetErr::config(
                &self.name,
                format!("{} shapes given for {num_top} tops", self.shapes.len()),
            ));
        }

        if self.fillers.len() > 1 && self.fillers.len() != num_top {
            return Err(NetErr::config(
                &self.name,
                format!("{} fillers given for {num_top} tops", self.fillers.len()),
            ));
        }

        self.rng = StdRng::seed_from_u64(ctx.rng.random());

        for (i, blob) in top.iter().enumerate() {
            let shape = &self.shapes[i.min(self.shapes.len() - 1)];
            let mut blob = blob.borrow_mut();
            blob.reshape(shape);
            self.filler(i).fill(&blob, &mut self.rng)?;
        }

        Ok(())
    }

    fn reshape(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        for (i, blob) in top.iter().enumerate() {
            let filler = self.filler(i);
            if !filler.is_constant() {
                filler.fill(&blob.borrow(), &mut self.rng)?;
            }
        }

        Ok(())
    }
}
