use super::{Arity, Bounds, LayerOps};
use crate::{NetErr, Result, blob::BlobRef};

/// Gives its bottom a new shape without copying: the top aliases both arrays of the bottom.
///
/// A `0` in the target shape copies the bottom's axis at the same position and a single `-1`
/// is inferred from the element count.
pub struct Reshape {
    name: String,
    shape: Vec<i64>,
}

impl Reshape {
    pub fn new(name: &str, shape: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            shape,
        }
    }

    fn resolve(&self, bottom_shape: &[usize]) -> Result<Vec<usize>> {
        let count: usize = bottom_shape.iter().product();
        let mut shape = Vec::with_capacity(self.shape.len());
        let mut inferred = None;

        for (i, &dim) in self.shape.iter().enumerate() {
            match dim {
                0 => match bottom_shape.get(i) {
                    Some(&d) => shape.push(d),
                    None => {
                        return Err(NetErr::config(
                            &self.name,
                            format!("cannot copy axis {i} of a blob with {} axes", bottom_shape.len()),
                        ));
                    }
                },
                -1 if inferred.is_none() => {
                    inferred = Some(i);
                    shape.push(1);
                }
                -1 => return Err(NetErr::config(&self.name, "more than one inferred axis")),
                d if d > 0 => shape.push(d as usize),
                d => return Err(NetErr::config(&self.name, format!("invalid dimension {d}"))),
            }
        }

        if let Some(i) = inferred {
            let known: usize = shape.iter().product();
            if known == 0 || count % known != 0 {
                return Err(NetErr::shape(&self.name, "inferred reshape", &shape, bottom_shape));
            }
            shape[i] = count / known;
        }

        if shape.iter().product::<usize>() != count {
            return Err(NetErr::shape(&self.name, "reshape target", &shape, bottom_shape));
        }

        Ok(shape)
    }
}

impl LayerOps for Reshape {
    fn arity(&self) -> Arity {
        Arity {
            bottoms: Bounds::exact(1),
            tops: Bounds::exact(1),
        }
    }

    fn reshape(&mut self, bottom: &[BlobRef], top: &[BlobRef]) -> Result<()> {
        let x = bottom[0].borrow();
        let shape = self.resolve(x.shape())?;

        let mut y = top[0].borrow_mut();
        y.reshape(&shape);
        y.share_data(&x)?;
        y.share_diff(&x)
    }

    fn forward(&mut self, _bottom: &[BlobRef], _top: &[BlobRef]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrKind,
        layers::test_util::{blob, empty, setup},
    };

    #[test]
    fn copies_and_infers_axes() {
        let mut layer = Reshape::new("reshape", vec![0, -1, 2]);
        let bottom = [blob("x", &[3, 4, 2], &[])];
        let top = [empty("y")];
        setup(&mut layer, &bottom, &top);

        assert_eq!(top[0].borrow().shape(), &[3, 4, 2]);

        bottom[0].borrow_mut().reshape(&[3, 2, 4]);
        layer.reshape(&bottom, &top).unwrap();
        assert_eq!(top[0].borrow().shape(), &[3, 4, 2]);
    }

    #[test]
    fn top_aliases_bottom() {
        let mut layer = Reshape::new("reshape", vec![-1]);
        let bottom = [blob("x", &[2, 2], &[1.0, 2.0, 3.0, 4.0])];
        let top = [empty("y")];
        setup(&mut layer, &bottom, &top);

        top[0].borrow().diff_mut()[1] = 5.0;
        assert_eq!(&*top[0].borrow().data(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(bottom[0].borrow().diff()[1], 5.0);
    }

    #[test]
    fn rejects_count_change() {
        let layer = Reshape::new("reshape", vec![5]);
        let err = layer.resolve(&[2, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrKind::Shape);

        let layer = Reshape::new("reshape", vec![-1, -1]);
        let err = layer.resolve(&[2, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrKind::Configuration);
    }
}
