use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire graph engine.
pub type Result<T> = std::result::Result<T, NetErr>;

/// The category an error falls in.
///
/// Every category is fatal for the network being built or run: a graph left in an inconsistent
/// shape or alias state cannot continue, so callers are expected to rebuild it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrKind {
    /// Bad arity, missing buffers or invalid option combinations, raised at setup time.
    Configuration,
    /// Incompatible shapes between connected buffers, raised at setup or reshape time.
    Shape,
    /// A programming error by the caller or by an unrolled architecture.
    StructuralInvariant,
}

/// The graph engine's error type.
#[derive(Debug)]
pub enum NetErr {
    Arity {
        layer: String,
        what: &'static str,
        got: usize,
        min: usize,
        max: Option<usize>,
    },
    UnknownBlob {
        layer: String,
        blob: String,
    },
    DuplicateTop {
        layer: String,
        blob: String,
    },
    InvalidConfig {
        layer: String,
        reason: String,
    },
    Json(serde_json::Error),
    ShapeMismatch {
        layer: String,
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    CountMismatch {
        what: String,
        got: usize,
        expected: usize,
    },
    View(ndarray::ShapeError),
    Invariant {
        layer: String,
        reason: String,
    },
    Cancelled {
        layer: String,
    },
}

impl NetErr {
    /// Shorthand for an `InvalidConfig` error.
    pub fn config(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an `Invariant` error.
    pub fn invariant(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invariant {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a `ShapeMismatch` error.
    pub fn shape(
        layer: impl Into<String>,
        what: impl Into<String>,
        got: &[usize],
        expected: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            layer: layer.into(),
            what: what.into(),
            got: got.to_vec(),
            expected: expected.to_vec(),
        }
    }

    /// Returns the taxonomy category of this error.
    pub fn kind(&self) -> ErrKind {
        match self {
            NetErr::Arity { .. }
            | NetErr::UnknownBlob { .. }
            | NetErr::DuplicateTop { .. }
            | NetErr::InvalidConfig { .. }
            | NetErr::Json(_) => ErrKind::Configuration,
            NetErr::ShapeMismatch { .. } | NetErr::CountMismatch { .. } | NetErr::View(_) => {
                ErrKind::Shape
            }
            NetErr::Invariant { .. } | NetErr::Cancelled { .. } => ErrKind::StructuralInvariant,
        }
    }
}

impl Display for NetErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetErr::Arity {
                layer,
                what,
                got,
                min,
                max,
            } => match max {
                Some(max) if max == min => {
                    write!(f, "layer {layer} takes exactly {min} {what} blobs, got {got}")
                }
                Some(max) => write!(
                    f,
                    "layer {layer} takes between {min} and {max} {what} blobs, got {got}"
                ),
                None => write!(f, "layer {layer} takes at least {min} {what} blobs, got {got}"),
            },
            NetErr::UnknownBlob { layer, blob } => {
                write!(f, "layer {layer} refers to unknown blob {blob}")
            }
            NetErr::DuplicateTop { layer, blob } => {
                write!(f, "layer {layer} produces blob {blob} which already has a producer")
            }
            NetErr::InvalidConfig { layer, reason } => {
                write!(f, "invalid configuration for layer {layer}: {reason}")
            }
            NetErr::Json(e) => write!(f, "malformed net description: {e}"),
            NetErr::ShapeMismatch {
                layer,
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch in layer {layer} for {what}, got {got:?} and expected {expected:?}"
            ),
            NetErr::CountMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "there's a count mismatch for {what}, got {got} and expected {expected}"
            ),
            NetErr::View(e) => write!(f, "failed to view buffer as matrix: {e}"),
            NetErr::Invariant { layer, reason } => {
                write!(f, "structural invariant violated in layer {layer}: {reason}")
            }
            NetErr::Cancelled { layer } => write!(f, "cancelled before running layer {layer}"),
        }
    }
}

impl Error for NetErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetErr::Json(e) => Some(e),
            NetErr::View(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for NetErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ndarray::ShapeError> for NetErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::View(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let arity = NetErr::Arity {
            layer: "ip".into(),
            what: "bottom",
            got: 3,
            min: 1,
            max: Some(1),
        };
        assert_eq!(arity.kind(), ErrKind::Configuration);
        assert_eq!(
            arity.to_string(),
            "layer ip takes exactly 1 bottom blobs, got 3"
        );

        let shape = NetErr::shape("rnn", "bottom[2]", &[3, 4], &[2, 4]);
        assert_eq!(shape.kind(), ErrKind::Shape);

        let invariant = NetErr::invariant("rnn", "T changed");
        assert_eq!(invariant.kind(), ErrKind::StructuralInvariant);
    }
}
