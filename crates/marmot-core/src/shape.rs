use std::fmt;

use serde::{Deserialize, Serialize};

// Shape — dimension sizes of a tensor
//
// A scalar is the empty shape and still holds one element, so a loss output
// declared as `[]` has a buffer of exactly one f32.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape `[]`.
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. The scalar shape has one element.
    /// Saturates at `usize::MAX`; see [`Shape::checked_byte_size`].
    pub fn elem_count(&self) -> usize {
        saturating_product(&self.0)
    }

    /// Number of elements spanned by the axes `start..` (the "inner" size
    /// when `start` is the first axis folded into a feature vector).
    pub fn count_from(&self, start: usize) -> usize {
        saturating_product(self.0.get(start..).unwrap_or(&[]))
    }

    /// Size of a specific axis.
    pub fn dim(&self, axis: usize) -> crate::Result<usize> {
        self.0.get(axis).copied().ok_or_else(|| {
            crate::Error::shape(format!("axis {axis} out of range for shape {self}"))
        })
    }

    /// Size in bytes of an f32 buffer holding this shape, saturating at
    /// `usize::MAX`.
    pub fn byte_size(&self) -> usize {
        self.elem_count().saturating_mul(std::mem::size_of::<f32>())
    }

    /// Size in bytes of an f32 buffer holding this shape, or a shape error
    /// when it does not fit in `usize`.
    pub fn checked_byte_size(&self) -> crate::Result<usize> {
        self.0
            .iter()
            .try_fold(std::mem::size_of::<f32>(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| crate::Error::shape(format!("shape {self} is too large to allocate")))
    }
}

fn saturating_product(dims: &[usize]) -> usize {
    dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape::scalar()
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_has_one_element() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.byte_size(), 4);
    }

    #[test]
    fn test_oversized_shape_is_rejected() {
        let s = Shape::from(vec![usize::MAX / 2, 3]);
        assert_eq!(s.elem_count(), usize::MAX);
        assert_eq!(s.byte_size(), usize::MAX);
        assert!(matches!(s.checked_byte_size(), Err(crate::Error::Shape(_))));
        assert_eq!(Shape::from((2, 3)).checked_byte_size().unwrap(), 24);
    }

    #[test]
    fn test_count_from_folds_trailing_axes() {
        let s = Shape::from(vec![2, 3, 4]);
        assert_eq!(s.count_from(1), 12);
        assert_eq!(s.count_from(3), 1);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_dim_out_of_range() {
        let s = Shape::from(3);
        assert_eq!(s.dim(0).unwrap(), 3);
        assert!(s.dim(1).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from((3, 4)).to_string(), "[3, 4]");
        assert_eq!(Shape::scalar().to_string(), "[]");
    }
}
