//! Type system for the operation graph.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    /// Returns `true` for floating-point scalars.
    pub fn is_float(self) -> bool {
        self.kind == ScalarKind::Float
    }
}

/// A single dimension of a shape.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Dimension {
    /// Statically known extent.
    Fixed(u32),
    /// Extent only known at runtime.
    Dynamic,
}

/// A ranked shape.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Shape {
    pub dims: Vec<Dimension>,
}

impl Shape {
    /// Builds a fully static shape.
    pub fn fixed(dims: &[u32]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Dimension::Fixed(d)).collect(),
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns `true` if every dimension is static.
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| matches!(d, Dimension::Fixed(_)))
    }

    /// Static extents, or `None` if any dimension is dynamic.
    pub fn static_dims(&self) -> Option<Vec<i64>> {
        self.dims
            .iter()
            .map(|d| match d {
                Dimension::Fixed(n) => Some(i64::from(*n)),
                Dimension::Dynamic => None,
            })
            .collect()
    }

    /// Total element count of a static shape. Rank 0 holds one element.
    pub fn num_elements(&self) -> Option<i64> {
        self.static_dims().map(|dims| dims.iter().product())
    }
}

/// A value type in the operation graph.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Type {
    /// Loop/array index.
    Index,
    /// A single scalar.
    Scalar(Scalar),
    /// An immutable value-semantics tensor.
    Tensor { shape: Shape, scalar: Scalar },
    /// A buffer with reference semantics.
    MemRef { shape: Shape, scalar: Scalar },
}

impl Type {
    /// Convenience constructor for a static tensor type.
    pub fn tensor(dims: &[u32], scalar: Scalar) -> Self {
        Self::Tensor {
            shape: Shape::fixed(dims),
            scalar,
        }
    }

    /// Convenience constructor for a static buffer type.
    pub fn memref(dims: &[u32], scalar: Scalar) -> Self {
        Self::MemRef {
            shape: Shape::fixed(dims),
            scalar,
        }
    }

    /// The shape of a tensor or buffer type.
    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Self::Tensor { shape, .. } | Self::MemRef { shape, .. } => Some(shape),
            Self::Index | Self::Scalar(_) => None,
        }
    }

    /// The element scalar of a shaped type, or the scalar itself.
    pub fn element_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Scalar(s) | Self::Tensor { scalar: s, .. } | Self::MemRef { scalar: s, .. } => {
                Some(*s)
            }
            Self::Index => None,
        }
    }

    /// Rank of a shaped type.
    pub fn rank(&self) -> Option<usize> {
        self.shape().map(Shape::rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::UniqueArena;

    #[test]
    fn scalar_constants() {
        assert_eq!(Scalar::F32.kind, ScalarKind::Float);
        assert_eq!(Scalar::F32.width, 4);
        assert!(Scalar::F32.is_float());
        assert!(!Scalar::I32.is_float());
    }

    #[test]
    fn type_dedup() {
        let mut types = UniqueArena::new();
        let t0 = types.insert(Type::tensor(&[4, 8], Scalar::F32));
        let t1 = types.insert(Type::tensor(&[4, 8], Scalar::F32));
        let t2 = types.insert(Type::memref(&[4, 8], Scalar::F32));
        assert_eq!(t0, t1);
        assert_ne!(t0, t2);
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn shape_queries() {
        let shape = Shape::fixed(&[2, 3, 4]);
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.num_elements(), Some(24));
        assert_eq!(Shape::fixed(&[]).num_elements(), Some(1));

        let dynamic = Shape {
            dims: vec![Dimension::Fixed(2), Dimension::Dynamic],
        };
        assert!(!dynamic.is_static());
        assert_eq!(dynamic.static_dims(), None);
    }

    #[test]
    fn element_scalar_of_shaped_and_scalar() {
        assert_eq!(
            Type::tensor(&[3], Scalar::I32).element_scalar(),
            Some(Scalar::I32)
        );
        assert_eq!(Type::Scalar(Scalar::F16).element_scalar(), Some(Scalar::F16));
        assert_eq!(Type::Index.element_scalar(), None);
        assert_eq!(Type::Index.rank(), None);
    }
}
