//! Static operation metadata: attributes, affine maps and function types.

use crate::arena::Handle;
use crate::types::Type;

/// Well-known attribute names.
pub mod names {
    pub const SYM_NAME: &str = "sym_name";
    pub const FUNCTION_TYPE: &str = "function_type";
    pub const FUNCTION_REF: &str = "function_ref";
    pub const VALUE: &str = "value";
    pub const DIMENSION: &str = "dimension";
    pub const DIMENSIONS: &str = "dimensions";
    pub const WORKLOAD: &str = "workload";
    pub const NUM_OPERANDS: &str = "num_operands";
    pub const ARGS_IN: &str = "args_in";
    pub const ARGS_OUT: &str = "args_out";
    pub const INDEXING_MAPS: &str = "indexing_maps";
    pub const ITERATOR_TYPES: &str = "iterator_types";
    pub const KERNEL: &str = "kernel";
    pub const ORDINAL: &str = "ordinal";
    pub const FORMAT: &str = "format";
    pub const DATA: &str = "data";
    pub const WORKGROUP_SIZE: &str = "workgroup_size";

    /// Marks a function exported as a dispatch entry.
    pub const EXPORT: &str = "executable.export";
    /// Marks a reduction entry function.
    pub const REDUCTION: &str = "executable.reduction";
    /// Symbol of the scalar combinator used by a reduction entry.
    pub const REDUCTION_APPLY: &str = "executable.reduction.apply";
    /// Dimension reduced by a reduction entry.
    pub const REDUCTION_DIMENSION: &str = "executable.reduction.dimension";
    /// Workgroup size `[x, y, z]` of a dispatch function.
    pub const EXECUTABLE_WORKGROUP_SIZE: &str = "executable.workgroup_size";
}

/// A single result expression of an [`AffineMap`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AffineExpr {
    /// The `k`-th loop dimension.
    Dim(u32),
    /// A constant index.
    Const(i64),
}

/// A map from loop dimensions to operand indices.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct AffineMap {
    pub num_dims: u32,
    pub results: Vec<AffineExpr>,
}

impl AffineMap {
    /// `(d0, .., dn-1) -> (d0, .., dn-1)`.
    pub fn identity(num_dims: u32) -> Self {
        Self {
            num_dims,
            results: (0..num_dims).map(AffineExpr::Dim).collect(),
        }
    }

    /// `(d0, .., dn-1) -> (d[p0], .., d[pn-1])`.
    pub fn permutation(permutation: &[u32]) -> Self {
        Self {
            num_dims: permutation.len() as u32,
            results: permutation.iter().map(|&p| AffineExpr::Dim(p)).collect(),
        }
    }

    /// `(d0, .., dn-1) -> (c)`.
    pub fn constant(num_dims: u32, value: i64) -> Self {
        Self {
            num_dims,
            results: vec![AffineExpr::Const(value)],
        }
    }

    /// Number of result expressions.
    pub fn rank(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` if the results are a permutation of all dimensions.
    pub fn is_permutation(&self) -> bool {
        if self.results.len() != self.num_dims as usize {
            return false;
        }
        let mut seen = vec![false; self.num_dims as usize];
        for expr in &self.results {
            match expr {
                AffineExpr::Dim(d) if !seen[*d as usize] => seen[*d as usize] = true,
                _ => return false,
            }
        }
        true
    }
}

/// Kind of a loop in an iteration space.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

impl IteratorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Reduction => "reduction",
        }
    }
}

/// Signature of a function-like operation.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct FunctionType {
    pub inputs: Vec<Handle<Type>>,
    pub results: Vec<Handle<Type>>,
}

/// A static attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    SymbolRef(String),
    IntList(Vec<i64>),
    Bytes(Vec<u8>),
    AffineMaps(Vec<AffineMap>),
    Iterators(Vec<IteratorType>),
    FunctionType(FunctionType),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::SymbolRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            Self::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_affine_maps(&self) -> Option<&[AffineMap]> {
        match self {
            Self::AffineMaps(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_iterators(&self) -> Option<&[IteratorType]> {
        match self {
            Self::Iterators(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_function_type(&self) -> Option<&FunctionType> {
        match self {
            Self::FunctionType(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}
