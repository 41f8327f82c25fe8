//! Expressions: pure values with no side effects.

use crate::arena::Handle;
use crate::types::Scalar;

use super::{GlobalVariable, LocalVariable};

/// A literal constant value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Literal {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Literal {
    /// Returns the scalar type of this literal.
    pub fn scalar(&self) -> Scalar {
        match *self {
            Self::Bool(_) => Scalar::BOOL,
            Self::I32(_) => Scalar::I32,
            Self::U32(_) => Scalar::U32,
            Self::F32(_) => Scalar::F32,
        }
    }

    /// The literal's bit pattern as a single 32-bit word.
    pub fn bits(&self) -> u32 {
        match *self {
            Self::Bool(v) => u32::from(v),
            Self::I32(v) => v as u32,
            Self::U32(v) => v,
            Self::F32(v) => v.to_bits(),
        }
    }

    /// A zero of the given scalar type.
    pub fn zero(scalar: Scalar) -> Self {
        match scalar {
            s if s == Scalar::BOOL => Self::Bool(false),
            s if s == Scalar::U32 => Self::U32(0),
            s if s.is_float() => Self::F32(0.0),
            _ => Self::I32(0),
        }
    }
}

/// A binary operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
}

impl BinaryOp {
    /// Returns `true` for operators producing a boolean.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal | Self::Less | Self::LessEqual | Self::Greater | Self::GreaterEqual
        )
    }
}

/// A built-in math function.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum MathFunction {
    Min,
    Max,
}

/// An expression stored in a function's arena.
///
/// `Literal`, `GlobalVariable` and `LocalVariable` are available everywhere
/// in the function. Every other expression must be covered by a
/// [`Statement::Emit`](super::Statement::Emit) before its first use.
#[derive(Clone, Debug)]
pub enum Expression {
    /// A literal constant.
    Literal(Literal),
    /// One component of the global invocation id.
    GlobalInvocationId(u32),
    /// Reference to a storage buffer (produces a pointer).
    GlobalVariable(Handle<GlobalVariable>),
    /// Reference to a local variable (produces a pointer).
    LocalVariable(Handle<LocalVariable>),
    /// Load a value through a pointer.
    Load { pointer: Handle<Expression> },
    /// Pointer to the `index`-th element of a buffer.
    Access {
        base: Handle<Expression>,
        index: Handle<Expression>,
    },
    /// Apply a binary operator.
    Binary {
        op: BinaryOp,
        left: Handle<Expression>,
        right: Handle<Expression>,
    },
    /// Select between two values based on a condition.
    Select {
        condition: Handle<Expression>,
        accept: Handle<Expression>,
        reject: Handle<Expression>,
    },
    /// Call a built-in math function.
    Math {
        fun: MathFunction,
        arg: Handle<Expression>,
        arg1: Handle<Expression>,
    },
}

impl Expression {
    /// Returns `true` if the expression needs an `Emit` before use.
    pub fn needs_emit(&self) -> bool {
        !matches!(
            self,
            Self::Literal(_) | Self::GlobalVariable(_) | Self::LocalVariable(_)
        )
    }
}
