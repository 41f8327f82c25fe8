//! Hardware program representation.
//!
//! A compute program in the shape of a shader module: storage buffers bound
//! to descriptor slots, and entry points whose bodies are structured
//! statements over per-function expression arenas. `spv.module` operations
//! carry one of these, and the Vulkan backend serializes it to SPIR-V.

mod expr;
mod global;
mod stmt;

pub use expr::{BinaryOp, Expression, Literal, MathFunction};
pub use global::{GlobalVariable, ResourceBinding, StorageAccess};
pub use stmt::{Block, Statement};

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::types::Scalar;

/// A function-local variable.
#[derive(Clone, Debug)]
pub struct LocalVariable {
    pub name: Option<String>,
    pub scalar: Scalar,
    pub init: Option<Literal>,
}

/// A kernel function body.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Option<String>,
    pub local_variables: Arena<LocalVariable>,
    pub expressions: Arena<Expression>,
    pub body: Block,
}

impl Function {
    /// Creates an empty function with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            local_variables: Arena::new(),
            expressions: Arena::new(),
            body: Vec::new(),
        }
    }

    /// Appends `expr`, recording an emit for it at the end of `block` when needed.
    pub fn push(&mut self, block: &mut Block, expr: Expression) -> Handle<Expression> {
        let needs_emit = expr.needs_emit();
        let handle = self.expressions.append(expr);
        if needs_emit {
            match block.last_mut() {
                Some(Statement::Emit(list)) => list.push(handle),
                _ => block.push(Statement::Emit(vec![handle])),
            }
        }
        handle
    }

    /// Appends an expression that never needs an emit.
    pub fn literal(&mut self, literal: Literal) -> Handle<Expression> {
        self.expressions.append(Expression::Literal(literal))
    }

    /// Declares a local variable and returns a pointer expression to it.
    pub fn local(
        &mut self,
        name: impl Into<String>,
        scalar: Scalar,
        init: Option<Literal>,
    ) -> Handle<Expression> {
        let var = self.local_variables.append(LocalVariable {
            name: Some(name.into()),
            scalar,
            init,
        });
        self.expressions.append(Expression::LocalVariable(var))
    }
}

/// A compute entry point.
#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub name: String,
    /// Workgroup dimensions `[x, y, z]`.
    pub workgroup_size: [u32; 3],
    pub function: Function,
}

/// What a pointer expression points into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerSpace {
    /// A whole storage buffer.
    Buffer,
    /// One element of a storage buffer.
    BufferElement,
    /// A function-local variable.
    Function,
}

/// The type an expression evaluates to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolvedType {
    Value(Scalar),
    Pointer { scalar: Scalar, space: PointerSpace },
}

impl ResolvedType {
    pub fn scalar(self) -> Scalar {
        match self {
            Self::Value(scalar) | Self::Pointer { scalar, .. } => scalar,
        }
    }
}

/// A hardware program: buffers plus compute entry points.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub globals: Arena<GlobalVariable>,
    pub entry_points: Vec<EntryPoint>,
}

impl Module {
    /// Declares a storage buffer.
    pub fn add_buffer(
        &mut self,
        name: impl Into<String>,
        binding: ResourceBinding,
        scalar: Scalar,
        access: StorageAccess,
    ) -> Handle<GlobalVariable> {
        self.globals.append(GlobalVariable {
            name: Some(name.into()),
            binding,
            scalar,
            access,
        })
    }

    /// Finds an entry point by name.
    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|ep| ep.name == name)
    }

    /// Resolves the type of `expr` within `function`.
    pub fn resolve_type(
        &self,
        function: &Function,
        expr: Handle<Expression>,
    ) -> Result<ResolvedType, IrError> {
        let invalid = |message: String| IrError::InvalidKernel {
            function: function.name.clone().unwrap_or_default(),
            message,
        };
        let Some(expression) = function.expressions.try_get(expr) else {
            return Err(invalid(format!("dangling expression {expr:?}")));
        };
        Ok(match *expression {
            Expression::Literal(lit) => ResolvedType::Value(lit.scalar()),
            Expression::GlobalInvocationId(_) => ResolvedType::Value(Scalar::U32),
            Expression::GlobalVariable(var) => {
                let global = self
                    .globals
                    .try_get(var)
                    .ok_or_else(|| invalid(format!("dangling global {var:?}")))?;
                ResolvedType::Pointer {
                    scalar: global.scalar,
                    space: PointerSpace::Buffer,
                }
            }
            Expression::LocalVariable(var) => {
                let local = function
                    .local_variables
                    .try_get(var)
                    .ok_or_else(|| invalid(format!("dangling local {var:?}")))?;
                ResolvedType::Pointer {
                    scalar: local.scalar,
                    space: PointerSpace::Function,
                }
            }
            Expression::Load { pointer } => match self.resolve_type(function, pointer)? {
                ResolvedType::Pointer {
                    scalar,
                    space: PointerSpace::BufferElement | PointerSpace::Function,
                } => ResolvedType::Value(scalar),
                other => return Err(invalid(format!("cannot load through {other:?}"))),
            },
            Expression::Access { base, .. } => match self.resolve_type(function, base)? {
                ResolvedType::Pointer {
                    scalar,
                    space: PointerSpace::Buffer,
                } => ResolvedType::Pointer {
                    scalar,
                    space: PointerSpace::BufferElement,
                },
                other => return Err(invalid(format!("cannot index into {other:?}"))),
            },
            Expression::Binary { op, left, .. } => {
                if op.is_comparison() || op == BinaryOp::LogicalAnd {
                    ResolvedType::Value(Scalar::BOOL)
                } else {
                    ResolvedType::Value(self.resolve_type(function, left)?.scalar())
                }
            }
            Expression::Select { accept, .. } => self.resolve_type(function, accept)?,
            Expression::Math { arg, .. } => self.resolve_type(function, arg)?,
        })
    }
}
