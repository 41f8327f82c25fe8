//! halo intermediate representation.
//!
//! An arena-based operation graph for the dispatch-region lowering pipeline:
//! operations with typed SSA results, nested regions and named attributes,
//! plus the [`kernel`] hardware-program representation carried by
//! `spv.module` operations.

pub mod arena;
pub mod attr;
mod builder;
mod context;
mod display;
mod error;
pub mod kernel;
mod op;
mod symbol;
mod types;
mod verify;

pub use arena::{Arena, Handle, UniqueArena};
pub use attr::{AffineExpr, AffineMap, Attribute, FunctionType, IteratorType, names};
pub use builder::{InsertionPoint, OpBuilder};
pub use context::{Context, OperationState, ValueMap};
pub use display::{dump, dump_kernel, format_attribute};
pub use error::IrError;
pub use op::{BinaryOp, Block, Location, OpKind, Operation, Region, Value, ValueData, ValueDef};
pub use symbol::SymbolTable;
pub use types::{Bytes, Dimension, Scalar, ScalarKind, Shape, Type};
pub use verify::verify;
