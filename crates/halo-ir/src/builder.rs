//! Insertion-point based operation builder.

use crate::arena::Handle;
use crate::attr::{Attribute, names};
use crate::context::{Context, OperationState};
use crate::op::{Block, Location, OpKind, Operation, Value};
use crate::types::{Scalar, Type};

/// A position inside a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InsertionPoint {
    pub block: Handle<Block>,
    pub index: usize,
}

/// Creates operations at a moving insertion point.
pub struct OpBuilder<'a> {
    pub ctx: &'a mut Context,
    point: InsertionPoint,
    location: Location,
}

impl<'a> OpBuilder<'a> {
    pub fn new(ctx: &'a mut Context, point: InsertionPoint) -> Self {
        Self {
            ctx,
            point,
            location: Location::Unknown,
        }
    }

    /// Inserts at the end of `block`.
    pub fn at_end(ctx: &'a mut Context, block: Handle<Block>) -> Self {
        let index = ctx.blocks[block].ops.len();
        Self::new(ctx, InsertionPoint { block, index })
    }

    /// Inserts right before `op`.
    pub fn before(ctx: &'a mut Context, op: Handle<Operation>) -> Option<Self> {
        let (block, index) = ctx.position(op)?;
        Some(Self::new(ctx, InsertionPoint { block, index }))
    }

    /// Inserts right after `op`.
    pub fn after(ctx: &'a mut Context, op: Handle<Operation>) -> Option<Self> {
        let (block, index) = ctx.position(op)?;
        Some(Self::new(ctx, InsertionPoint {
            block,
            index: index + 1,
        }))
    }

    /// Location given to ops created by the convenience helpers.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub fn location(&self) -> Location {
        self.location.clone()
    }

    pub fn insertion_point(&self) -> InsertionPoint {
        self.point
    }

    pub fn set_insertion_point(&mut self, point: InsertionPoint) {
        self.point = point;
    }

    /// Creates an op and inserts it at the current point.
    pub fn insert(&mut self, state: OperationState) -> Handle<Operation> {
        let op = self.ctx.create_op(state);
        self.ctx.insert_op(self.point.block, self.point.index, op);
        self.point.index += 1;
        op
    }

    /// Creates a single-result op and returns its result.
    pub fn value(
        &mut self,
        kind: OpKind,
        operands: impl IntoIterator<Item = Value>,
        ty: Handle<Type>,
    ) -> Value {
        let state = OperationState::new(kind, self.location.clone())
            .operands(operands)
            .results([ty]);
        let op = self.insert(state);
        self.ctx.result(op, 0)
    }

    /// `arith.index` with the given value.
    pub fn constant_index(&mut self, value: i64) -> Value {
        let ty = self.ctx.intern(Type::Index);
        let state = OperationState::new(OpKind::ConstantIndex, self.location.clone())
            .attr(names::VALUE, Attribute::Int(value))
            .results([ty]);
        let op = self.insert(state);
        self.ctx.result(op, 0)
    }

    /// `arith.constant` of a scalar type.
    pub fn constant(&mut self, value: Attribute, scalar: Scalar) -> Value {
        let ty = self.ctx.intern(Type::Scalar(scalar));
        let state = OperationState::new(OpKind::Constant, self.location.clone())
            .attr(names::VALUE, value)
            .results([ty]);
        let op = self.insert(state);
        self.ctx.result(op, 0)
    }

    /// `mem.index_buffer` holding `values`.
    pub fn index_buffer(&mut self, values: Vec<i64>) -> Value {
        let ty = self
            .ctx
            .intern(Type::memref(&[values.len() as u32], Scalar::I32));
        let state = OperationState::new(OpKind::IndexBuffer, self.location.clone())
            .attr(names::VALUE, Attribute::IntList(values))
            .results([ty]);
        let op = self.insert(state);
        self.ctx.result(op, 0)
    }

    /// A terminator of the given kind returning `values`.
    pub fn terminator(
        &mut self,
        kind: OpKind,
        values: impl IntoIterator<Item = Value>,
    ) -> Handle<Operation> {
        let state = OperationState::new(kind, self.location.clone()).operands(values);
        self.insert(state)
    }
}
