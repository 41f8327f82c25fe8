//! Incremental construction of kernel functions.
//!
//! Expressions are pushed into the innermost open block, so structured
//! statements are built by opening a block, filling it and closing it into
//! an `If` or `Loop`.

use halo_ir::kernel::{
    self, BinaryOp, Expression, Function, GlobalVariable, Literal, MathFunction, Statement,
};
use halo_ir::{Attribute, Handle, Scalar, ScalarKind};

type Expr = Handle<Expression>;

/// A counted loop opened by [`FunctionBuilder::begin_loop`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct CountedLoop {
    counter: Expr,
    /// The loop index, valid inside the loop body.
    pub index: Expr,
}

pub(crate) struct FunctionBuilder {
    function: Function,
    /// Open blocks, outermost first. The first one is the function body.
    blocks: Vec<kernel::Block>,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            function: Function::new(name),
            blocks: vec![Vec::new()],
        }
    }

    fn expr(&mut self, expr: Expression) -> Expr {
        match self.blocks.last_mut() {
            Some(block) => self.function.push(block, expr),
            None => self.function.expressions.append(expr),
        }
    }

    fn statement(&mut self, statement: Statement) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(statement);
        }
    }

    fn open(&mut self) {
        self.blocks.push(Vec::new());
    }

    fn close(&mut self) -> kernel::Block {
        if self.blocks.len() > 1 {
            self.blocks.pop().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    pub fn literal(&mut self, literal: Literal) -> Expr {
        self.function.literal(literal)
    }

    pub fn u32(&mut self, value: u32) -> Expr {
        self.literal(Literal::U32(value))
    }

    pub fn global(&mut self, var: Handle<GlobalVariable>) -> Expr {
        self.function
            .expressions
            .append(Expression::GlobalVariable(var))
    }

    pub fn global_id(&mut self, axis: u32) -> Expr {
        self.expr(Expression::GlobalInvocationId(axis))
    }

    pub fn local(&mut self, name: &str, scalar: Scalar, init: Option<Literal>) -> Expr {
        self.function.local(name, scalar, init)
    }

    pub fn load(&mut self, pointer: Expr) -> Expr {
        self.expr(Expression::Load { pointer })
    }

    /// Pointer to element `index` of a buffer.
    pub fn element(&mut self, buffer: Expr, index: Expr) -> Expr {
        self.expr(Expression::Access {
            base: buffer,
            index,
        })
    }

    pub fn binary(&mut self, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        self.expr(Expression::Binary { op, left, right })
    }

    pub fn select(&mut self, condition: Expr, accept: Expr, reject: Expr) -> Expr {
        self.expr(Expression::Select {
            condition,
            accept,
            reject,
        })
    }

    pub fn math(&mut self, fun: MathFunction, arg: Expr, arg1: Expr) -> Expr {
        self.expr(Expression::Math { fun, arg, arg1 })
    }

    /// Scalar arithmetic of the graph-level op set.
    pub fn arith(&mut self, op: halo_ir::BinaryOp, left: Expr, right: Expr) -> Expr {
        use halo_ir::BinaryOp as Op;
        match op {
            Op::Add => self.binary(BinaryOp::Add, left, right),
            Op::Sub => self.binary(BinaryOp::Subtract, left, right),
            Op::Mul => self.binary(BinaryOp::Multiply, left, right),
            Op::Div => self.binary(BinaryOp::Divide, left, right),
            Op::Min => self.math(MathFunction::Min, left, right),
            Op::Max => self.math(MathFunction::Max, left, right),
        }
    }

    /// Row-major offset of `indices` into a buffer of extents `dims`.
    pub fn linearize(&mut self, indices: &[Expr], dims: &[u32]) -> Expr {
        let Some((&first, rest)) = indices.split_first() else {
            return self.u32(0);
        };
        let mut offset = first;
        for (&index, &extent) in rest.iter().zip(dims.iter().skip(1)) {
            let extent = self.u32(extent);
            let scaled = self.binary(BinaryOp::Multiply, offset, extent);
            offset = self.binary(BinaryOp::Add, scaled, index);
        }
        offset
    }

    pub fn store(&mut self, pointer: Expr, value: Expr) {
        self.statement(Statement::Store { pointer, value });
    }

    /// Starts the accept block of an `If`.
    pub fn begin_if(&mut self) {
        self.open();
    }

    /// Closes the accept block opened by [`begin_if`](Self::begin_if).
    pub fn end_if(&mut self, condition: Expr) {
        let accept = self.close();
        self.statement(Statement::If {
            condition,
            accept,
            reject: Vec::new(),
        });
    }

    /// Opens `for (i = start; i < end; ...)` over `u32`.
    pub fn begin_loop(&mut self, name: &str, start: Expr, end: Expr) -> CountedLoop {
        let counter = self.local(name, Scalar::U32, None);
        self.store(counter, start);
        self.open();
        let index = self.load(counter);
        let done = self.binary(BinaryOp::GreaterEqual, index, end);
        self.open();
        self.statement(Statement::Break);
        self.end_if(done);
        CountedLoop { counter, index }
    }

    /// Closes a loop, advancing its counter by `step`.
    pub fn end_loop(&mut self, counted: CountedLoop, step: Expr) {
        let body = self.close();
        self.open();
        let current = self.load(counted.counter);
        let next = self.binary(BinaryOp::Add, current, step);
        self.store(counted.counter, next);
        let continuing = self.close();
        self.statement(Statement::Loop {
            body,
            continuing,
            break_if: None,
        });
    }

    pub fn finish(mut self) -> Function {
        self.blocks.truncate(1);
        self.function.body = self.blocks.pop().unwrap_or_default();
        self.function
    }
}

/// The literal of `scalar` type held by a constant attribute.
pub(crate) fn literal_for(scalar: Scalar, value: &Attribute) -> Option<Literal> {
    match (scalar.kind, value) {
        (ScalarKind::Float, Attribute::Float(v)) if scalar.width == 4 => Some(Literal::F32(*v as f32)),
        (ScalarKind::Float, Attribute::Int(v)) if scalar.width == 4 => Some(Literal::F32(*v as f32)),
        (ScalarKind::Sint, Attribute::Int(v)) => i32::try_from(*v).ok().map(Literal::I32),
        (ScalarKind::Uint, Attribute::Int(v)) => u32::try_from(*v).ok().map(Literal::U32),
        (ScalarKind::Bool, Attribute::Bool(v)) => Some(Literal::Bool(*v)),
        (ScalarKind::Bool, Attribute::Int(v)) => Some(Literal::Bool(*v != 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_loop_shape() {
        let mut fb = FunctionBuilder::new("k");
        let zero = fb.u32(0);
        let end = fb.u32(4);
        let one = fb.u32(1);
        let lp = fb.begin_loop("i", zero, end);
        let _ = fb.binary(BinaryOp::Multiply, lp.index, end);
        fb.end_loop(lp, one);
        let function = fb.finish();

        assert_eq!(function.local_variables.len(), 1);
        match function.body.as_slice() {
            [Statement::Store { .. }, Statement::Loop { body, continuing, break_if: None }] => {
                assert!(matches!(body[0], Statement::Emit(_)));
                assert!(matches!(body[1], Statement::If { .. }));
                assert!(matches!(continuing.last(), Some(Statement::Store { .. })));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn linearize_row_major() {
        let mut fb = FunctionBuilder::new("k");
        let i = fb.u32(1);
        let j = fb.u32(2);
        let offset = fb.linearize(&[i, j], &[3, 5]);
        let function = fb.finish();
        assert!(matches!(
            function.expressions[offset],
            Expression::Binary { op: BinaryOp::Add, .. }
        ));

        let mut fb = FunctionBuilder::new("k");
        let scalar = fb.linearize(&[], &[]);
        let function = fb.finish();
        assert!(matches!(function.expressions[scalar], Expression::Literal(Literal::U32(0))));
    }

    #[test]
    fn literals_follow_the_scalar_type() {
        assert_eq!(literal_for(Scalar::F32, &Attribute::Float(1.5)), Some(Literal::F32(1.5)));
        assert_eq!(literal_for(Scalar::I32, &Attribute::Int(-2)), Some(Literal::I32(-2)));
        assert_eq!(literal_for(Scalar::U32, &Attribute::Int(-2)), None);
        assert_eq!(literal_for(Scalar::F16, &Attribute::Float(1.0)), None);
    }
}
