//! Statements: side effects and structured control flow.

use crate::arena::Handle;

use super::Expression;

/// A block of statements.
pub type Block = Vec<Statement>;

/// A statement in a kernel function body.
#[derive(Clone, Debug)]
pub enum Statement {
    /// Evaluate the listed expressions at this point, in order.
    Emit(Vec<Handle<Expression>>),
    /// Write a value through a pointer.
    Store {
        pointer: Handle<Expression>,
        value: Handle<Expression>,
    },
    /// Conditional branch.
    If {
        condition: Handle<Expression>,
        accept: Block,
        reject: Block,
    },
    /// Structured loop. `break_if` is evaluated at the end of `continuing`.
    Loop {
        body: Block,
        continuing: Block,
        break_if: Option<Handle<Expression>>,
    },
    /// Break out of the innermost loop.
    Break,
    /// Return from the entry point.
    Return,
}
