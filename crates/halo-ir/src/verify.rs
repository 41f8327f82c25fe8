//! Structural verification of the operation graph.

use crate::arena::Handle;
use crate::context::Context;
use crate::error::IrError;
use crate::op::{OpKind, Operation};
use crate::types::Dimension;

fn fail(ctx: &Context, op: Handle<Operation>, message: String) -> IrError {
    IrError::Verification {
        location: ctx.op(op).location.clone(),
        message: format!("'{}' {message}", ctx.op(op).kind.name()),
    }
}

/// Kinds whose non-empty blocks must end in a terminator.
fn requires_terminator(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Func
            | OpKind::Reduce
            | OpKind::ReductionRegion
            | OpKind::IndexedGeneric
            | OpKind::For
            | OpKind::Launch
            | OpKind::KernelFunc
    )
}

/// Verifies `root` and everything nested under it.
pub fn verify(ctx: &Context, root: Handle<Operation>) -> Result<(), IrError> {
    for op in ctx.walk(root) {
        verify_op(ctx, op)?;
    }
    Ok(())
}

fn verify_op(ctx: &Context, op: Handle<Operation>) -> Result<(), IrError> {
    let operation = ctx.op(op);

    for (i, &operand) in operation.operands.iter().enumerate() {
        if !ctx.values.contains(operand) {
            return Err(fail(ctx, op, format!("operand #{i} refers to an erased value")));
        }
    }

    if requires_terminator(operation.kind) {
        for &region in &operation.regions {
            for &block in &ctx.regions[region].blocks {
                if !ctx.blocks[block].ops.is_empty() && ctx.terminator(block).is_none() {
                    return Err(fail(ctx, op, "has a block without terminator".into()));
                }
            }
        }
    }

    match operation.kind {
        OpKind::ReductionRegion => {
            if operation.regions.len() != 2 {
                return Err(fail(ctx, op, "expects dispatch and invocation regions".into()));
            }
            let dispatch = ctx.region_block(op, 0)?;
            let arguments = ctx.blocks[dispatch].arguments.len();
            if arguments != operation.operands.len() {
                return Err(fail(
                    ctx,
                    op,
                    format!(
                        "captures {} values but its dispatch body takes {arguments}",
                        operation.operands.len()
                    ),
                ));
            }
            if let Some(term) = ctx.terminator(dispatch) {
                let returned = ctx.op(term).operands.len();
                if returned != operation.results.len() {
                    return Err(fail(
                        ctx,
                        op,
                        format!(
                            "returns {returned} values from its dispatch body but has {} results",
                            operation.results.len()
                        ),
                    ));
                }
            }
        }
        OpKind::ShapeOf => {
            let (Some(&input), Some(&result)) = (operation.operands.first(), operation.results.first())
            else {
                return Err(fail(ctx, op, "expects one operand and one result".into()));
            };
            let Some(rank) = ctx.value_type(input).rank() else {
                return Err(fail(ctx, op, "operand must be shaped".into()));
            };
            let result_ok = ctx.value_type(result).shape().is_some_and(|shape| {
                shape.rank() == 1
                    && match shape.dims[0] {
                        Dimension::Fixed(n) => n as usize == rank,
                        Dimension::Dynamic => true,
                    }
            });
            if !result_ok {
                return Err(fail(
                    ctx,
                    op,
                    format!("result must be a rank-1 buffer of {rank} extents"),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::OpBuilder;
    use crate::context::OperationState;
    use crate::op::Location;
    use crate::types::{Scalar, Type};

    #[test]
    fn shape_of_rank_must_match() {
        let mut ctx = Context::new();
        let block = ctx.module_body();
        let tensor = ctx.intern(Type::tensor(&[2, 3], Scalar::F32));
        let good = ctx.intern(Type::memref(&[2], Scalar::I32));
        let bad = ctx.intern(Type::memref(&[3], Scalar::I32));

        let mut b = OpBuilder::at_end(&mut ctx, block);
        let input = b.value(OpKind::LoadInput, [], tensor);
        b.value(OpKind::ShapeOf, [input], good);
        verify(&ctx, ctx.module()).unwrap();

        let mut b = OpBuilder::at_end(&mut ctx, block);
        b.value(OpKind::ShapeOf, [input], bad);
        let err = verify(&ctx, ctx.module()).unwrap_err();
        assert!(err.to_string().contains("rank-1 buffer of 2 extents"));
    }

    #[test]
    fn erased_operands_are_reported() {
        let mut ctx = Context::new();
        let block = ctx.module_body();
        let index = ctx.intern(Type::Index);
        let mut b = OpBuilder::at_end(&mut ctx, block);
        let c = b.constant_index(4);
        b.value(OpKind::ShapeOf, [c], index);
        let def = ctx.defining_op(c).unwrap();
        ctx.erase_op(def);
        let err = verify(&ctx, ctx.module()).unwrap_err();
        assert!(err.to_string().contains("erased value"));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut ctx = Context::new();
        let func = ctx.create_function(
            "f",
            Default::default(),
            true,
            Location::Unknown,
        );
        let body = ctx.body(func).unwrap();
        let mut b = OpBuilder::at_end(&mut ctx, body);
        b.constant_index(0);
        assert!(verify(&ctx, ctx.module()).is_err());

        let mut b = OpBuilder::at_end(&mut ctx, body);
        b.insert(OperationState::new(OpKind::Return, Location::Unknown));
        verify(&ctx, ctx.module()).unwrap();
    }
}
