//! Reduction dispatch region identification.
//!
//! Every `hlo.reduce` at the top level of a function body is wrapped into a
//! `flow.reduction_region`. Candidates are visited from the end of the block
//! toward its start, so the reduction closest to the block end gets its region
//! first.

use std::collections::VecDeque;

use halo_ir::{Block, Context, Handle, OpKind, Operation, names};

use crate::region::build_reduction_region;
use crate::utils::functions;
use crate::{Pass, PassError};

/// Wraps reductions into dispatch regions.
#[derive(Debug)]
pub struct IdentifyReductionRegions;

impl Pass for IdentifyReductionRegions {
    fn name(&self) -> &str {
        "identify-reduction-regions"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut blocks = Vec::new();
        for func in functions(ctx, module)? {
            if let Some(&region) = ctx.op(func).regions.first() {
                blocks.extend(ctx.regions[region].blocks.iter().copied());
            }
        }
        // Every candidate in the module is checked before the first rewrite.
        for &block in &blocks {
            for op in reductions(ctx, block) {
                check_reduce(ctx, op)?;
            }
        }
        let mut changed = false;
        for block in blocks {
            changed |= run_on_block(ctx, block)?;
        }
        Ok(changed)
    }
}

fn reductions(ctx: &Context, block: Handle<Block>) -> Vec<Handle<Operation>> {
    ctx.blocks[block]
        .ops
        .iter()
        .copied()
        .filter(|&op| ctx.op(op).kind == OpKind::Reduce)
        .collect()
}

fn check_reduce(ctx: &Context, op: Handle<Operation>) -> Result<(), PassError> {
    let reduce = ctx.op(op);
    if reduce.operands.len() % 2 != 0 {
        return Err(PassError::structural(
            ctx,
            op,
            format!(
                "reduction expects as many initial values as inputs, got {} operands",
                reduce.operands.len()
            ),
        ));
    }
    if reduce.int_list_attr(names::DIMENSIONS).is_none() {
        return Err(PassError::structural(
            ctx,
            op,
            format!("reduction is missing the '{}' attribute", names::DIMENSIONS),
        ));
    }
    if reduce.results.is_empty() {
        return Err(PassError::structural(ctx, op, "reduction has no results"));
    }
    if reduce.regions.is_empty() {
        return Err(PassError::structural(ctx, op, "reduction has no body"));
    }
    Ok(())
}

fn run_on_block(ctx: &mut Context, block: Handle<Block>) -> Result<bool, PassError> {
    let mut worklist: VecDeque<_> = ctx.blocks[block].ops.iter().rev().copied().collect();
    let mut changed = false;
    while let Some(op) = worklist.pop_front() {
        if !ctx.is_live(op) || ctx.op(op).kind != OpKind::Reduce {
            continue;
        }
        let reduce = ctx.op(op);
        let half = reduce.operands.len() / 2;
        let (inputs, inits) = reduce.operands.split_at(half);
        let (inputs, inits) = (inputs.to_vec(), inits.to_vec());
        let dimensions = reduce
            .int_list_attr(names::DIMENSIONS)
            .map(<[i64]>::to_vec)
            .unwrap_or_default();
        let invocation = match reduce.regions.first() {
            Some(&region) => region,
            None => return Err(PassError::structural(ctx, op, "reduction has no body")),
        };

        let region = build_reduction_region(ctx, op, &inputs, &inits, &dimensions, invocation)?;
        log::debug!(
            "identified reduction region {region:?} at {}",
            ctx.op(op).location
        );
        ctx.erase_op(op);
        changed = true;
    }
    Ok(changed)
}
