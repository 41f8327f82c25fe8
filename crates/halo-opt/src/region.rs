//! Dispatch region construction.

use halo_ir::{
    Attribute, Context, Handle, InsertionPoint, OpBuilder, OpKind, Operation, OperationState,
    Region, Value, ValueMap, names,
};

use crate::PassError;
use crate::utils::calculate_workload;

/// Wraps `root` into a new `flow.reduction_region` inserted right after it.
///
/// The dispatch body receives a clone of `root` whose `operands` and
/// `initial_values` become block arguments. The invocation body is a copy of
/// `invocation` with its return-like terminators rewritten to `flow.return`.
/// Every use of a `root` result is redirected to the matching region result;
/// erasing `root` is left to the caller.
pub fn build_reduction_region(
    ctx: &mut Context,
    root: Handle<Operation>,
    operands: &[Value],
    initial_values: &[Value],
    dimensions: &[i64],
    invocation: Handle<Region>,
) -> Result<Handle<Operation>, PassError> {
    let root_results = ctx.op(root).results.clone();
    let Some(&first) = root_results.first() else {
        return Err(PassError::structural(
            ctx,
            root,
            "cannot compute a workload for an op without results",
        ));
    };
    let workload = calculate_workload(ctx, first);
    let result_types: Vec<_> = root_results.iter().map(|&v| ctx.value_type_handle(v)).collect();
    let location = ctx.op(root).location.clone();

    let state = OperationState::new(OpKind::ReductionRegion, location.clone())
        .operands(operands.iter().chain(initial_values).copied())
        .results(result_types)
        .attr(names::WORKLOAD, Attribute::IntList(workload))
        .attr(names::DIMENSIONS, Attribute::IntList(dimensions.to_vec()))
        .attr(names::NUM_OPERANDS, Attribute::Int(operands.len() as i64))
        .regions(2);
    let Some((block, index)) = ctx.position(root) else {
        return Err(PassError::structural(ctx, root, "root op is not inside a block"));
    };
    let region_op = OpBuilder::new(ctx, InsertionPoint { block, index: index + 1 }).insert(state);

    let (dispatch, invocation_slot) = {
        let regions = &ctx.op(region_op).regions;
        (regions[0], regions[1])
    };

    let dispatch_block = ctx.add_block(dispatch);
    let mut dispatch_map = ValueMap::new();
    for &value in operands.iter().chain(initial_values) {
        let ty = ctx.value_type_handle(value);
        let arg = ctx.add_argument(dispatch_block, ty);
        dispatch_map.insert(value, arg);
    }
    let cloned = ctx.clone_op(root, &mut dispatch_map);
    ctx.append_op(dispatch_block, cloned);
    let cloned_results = ctx.op(cloned).results.clone();
    let mut b = OpBuilder::at_end(ctx, dispatch_block).with_location(location);
    b.terminator(OpKind::FlowReturn, cloned_results);

    let mut invocation_map = ValueMap::new();
    ctx.clone_region_into(invocation, invocation_slot, &mut invocation_map);
    rewrite_returns(ctx, invocation_slot);

    let region_results = ctx.op(region_op).results.clone();
    for (&old, &new) in root_results.iter().zip(&region_results) {
        ctx.replace_all_uses_with(old, new);
    }

    log::debug!(
        "built reduction region {region_op:?} for '{}' with {} captured values",
        ctx.op(root).kind.name(),
        operands.len() + initial_values.len()
    );
    Ok(region_op)
}

/// Replaces every return-like terminator under `region` with `flow.return`.
fn rewrite_returns(ctx: &mut Context, region: Handle<Region>) {
    let mut returns = Vec::new();
    for &block in &ctx.regions[region].blocks {
        for &op in &ctx.blocks[block].ops {
            returns.extend(
                ctx.walk(op)
                    .into_iter()
                    .filter(|&o| ctx.op(o).kind.is_return_like() && ctx.op(o).kind != OpKind::FlowReturn),
            );
        }
    }
    for ret in returns {
        let operands = ctx.op(ret).operands.clone();
        let location = ctx.op(ret).location.clone();
        if let Some(mut b) = OpBuilder::before(ctx, ret) {
            b.set_location(location);
            b.terminator(OpKind::FlowReturn, operands);
        }
        ctx.erase_op(ret);
    }
}
