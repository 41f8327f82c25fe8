//! Operand and shape utilities shared by the lowering passes.

use halo_ir::{Attribute, Block, Context, Dimension, Handle, OpKind, Operation, Type, Value, names};

use crate::PassError;

/// `func.func` ops defined directly in `module`.
pub fn functions(ctx: &Context, module: Handle<Operation>) -> Result<Vec<Handle<Operation>>, PassError> {
    let block = ctx.body(module)?;
    Ok(ctx.blocks[block]
        .ops
        .iter()
        .copied()
        .filter(|&op| ctx.op(op).kind == OpKind::Func)
        .collect())
}

/// Returns `true` if `func` is exported as a dispatch entry.
pub fn is_dispatch_function(ctx: &Context, func: Handle<Operation>) -> bool {
    ctx.op(func).has_attr(names::EXPORT)
}

/// Returns `true` if `func` is a reduction entry.
pub fn is_reduction_function(ctx: &Context, func: Handle<Operation>) -> bool {
    ctx.op(func).has_attr(names::REDUCTION)
}

/// The only block of `func`, rejecting multi-block bodies.
pub fn single_block(ctx: &Context, func: Handle<Operation>) -> Result<Handle<Block>, PassError> {
    let region = ctx
        .op(func)
        .regions
        .first()
        .copied()
        .ok_or_else(|| PassError::structural(ctx, func, "function has no body region"))?;
    match ctx.regions[region].blocks.as_slice() {
        [block] => Ok(*block),
        [] => Err(PassError::structural(ctx, func, "function has no body")),
        _ => Err(PassError::structural(
            ctx,
            func,
            "unhandled multiple blocks within dispatch function",
        )),
    }
}

/// Drops trailing 1s, always keeping the first element.
pub fn drop_trailing_ones(values: &[i64]) -> &[i64] {
    let mut end = values.len();
    while end > 1 && values[end - 1] == 1 {
        end -= 1;
    }
    &values[..end]
}

fn element_count(extent: &[i64]) -> i64 {
    extent.iter().product()
}

/// Extent of the value stored by a `mem.store_output`/`mem.store_reduce`,
/// innermost dimension first.
fn store_extent(ctx: &Context, store: Handle<Operation>) -> Result<Vec<i64>, PassError> {
    let value = *ctx
        .op(store)
        .operands
        .first()
        .ok_or_else(|| PassError::structural(ctx, store, "store has no value operand"))?;
    match ctx.value_type(value) {
        Type::Scalar(_) => Ok(vec![1]),
        ty => {
            let dims = ty.shape().and_then(|s| s.static_dims()).ok_or_else(|| {
                PassError::structural(ctx, store, "unable to extract domain size from store operation")
            })?;
            if dims.is_empty() {
                Ok(vec![1])
            } else {
                Ok(dims.into_iter().rev().collect())
            }
        }
    }
}

/// Iteration domain of a dispatch function, derived from its output stores.
///
/// Every store must cover the same number of elements as the first one.
pub fn launch_size(ctx: &Context, func: Handle<Operation>) -> Result<Vec<i64>, PassError> {
    let block = single_block(ctx, func)?;
    let ops = &ctx.blocks[block].ops;
    let stores: Vec<_> = ops
        .iter()
        .copied()
        .filter(|&op| ctx.op(op).kind == OpKind::StoreOutput)
        .chain(
            ops.iter()
                .copied()
                .filter(|&op| ctx.op(op).kind == OpKind::StoreReduce),
        )
        .collect();
    let Some((&first, rest)) = stores.split_first() else {
        return Err(PassError::structural(
            ctx,
            func,
            "expected dispatch function to have at least one mem.store_output",
        ));
    };
    let launch = store_extent(ctx, first)?;
    for &store in rest {
        let extent = store_extent(ctx, store)?;
        if element_count(&extent) != element_count(&launch) {
            return Err(PassError::structural(
                ctx,
                store,
                "mismatch in shapes of the output tensors",
            ));
        }
    }
    Ok(launch)
}

/// The `executable.workgroup_size` of a dispatch function.
pub fn workgroup_size(ctx: &Context, func: Handle<Operation>) -> Result<[u32; 3], PassError> {
    if !is_dispatch_function(ctx, func) {
        return Err(PassError::structural(
            ctx,
            func,
            "expected operation to be in dispatch function to get launch size",
        ));
    }
    let values = ctx
        .op(func)
        .int_list_attr(names::EXECUTABLE_WORKGROUP_SIZE)
        .ok_or_else(|| {
            PassError::structural(
                ctx,
                func,
                format!(
                    "unable to find workgroup size, missing attribute {} in dispatch function",
                    names::EXECUTABLE_WORKGROUP_SIZE
                ),
            )
        })?;
    match values {
        &[x, y, z] if [x, y, z].iter().all(|&v| v > 0 && v <= i64::from(u32::MAX)) => {
            Ok([x as u32, y as u32, z as u32])
        }
        _ => Err(PassError::structural(
            ctx,
            func,
            format!("malformed workgroup size {values:?}"),
        )),
    }
}

/// Sets the `executable.workgroup_size` of `func`.
pub fn set_workgroup_size(ctx: &mut Context, func: Handle<Operation>, size: [u32; 3]) {
    ctx.op_mut(func).set_attr(
        names::EXECUTABLE_WORKGROUP_SIZE,
        Attribute::IntList(size.iter().map(|&v| i64::from(v)).collect()),
    );
}

/// Three-component workload of a shaped value, innermost dimension first.
///
/// Ranks above three fold into the last component; dynamic extents are -1.
pub fn calculate_workload(ctx: &Context, value: Value) -> Vec<i64> {
    let mut extents: Vec<i64> = ctx
        .value_type(value)
        .shape()
        .map(|shape| {
            shape
                .dims
                .iter()
                .rev()
                .map(|d| match d {
                    Dimension::Fixed(n) => i64::from(*n),
                    Dimension::Dynamic => -1,
                })
                .collect()
        })
        .unwrap_or_default();
    while extents.len() > 3 {
        let Some(outer) = extents.pop() else { break };
        let last = &mut extents[2];
        *last = if *last < 0 || outer < 0 { -1 } else { *last * outer };
    }
    extents.resize(3, 1);
    extents
}
