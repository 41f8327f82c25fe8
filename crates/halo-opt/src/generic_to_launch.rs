//! `linalg.indexed_generic` to `gpu.launch` loop nests.
//!
//! The launch captures the arguments of the enclosing dispatch function in
//! order. Loop dimension 0 is distributed over `gpu.global_id` x: each
//! invocation runs a single guarded trip starting at its id. The remaining
//! dimensions run sequentially inside it.

use halo_ir::{
    AffineExpr, AffineMap, Attribute, Context, Handle, InsertionPoint, OpBuilder, OpKind,
    Operation, OperationState, Type, Value, ValueMap, names,
};

use crate::utils::{functions, is_dispatch_function};
use crate::{Pass, PassError};

/// Lowers generic ops of dispatch functions into launches.
#[derive(Debug)]
pub struct GenericToLaunch;

impl Pass for GenericToLaunch {
    fn name(&self) -> &str {
        "generic-to-launch"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut changed = false;
        for func in functions(ctx, module)? {
            if !is_dispatch_function(ctx, func) || ctx.is_declaration(func) {
                continue;
            }
            for generic in ctx.collect_kind(func, OpKind::IndexedGeneric) {
                let plan = plan(ctx, func, generic)?;
                lower(ctx, func, generic, &plan)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Everything needed to rewrite one generic op, checked before mutation.
struct Plan {
    maps: Vec<AffineMap>,
    bounds: Vec<i64>,
    num_inputs: usize,
    /// Per operand: rank of the buffer it addresses.
    ranks: Vec<usize>,
}

fn plan(ctx: &Context, func: Handle<Operation>, generic: Handle<Operation>) -> Result<Plan, PassError> {
    let op = ctx.op(generic);
    let args = ctx.arguments(func)?;
    let maps = op
        .attr(names::INDEXING_MAPS)
        .and_then(Attribute::as_affine_maps)
        .ok_or_else(|| PassError::structural(ctx, generic, "generic op has no indexing maps"))?
        .to_vec();
    if maps.len() != op.operands.len() {
        return Err(PassError::structural(
            ctx,
            generic,
            format!("{} indexing maps for {} operands", maps.len(), op.operands.len()),
        ));
    }
    let num_inputs = op
        .int_attr(names::ARGS_IN)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n <= op.operands.len())
        .ok_or_else(|| PassError::structural(ctx, generic, "generic op has a malformed args_in"))?;
    let num_dims = maps.first().map_or(0, |m| m.num_dims) as usize;

    let mut shapes = Vec::with_capacity(op.operands.len());
    for (i, &operand) in op.operands.iter().enumerate() {
        if !args.contains(&operand) {
            return Err(PassError::unsupported(
                ctx,
                generic,
                format!("operand #{i} is not an argument of the dispatch function"),
            ));
        }
        let dims = ctx
            .value_type(operand)
            .shape()
            .and_then(|s| s.static_dims())
            .ok_or_else(|| {
                PassError::unsupported(ctx, generic, format!("operand #{i} has no static shape"))
            })?;
        let map = &maps[i];
        if map.num_dims as usize != num_dims || (!dims.is_empty() && map.rank() != dims.len()) {
            return Err(PassError::structural(
                ctx,
                generic,
                format!("indexing map #{i} does not match its operand"),
            ));
        }
        shapes.push(dims);
    }

    let mut bounds = Vec::with_capacity(num_dims);
    for dim in 0..num_dims as u32 {
        let bound = maps.iter().zip(&shapes).find_map(|(map, dims)| {
            map.results
                .iter()
                .position(|&e| e == AffineExpr::Dim(dim))
                .and_then(|k| dims.get(k).copied())
        });
        let bound = bound.ok_or_else(|| {
            PassError::unsupported(ctx, generic, format!("unable to bound loop dimension {dim}"))
        })?;
        bounds.push(bound);
    }
    for (i, (map, dims)) in maps.iter().zip(&shapes).enumerate() {
        for (k, (expr, &extent)) in map.results.iter().zip(dims).enumerate() {
            if let AffineExpr::Dim(d) = *expr {
                let Some(&bound) = bounds.get(d as usize) else {
                    return Err(PassError::structural(
                        ctx,
                        generic,
                        format!("indexing map #{i} refers to unknown loop d{d}"),
                    ));
                };
                if bound != extent {
                    return Err(PassError::structural(
                        ctx,
                        generic,
                        format!(
                            "operand #{i} has extent {extent} in dimension {k}, \
                             but loop d{d} runs {bound} times"
                        ),
                    ));
                }
            }
        }
    }

    Ok(Plan {
        ranks: shapes.iter().map(Vec::len).collect(),
        maps,
        bounds,
        num_inputs,
    })
}

/// Creates `loop.for %lb, %ub, %step` at the builder's point and moves the
/// builder inside it, before its `loop.yield`. Returns the induction variable.
fn build_for(b: &mut OpBuilder<'_>, lb: Value, ub: Value, step: Value) -> Value {
    let index_ty = b.ctx.intern(Type::Index);
    let for_op = b.insert(
        OperationState::new(OpKind::For, b.location())
            .operands([lb, ub, step])
            .regions(1),
    );
    let region = b.ctx.op(for_op).regions[0];
    let body = b.ctx.add_block(region);
    let iv = b.ctx.add_argument(body, index_ty);
    b.set_insertion_point(InsertionPoint { block: body, index: 0 });
    b.terminator(OpKind::LoopYield, []);
    b.set_insertion_point(InsertionPoint { block: body, index: 0 });
    iv
}

fn lower(
    ctx: &mut Context,
    func: Handle<Operation>,
    generic: Handle<Operation>,
    plan: &Plan,
) -> Result<(), PassError> {
    let args = ctx.arguments(func)?;
    let arg_types: Vec<_> = args.iter().map(|&a| ctx.value_type_handle(a)).collect();
    let operands = ctx.op(generic).operands.clone();
    let location = ctx.op(generic).location.clone();
    let Some((block, index)) = ctx.position(generic) else {
        return Err(PassError::structural(ctx, generic, "generic op is detached"));
    };

    let launch = OpBuilder::new(ctx, InsertionPoint { block, index }).insert(
        OperationState::new(OpKind::Launch, location.clone())
            .operands(args.iter().copied())
            .regions(1),
    );
    let launch_region = ctx.op(launch).regions[0];
    let launch_body = ctx.add_block(launch_region);
    let mut captured = ValueMap::new();
    for (&arg, &ty) in args.iter().zip(&arg_types) {
        let inner = ctx.add_argument(launch_body, ty);
        captured.insert(arg, inner);
    }
    let buffers: Vec<_> = operands.iter().map(|&v| captured.lookup_or_default(v)).collect();

    let index_ty = ctx.intern(Type::Index);
    let mut b = OpBuilder::at_end(ctx, launch_body).with_location(location.clone());
    b.terminator(OpKind::LaunchTerminator, []);
    b.set_insertion_point(InsertionPoint {
        block: launch_body,
        index: 0,
    });
    let gid = {
        let state = OperationState::new(OpKind::GlobalId, location.clone())
            .attr(names::DIMENSION, Attribute::Int(0))
            .results([index_ty]);
        let op = b.insert(state);
        b.ctx.result(op, 0)
    };

    let mut ivs = Vec::with_capacity(plan.bounds.len());
    match plan.bounds.split_first() {
        None => {
            let one = b.constant_index(1);
            build_for(&mut b, gid, one, one);
        }
        Some((&outer, inner)) => {
            let ub = b.constant_index(outer);
            ivs.push(build_for(&mut b, gid, ub, ub));
            for &bound in inner {
                let lb = b.constant_index(0);
                let ub = b.constant_index(bound);
                let step = b.constant_index(1);
                ivs.push(build_for(&mut b, lb, ub, step));
            }
        }
    }

    let mut indices = Vec::with_capacity(buffers.len());
    for (map, &rank) in plan.maps.iter().zip(&plan.ranks) {
        let mut operand_indices = Vec::with_capacity(rank);
        if rank > 0 {
            for expr in &map.results {
                operand_indices.push(match *expr {
                    AffineExpr::Dim(d) => ivs[d as usize],
                    AffineExpr::Const(c) => b.constant_index(c),
                });
            }
        }
        indices.push(operand_indices);
    }

    let mut body_map = ValueMap::new();
    let generic_body = b.ctx.body(generic)?;
    let generic_args = b.ctx.blocks[generic_body].arguments.clone();
    for (&arg, &iv) in generic_args.iter().zip(&ivs) {
        body_map.insert(arg, iv);
    }
    for (i, (&buffer, operand_indices)) in buffers.iter().zip(&indices).enumerate() {
        let Some(&arg) = generic_args.get(ivs.len() + i) else {
            break;
        };
        // Outputs the body never reads stay write-only.
        if !b.ctx.has_uses(arg) {
            continue;
        }
        let element = b.ctx.value_type_handle(arg);
        let loaded = b.value(
            OpKind::Load,
            std::iter::once(buffer).chain(operand_indices.iter().copied()),
            element,
        );
        body_map.insert(arg, loaded);
    }

    let mut yielded = Vec::new();
    for op in b.ctx.blocks[generic_body].ops.clone() {
        if b.ctx.op(op).kind == OpKind::Yield {
            yielded = b
                .ctx
                .op(op)
                .operands
                .iter()
                .map(|&v| body_map.lookup_or_default(v))
                .collect();
            continue;
        }
        let cloned = b.ctx.clone_op(op, &mut body_map);
        let point = b.insertion_point();
        b.ctx.insert_op(point.block, point.index, cloned);
        b.set_insertion_point(InsertionPoint {
            block: point.block,
            index: point.index + 1,
        });
    }
    for (value, (&buffer, operand_indices)) in yielded
        .into_iter()
        .zip(buffers.iter().zip(&indices).skip(plan.num_inputs))
    {
        b.insert(
            OperationState::new(OpKind::Store, location.clone()).operands(
                [value, buffer]
                    .into_iter()
                    .chain(operand_indices.iter().copied()),
            ),
        );
    }

    ctx.erase_op(generic);
    log::debug!(
        "lowered generic in '{}' to a launch over {:?}",
        ctx.op(func).sym_name().unwrap_or_default(),
        plan.bounds
    );
    Ok(())
}
