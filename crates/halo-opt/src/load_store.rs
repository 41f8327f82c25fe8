//! Local load/store data-flow optimization.
//!
//! A `mem.store` of a value produced by a `mem.load` is replaced with a single
//! `mem.copy` between the two buffers.

use halo_ir::{
    Context, Handle, OpBuilder, OpKind, Operation, OperationState, Scalar, Type, Value,
};

use crate::utils::functions;
use crate::{Pass, PassError};

/// Fuses `mem.load` + `mem.store` pairs into `mem.copy`.
#[derive(Debug)]
pub struct LoadStoreDataFlowOpt;

impl Pass for LoadStoreDataFlowOpt {
    fn name(&self) -> &str {
        "load-store-data-flow-opt"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut pairs = Vec::new();
        for func in functions(ctx, module)? {
            pairs.extend(collect_pairs(ctx, func));
        }
        if pairs.is_empty() {
            return Ok(false);
        }

        // Every pair in the module is checked before the first copy is inserted.
        for pair in &pairs {
            check_indices(ctx, pair.load, 1)?;
            check_indices(ctx, pair.store, 2)?;
        }

        for pair in &pairs {
            insert_copy(ctx, pair);
        }

        // Stores go first so the loads they read become dead.
        for pair in &pairs {
            ctx.erase_op(pair.store);
        }
        for pair in &pairs {
            if ctx.is_live(pair.load) && !ctx.has_uses(ctx.result(pair.load, 0)) {
                ctx.erase_op(pair.load);
            }
        }
        log::debug!("fused {} load/store pairs into copies", pairs.len());
        Ok(true)
    }
}

/// A store whose value comes straight from a load.
struct Pair {
    load: Handle<Operation>,
    store: Handle<Operation>,
}

fn collect_pairs(ctx: &Context, func: Handle<Operation>) -> Vec<Pair> {
    ctx.collect_kind(func, OpKind::Store)
        .into_iter()
        .filter_map(|store| {
            let value = *ctx.op(store).operands.first()?;
            let load = ctx.defining_op(value)?;
            (ctx.op(load).kind == OpKind::Load).then_some(Pair { load, store })
        })
        .collect()
}

/// Checks that `op` has its `leading` operands followed by at most one index.
fn check_indices(ctx: &Context, op: Handle<Operation>, leading: usize) -> Result<(), PassError> {
    let Some(indices) = ctx.op(op).operands.get(leading..) else {
        return Err(PassError::structural(
            ctx,
            op,
            format!("expected at least {leading} operands"),
        ));
    };
    if indices.len() > 1 {
        return Err(PassError::unsupported(
            ctx,
            op,
            format!("copy fusion of {} indices is not implemented", indices.len()),
        ));
    }
    Ok(())
}

/// The index buffer addressing `indices`: `[0]` when there are none.
fn index_buffer(b: &mut OpBuilder<'_>, indices: &[Value]) -> Value {
    match indices {
        [index] => *index,
        _ => b.index_buffer(vec![0]),
    }
}

/// Element count of `value` per dimension.
fn lengths(b: &mut OpBuilder<'_>, value: Value) -> Value {
    let Some(shape) = b.ctx.value_type(value).shape().cloned() else {
        return b.index_buffer(vec![1]);
    };
    match shape.static_dims() {
        Some(dims) if dims.is_empty() => b.index_buffer(vec![1]),
        Some(dims) => b.index_buffer(dims),
        None => {
            let ty = b
                .ctx
                .intern(Type::memref(&[shape.rank() as u32], Scalar::I32));
            b.value(OpKind::ShapeOf, [value], ty)
        }
    }
}

fn insert_copy(ctx: &mut Context, pair: &Pair) {
    let load = ctx.op(pair.load).clone();
    let store = ctx.op(pair.store).clone();
    let Some(mut b) = OpBuilder::before(ctx, pair.store) else {
        return;
    };
    b.set_location(store.location.clone());
    let src_indices = index_buffer(&mut b, &load.operands[1..]);
    let dst_indices = index_buffer(&mut b, &store.operands[2..]);
    let lengths = lengths(&mut b, store.operands[0]);
    b.insert(
        OperationState::new(OpKind::Copy, store.location)
            .operands([load.operands[0], src_indices, store.operands[1], dst_indices, lengths]),
    );
}
