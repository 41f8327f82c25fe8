//! Reduction entry functions to `linalg.indexed_generic`.
//!
//! A reduction entry function `(src, init, dst)` is declared without a body
//! and names a scalar apply function. The lowering iterates over the source
//! with the reduced dimension moved innermost, seeds the accumulator from the
//! initial value on the first step of that loop, and inlines the apply
//! function as the per-element update.

use std::collections::BTreeSet;

use halo_ir::{
    AffineExpr, AffineMap, Attribute, BinaryOp, Context, FunctionType, Handle, IteratorType,
    OpBuilder, OpKind, Operation, OperationState, Scalar, SymbolTable, Type, ValueMap, names,
};

use crate::utils::{functions, is_reduction_function};
use crate::{Pass, PassError};

/// Synthesizes bodies for reduction entry functions.
#[derive(Debug)]
pub struct ReductionToGeneric;

impl Pass for ReductionToGeneric {
    fn name(&self) -> &str {
        "reduction-to-generic"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let symbols = SymbolTable::build(ctx, module)?;
        let mut entries = Vec::new();
        let mut applies = BTreeSet::new();
        for func in functions(ctx, module)? {
            if !is_reduction_function(ctx, func) {
                continue;
            }
            let apply = apply_function(ctx, &symbols, func)?;
            entries.push((func, apply));
            applies.insert(apply);
        }
        if entries.is_empty() {
            return Ok(false);
        }

        for &apply in &applies {
            convert_apply_function(ctx, apply)?;
        }
        for &(entry, apply) in &entries {
            if ctx.is_declaration(entry) {
                build_entry_body(ctx, entry, apply)?;
            }
        }
        for apply in applies {
            log::debug!(
                "erasing inlined apply function '{}'",
                ctx.op(apply).sym_name().unwrap_or_default()
            );
            ctx.erase_op(apply);
        }
        Ok(true)
    }
}

fn apply_function(
    ctx: &Context,
    symbols: &SymbolTable,
    entry: Handle<Operation>,
) -> Result<Handle<Operation>, PassError> {
    let name = ctx
        .op(entry)
        .symbol_attr(names::REDUCTION_APPLY)
        .ok_or_else(|| {
            PassError::structural(
                ctx,
                entry,
                format!("reduction entry is missing '{}'", names::REDUCTION_APPLY),
            )
        })?;
    symbols
        .lookup(name)
        .filter(|&op| ctx.op(op).kind == OpKind::Func)
        .ok_or_else(|| {
            PassError::structural(ctx, entry, format!("can't find the apply function '{name}'"))
        })
}

/// Element type of an apply-function operand: rank-0 tensors and scalars only.
fn scalar_of(ty: &Type) -> Option<Scalar> {
    match ty {
        Type::Scalar(scalar) => Some(*scalar),
        Type::Tensor { shape, scalar } if shape.rank() == 0 => Some(*scalar),
        _ => None,
    }
}

/// Rewrites `(T, T) -> T` over rank-0 tensors into the same signature over scalars.
fn convert_apply_function(ctx: &mut Context, apply: Handle<Operation>) -> Result<(), PassError> {
    let signature = ctx.function_type(apply)?.clone();
    let ([lhs, rhs], [result]) = (signature.inputs.as_slice(), signature.results.as_slice()) else {
        return Err(PassError::structural(
            ctx,
            apply,
            "apply function must take two operands and return one result",
        ));
    };
    if lhs != rhs || lhs != result {
        return Err(PassError::structural(
            ctx,
            apply,
            "apply function operands and result must share one type",
        ));
    }
    let scalar = scalar_of(&ctx.types[*lhs]).ok_or_else(|| {
        PassError::structural(
            ctx,
            apply,
            "apply function must operate on scalars or rank-0 tensors",
        )
    })?;
    let scalar_ty = ctx.intern(Type::Scalar(scalar));

    let block = crate::utils::single_block(ctx, apply)?;
    let count = ctx.blocks[block].arguments.len();
    if count != 2 {
        return Err(PassError::structural(
            ctx,
            apply,
            format!("apply function body takes {count} arguments, expected 2"),
        ));
    }
    for arg in ctx.blocks[block].arguments.clone() {
        ctx.values[arg].ty = scalar_ty;
    }
    for op in ctx.blocks[block].ops.clone() {
        let kind = match ctx.op(op).kind {
            OpKind::Elementwise(op @ (BinaryOp::Add | BinaryOp::Min | BinaryOp::Max))
            | OpKind::Arith(op @ (BinaryOp::Add | BinaryOp::Min | BinaryOp::Max)) => {
                OpKind::Arith(op)
            }
            OpKind::Return | OpKind::HloReturn => OpKind::Return,
            other => {
                return Err(PassError::unsupported(
                    ctx,
                    op,
                    format!("'{}' in a reduction apply function", other.name()),
                ));
            }
        };
        ctx.op_mut(op).kind = kind;
        for value in ctx.op(op).results.clone() {
            ctx.values[value].ty = scalar_ty;
        }
    }
    ctx.op_mut(apply).set_attr(
        names::FUNCTION_TYPE,
        Attribute::FunctionType(FunctionType {
            inputs: vec![scalar_ty, scalar_ty],
            results: vec![scalar_ty],
        }),
    );
    Ok(())
}

/// Builds the loop nest for an empty `(src, init, dst)` entry function.
fn build_entry_body(
    ctx: &mut Context,
    entry: Handle<Operation>,
    apply: Handle<Operation>,
) -> Result<(), PassError> {
    let signature = ctx.function_type(entry)?.clone();
    let [src, init, dst] = signature.inputs.as_slice() else {
        return Err(PassError::structural(
            ctx,
            entry,
            format!(
                "reduction entry expects (src, init, dst), got {} arguments",
                signature.inputs.len()
            ),
        ));
    };
    let src_ty = ctx.types[*src].clone();
    let (Some(rank), Some(element)) = (src_ty.rank(), src_ty.element_scalar()) else {
        return Err(PassError::structural(ctx, entry, "reduction source must be shaped"));
    };
    if rank < 2 {
        return Err(PassError::structural(
            ctx,
            entry,
            format!("cannot reduce a rank-{rank} source, the output would be rank-0"),
        ));
    }
    let dimension = ctx
        .op(entry)
        .int_attr(names::REDUCTION_DIMENSION)
        .ok_or_else(|| {
            PassError::structural(
                ctx,
                entry,
                format!("reduction entry is missing '{}'", names::REDUCTION_DIMENSION),
            )
        })?;
    let Some(dimension) = usize::try_from(dimension).ok().filter(|&d| d < rank) else {
        return Err(PassError::structural(
            ctx,
            entry,
            format!("reduction dimension {dimension} is out of range for rank {rank}"),
        ));
    };

    let num_dims = rank as u32;
    let mut permutation: Vec<u32> = (0..num_dims).collect();
    permutation.swap(dimension, rank - 1);
    let maps = vec![
        AffineMap::permutation(&permutation),
        AffineMap::constant(num_dims, 0),
        AffineMap {
            num_dims,
            results: (0..num_dims - 1).map(AffineExpr::Dim).collect(),
        },
    ];
    let mut iterators = vec![IteratorType::Parallel; rank];
    iterators[rank - 1] = IteratorType::Reduction;

    let region = ctx.op(entry).regions[0];
    let body = ctx.add_block(region);
    let src = ctx.add_argument(body, *src);
    let init = ctx.add_argument(body, *init);
    let dst = ctx.add_argument(body, *dst);
    let location = ctx.op(entry).location.clone();

    let mut b = OpBuilder::at_end(ctx, body).with_location(location.clone());
    let generic = b.insert(
        OperationState::new(OpKind::IndexedGeneric, location.clone())
            .operands([src, init, dst])
            .attr(names::ARGS_IN, Attribute::Int(2))
            .attr(names::ARGS_OUT, Attribute::Int(1))
            .attr(names::INDEXING_MAPS, Attribute::AffineMaps(maps))
            .attr(names::ITERATOR_TYPES, Attribute::Iterators(iterators))
            .regions(1),
    );
    b.terminator(OpKind::Return, []);

    let index_ty = ctx.intern(Type::Index);
    let element_ty = ctx.intern(Type::Scalar(element));
    let bool_ty = ctx.intern(Type::Scalar(Scalar::BOOL));
    let generic_region = ctx.op(generic).regions[0];
    let loop_body = ctx.add_block(generic_region);
    let indices: Vec<_> = (0..rank).map(|_| ctx.add_argument(loop_body, index_ty)).collect();
    let src_elem = ctx.add_argument(loop_body, element_ty);
    let init_elem = ctx.add_argument(loop_body, element_ty);
    let dst_elem = ctx.add_argument(loop_body, element_ty);

    let mut b = OpBuilder::at_end(ctx, loop_body).with_location(location);
    let zero = b.constant_index(0);
    let first = b.value(OpKind::CmpEq, [indices[rank - 1], zero], bool_ty);
    let acc = b.value(OpKind::Select, [first, init_elem, dst_elem], element_ty);

    let apply_block = crate::utils::single_block(ctx, apply)?;
    let &[lhs, rhs] = ctx.blocks[apply_block].arguments.as_slice() else {
        return Err(PassError::structural(
            ctx,
            apply,
            "apply function body must take two arguments",
        ));
    };
    let mut map = ValueMap::new();
    map.insert(lhs, acc);
    map.insert(rhs, src_elem);
    let mut yielded = Vec::new();
    for op in ctx.blocks[apply_block].ops.clone() {
        if ctx.op(op).kind.is_return_like() {
            yielded = ctx
                .op(op)
                .operands
                .iter()
                .map(|&v| map.lookup_or_default(v))
                .collect();
            continue;
        }
        let cloned = ctx.clone_op(op, &mut map);
        ctx.append_op(loop_body, cloned);
    }
    let location = ctx.op(entry).location.clone();
    OpBuilder::at_end(ctx, loop_body)
        .with_location(location)
        .terminator(OpKind::Yield, yielded);

    log::debug!(
        "lowered reduction entry '{}' along dimension {dimension} of rank {rank}",
        ctx.op(entry).sym_name().unwrap_or_default()
    );
    Ok(())
}
