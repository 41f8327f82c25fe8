//! Element-wise dispatch functions to `linalg.indexed_generic`.

use std::collections::HashMap;

use halo_ir::{
    AffineMap, Attribute, Context, Handle, InsertionPoint, IteratorType, OpBuilder, OpKind,
    Operation, OperationState, Type, Value, names,
};

use crate::utils::{functions, is_dispatch_function, single_block};
use crate::{Pass, PassError};

/// Rewrites `load_input -> hlo element-wise ops -> store_output` dispatch
/// functions into a single all-parallel generic op with identity maps.
#[derive(Debug)]
pub struct ElementwiseToGeneric;

impl Pass for ElementwiseToGeneric {
    fn name(&self) -> &str {
        "elementwise-to-generic"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut changed = false;
        for func in functions(ctx, module)? {
            if is_dispatch_function(ctx, func) && !ctx.is_declaration(func) {
                changed |= run_on_function(ctx, func)?;
            }
        }
        Ok(changed)
    }
}

fn run_on_function(ctx: &mut Context, func: Handle<Operation>) -> Result<bool, PassError> {
    let block = single_block(ctx, func)?;
    let ops = ctx.blocks[block].ops.clone();
    if !ops.iter().any(|&op| ctx.op(op).kind == OpKind::StoreOutput) {
        return Ok(false);
    }

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut computed = Vec::new();
    let mut stored = Vec::new();
    let mut shape = None;
    for &op in &ops {
        let operation = ctx.op(op);
        match operation.kind {
            OpKind::LoadInput => inputs.push(op),
            OpKind::Elementwise(_) => computed.push(op),
            OpKind::StoreOutput => {
                let [value, buffer] = operation.operands[..] else {
                    return Err(PassError::structural(ctx, op, "expected a value and a buffer"));
                };
                outputs.push(buffer);
                stored.push(value);
            }
            OpKind::Return => {}
            other => {
                return Err(PassError::unsupported(
                    ctx,
                    op,
                    format!("'{}' in an element-wise dispatch function", other.name()),
                ));
            }
        }
        for &result in &operation.results {
            let ty = ctx.value_type(result);
            let dims = ty.shape().and_then(|s| s.static_dims()).ok_or_else(|| {
                PassError::unsupported(ctx, op, "element-wise lowering needs static shapes")
            })?;
            match &shape {
                None => shape = Some(dims),
                Some(expected) if *expected != dims => {
                    return Err(PassError::unsupported(
                        ctx,
                        op,
                        "element-wise operands must share one shape",
                    ));
                }
                Some(_) => {}
            }
        }
    }
    let rank = shape.map_or(0, |dims| dims.len()) as u32;

    let mut input_buffers = Vec::with_capacity(inputs.len());
    for &load in &inputs {
        let [buffer] = ctx.op(load).operands[..] else {
            return Err(PassError::structural(ctx, load, "expected a single buffer operand"));
        };
        input_buffers.push(buffer);
    }

    let location = ctx.op(func).location.clone();
    let point = InsertionPoint { block, index: 0 };
    let generic = OpBuilder::new(ctx, point).insert(
        OperationState::new(OpKind::IndexedGeneric, location.clone())
            .operands(input_buffers.iter().chain(&outputs).copied())
            .attr(names::ARGS_IN, Attribute::Int(input_buffers.len() as i64))
            .attr(names::ARGS_OUT, Attribute::Int(outputs.len() as i64))
            .attr(
                names::INDEXING_MAPS,
                Attribute::AffineMaps(vec![
                    AffineMap::identity(rank);
                    input_buffers.len() + outputs.len()
                ]),
            )
            .attr(
                names::ITERATOR_TYPES,
                Attribute::Iterators(vec![IteratorType::Parallel; rank as usize]),
            )
            .regions(1),
    );

    let index_ty = ctx.intern(Type::Index);
    let region = ctx.op(generic).regions[0];
    let body = ctx.add_block(region);
    for _ in 0..rank {
        ctx.add_argument(body, index_ty);
    }
    let mut scalars: HashMap<Value, Value> = HashMap::new();
    for (&load, &buffer) in inputs.iter().zip(&input_buffers) {
        let element = element_type(ctx, buffer, load)?;
        let arg = ctx.add_argument(body, element);
        scalars.insert(ctx.result(load, 0), arg);
    }
    for &buffer in &outputs {
        let element = element_type(ctx, buffer, func)?;
        ctx.add_argument(body, element);
    }

    let mut b = OpBuilder::at_end(ctx, body).with_location(location);
    for &op in &computed {
        let operation = b.ctx.op(op).clone();
        let OpKind::Elementwise(binary) = operation.kind else {
            continue;
        };
        let mut operands = Vec::with_capacity(operation.operands.len());
        for value in &operation.operands {
            let Some(&scalar) = scalars.get(value) else {
                return Err(PassError::unsupported(
                    b.ctx,
                    op,
                    "operand is not produced inside the dispatch function",
                ));
            };
            operands.push(scalar);
        }
        let element = element_type(b.ctx, operation.results[0], op)?;
        let result = b.value(OpKind::Arith(binary), operands, element);
        scalars.insert(operation.results[0], result);
    }
    let mut yielded = Vec::with_capacity(stored.len());
    for value in &stored {
        let Some(&scalar) = scalars.get(value) else {
            return Err(PassError::unsupported(
                b.ctx,
                func,
                "stored value is not produced inside the dispatch function",
            ));
        };
        yielded.push(scalar);
    }
    b.terminator(OpKind::Yield, yielded);

    for &op in ops.iter().rev() {
        if ctx.op(op).kind != OpKind::Return {
            ctx.erase_op(op);
        }
    }
    log::debug!(
        "lowered element-wise dispatch '{}' to a rank-{rank} generic",
        ctx.op(func).sym_name().unwrap_or_default()
    );
    Ok(true)
}

fn element_type(
    ctx: &mut Context,
    value: Value,
    op: Handle<Operation>,
) -> Result<Handle<Type>, PassError> {
    let scalar = ctx
        .value_type(value)
        .element_scalar()
        .ok_or_else(|| PassError::structural(ctx, op, "expected a typed buffer or tensor"))?;
    Ok(ctx.intern(Type::Scalar(scalar)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_ir::{BinaryOp, FunctionType, Location, Scalar};

    /// `out = (a + b) * a` over `tensor<4x8xf32>`.
    fn fixture(ctx: &mut Context) -> Handle<Operation> {
        let buffer = ctx.intern(Type::memref(&[4, 8], Scalar::F32));
        let tensor = ctx.intern(Type::tensor(&[4, 8], Scalar::F32));
        let func = ctx.create_function(
            "mul_add",
            FunctionType {
                inputs: vec![buffer; 3],
                results: vec![],
            },
            true,
            Location::Unknown,
        );
        ctx.op_mut(func).set_attr(names::EXPORT, Attribute::Unit);
        let block = ctx.body(func).unwrap();
        let args = ctx.arguments(func).unwrap();
        let mut b = OpBuilder::at_end(ctx, block);
        let a = b.value(OpKind::LoadInput, [args[0]], tensor);
        let c = b.value(OpKind::LoadInput, [args[1]], tensor);
        let sum = b.value(OpKind::Elementwise(BinaryOp::Add), [a, c], tensor);
        let prod = b.value(OpKind::Elementwise(BinaryOp::Mul), [sum, a], tensor);
        b.insert(OperationState::new(OpKind::StoreOutput, Location::Unknown).operands([prod, args[2]]));
        b.terminator(OpKind::Return, []);
        func
    }

    #[test]
    fn lowers_to_single_generic() {
        let mut ctx = Context::new();
        let func = fixture(&mut ctx);
        let module = ctx.module();
        assert!(ElementwiseToGeneric.run(&mut ctx, module).unwrap());

        let block = ctx.body(func).unwrap();
        let ops = ctx.blocks[block].ops.clone();
        assert_eq!(ops.len(), 2);
        let generic = ctx.op(ops[0]);
        assert_eq!(generic.kind, OpKind::IndexedGeneric);
        assert_eq!(generic.operands, ctx.arguments(func).unwrap());
        assert_eq!(generic.int_attr(names::ARGS_IN), Some(2));
        assert_eq!(generic.int_attr(names::ARGS_OUT), Some(1));
        let maps = generic
            .attr(names::INDEXING_MAPS)
            .and_then(Attribute::as_affine_maps)
            .unwrap();
        assert!(maps.iter().all(|m| *m == AffineMap::identity(2)));

        let body = ctx.body(ops[0]).unwrap();
        let kinds: Vec<_> = ctx.blocks[body].ops.iter().map(|&op| ctx.op(op).kind).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::Arith(BinaryOp::Add),
                OpKind::Arith(BinaryOp::Mul),
                OpKind::Yield
            ]
        );
        assert_eq!(ctx.blocks[body].arguments.len(), 5);
        halo_ir::verify(&ctx, module).unwrap();
    }

    #[test]
    fn non_dispatch_functions_are_skipped() {
        let mut ctx = Context::new();
        let func = fixture(&mut ctx);
        ctx.op_mut(func).remove_attr(names::EXPORT);
        let module = ctx.module();
        assert!(!ElementwiseToGeneric.run(&mut ctx, module).unwrap());
    }

    #[test]
    fn foreign_ops_are_unsupported() {
        let mut ctx = Context::new();
        let func = fixture(&mut ctx);
        let block = ctx.body(func).unwrap();
        let first = ctx.blocks[block].ops[0];
        ctx.op_mut(first).kind = OpKind::Dot;
        let module = ctx.module();
        let err = ElementwiseToGeneric.run(&mut ctx, module).unwrap_err();
        assert!(matches!(err, PassError::Unsupported { .. }));
    }
}
