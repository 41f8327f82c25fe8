//! Dispatch functions straight to a `spv.module`.
//!
//! Each dispatch function becomes an entry point running one invocation per
//! output element along global id x, guarded by the element count. Whole
//! buffer loads of a single element broadcast. Copies left by the load/store
//! optimizer move a constant-offset span per invocation.

use std::collections::HashMap;

use halo_ir::kernel::{self, BinaryOp, EntryPoint, Expression, GlobalVariable, ResourceBinding, StorageAccess};
use halo_ir::{Context, Handle, OpKind, Operation, Value, names};
use halo_opt::{Pass, PassError, utils};

use crate::builder::{FunctionBuilder, literal_for};
use crate::lower::{attach_program, static_buffer};

type Expr = Handle<Expression>;

/// Lowers element-wise dispatch functions into a `spv.module`.
#[derive(Debug)]
pub struct DirectToSpirv;

impl Pass for DirectToSpirv {
    fn name(&self) -> &str {
        "direct-to-spirv"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut program = kernel::Module::default();
        for func in utils::functions(ctx, module)? {
            if !utils::is_dispatch_function(ctx, func) || ctx.is_declaration(func) {
                continue;
            }
            let entry = lower_function(ctx, &mut program, func)?;
            program.entry_points.push(entry);
        }
        if program.entry_points.is_empty() {
            return Ok(false);
        }
        log::debug!(
            "lowered {} dispatch functions directly",
            program.entry_points.len()
        );
        attach_program(ctx, module, program)?;
        Ok(true)
    }
}

/// Number of elements of a shaped or scalar value.
fn element_count(ctx: &Context, value: Value) -> Option<u32> {
    match ctx.value_type(value).shape() {
        Some(shape) => u32::try_from(shape.num_elements()?).ok(),
        None => Some(1),
    }
}

/// A constant `mem.index_buffer` or `arith.index` feeding a copy.
fn constant_indices(ctx: &Context, value: Value) -> Option<Vec<i64>> {
    let op = ctx.op(ctx.defining_op(value)?);
    match op.kind {
        OpKind::IndexBuffer => op.int_list_attr(names::VALUE).map(<[i64]>::to_vec),
        OpKind::ConstantIndex => op.int_attr(names::VALUE).map(|v| vec![v]),
        _ => None,
    }
}

/// Source offset, destination offset and length of a copy.
fn copy_span(ctx: &Context, copy: Handle<Operation>) -> Result<[u32; 3], PassError> {
    let [_, src_indices, _, dst_indices, lengths] = ctx.op(copy).operands[..] else {
        return Err(PassError::structural(ctx, copy, "copy expects five operands"));
    };
    let offset = |value: Value, what: &str| -> Result<u32, PassError> {
        match constant_indices(ctx, value).as_deref() {
            Some(&[index]) => u32::try_from(index)
                .map_err(|_| PassError::structural(ctx, copy, format!("negative {what} offset"))),
            _ => Err(PassError::unsupported(
                ctx,
                copy,
                format!("{what} offset is not a single constant index"),
            )),
        }
    };
    let length = constant_indices(ctx, lengths)
        .and_then(|extents| u32::try_from(extents.iter().product::<i64>()).ok())
        .ok_or_else(|| PassError::unsupported(ctx, copy, "copy length is not static"))?;
    Ok([offset(src_indices, "source")?, offset(dst_indices, "destination")?, length])
}

/// Invocation count covering every store and copy of `func`.
fn invocation_count(ctx: &Context, func: Handle<Operation>) -> Result<u32, PassError> {
    let block = utils::single_block(ctx, func)?;
    let ops = &ctx.blocks[block].ops;
    let mut count = 0;
    if ops
        .iter()
        .any(|&op| matches!(ctx.op(op).kind, OpKind::StoreOutput | OpKind::StoreReduce))
    {
        let extent = utils::launch_size(ctx, func)?;
        count = u32::try_from(extent.iter().product::<i64>())
            .map_err(|_| PassError::unsupported(ctx, func, "launch size does not fit 32 bits"))?;
    }
    for &op in ops {
        if ctx.op(op).kind == OpKind::Copy {
            count = count.max(copy_span(ctx, op)?[2]);
        }
    }
    if count == 0 {
        return Err(PassError::structural(
            ctx,
            func,
            "dispatch function writes no output",
        ));
    }
    Ok(count)
}

/// Opens `if gid < limit` when `limit` is below the invocation count.
fn open_guard(fb: &mut FunctionBuilder, gid: Expr, limit: u32, count: u32) -> Option<Expr> {
    if limit >= count {
        return None;
    }
    let limit = fb.u32(limit);
    let within = fb.binary(BinaryOp::Less, gid, limit);
    fb.begin_if();
    Some(within)
}

fn close_guard(fb: &mut FunctionBuilder, guard: Option<Expr>) {
    if let Some(within) = guard {
        fb.end_if(within);
    }
}

fn declare_arguments(
    ctx: &Context,
    program: &mut kernel::Module,
    func: Handle<Operation>,
) -> Result<HashMap<Value, Handle<GlobalVariable>>, PassError> {
    let name = ctx.op(func).sym_name().unwrap_or_default();
    let block = utils::single_block(ctx, func)?;
    let mut access: HashMap<Value, StorageAccess> = HashMap::new();
    for &op in &ctx.blocks[block].ops {
        let operation = ctx.op(op);
        let uses: &[(usize, StorageAccess)] = match operation.kind {
            OpKind::LoadInput => &[(0, StorageAccess::LOAD)],
            OpKind::StoreOutput | OpKind::StoreReduce => &[(1, StorageAccess::STORE)],
            OpKind::Copy => &[(0, StorageAccess::LOAD), (2, StorageAccess::STORE)],
            _ => continue,
        };
        for &(slot, flag) in uses {
            if let Some(&buffer) = operation.operands.get(slot) {
                *access.entry(buffer).or_insert(StorageAccess::EMPTY) |= flag;
            }
        }
    }

    let mut buffers = HashMap::new();
    for (index, arg) in ctx.arguments(func)?.into_iter().enumerate() {
        let Some((scalar, _)) = static_buffer(ctx, arg) else {
            continue;
        };
        let global = program.add_buffer(
            format!("{name}.arg{index}"),
            ResourceBinding {
                set: 0,
                binding: index as u32,
            },
            scalar,
            access.get(&arg).copied().unwrap_or(StorageAccess::EMPTY),
        );
        buffers.insert(arg, global);
    }
    Ok(buffers)
}

fn lower_function(
    ctx: &Context,
    program: &mut kernel::Module,
    func: Handle<Operation>,
) -> Result<EntryPoint, PassError> {
    let name = ctx.op(func).sym_name().unwrap_or_default().to_string();
    let workgroup_size = utils::workgroup_size(ctx, func)?;
    let count = invocation_count(ctx, func)?;
    let buffers = declare_arguments(ctx, program, func)?;
    let block = utils::single_block(ctx, func)?;

    let mut fb = FunctionBuilder::new(&name);
    let gid = fb.global_id(0);
    let bound = fb.u32(count);
    let in_range = fb.binary(BinaryOp::Less, gid, bound);
    fb.begin_if();

    let mut values: HashMap<Value, Expr> = HashMap::new();
    let buffer = |op: Handle<Operation>, value: Value| -> Result<Handle<GlobalVariable>, PassError> {
        buffers
            .get(&value)
            .copied()
            .ok_or_else(|| PassError::unsupported(ctx, op, "operand is not a static argument buffer"))
    };
    let scalar_operand = |values: &HashMap<Value, Expr>, op: Handle<Operation>, index: usize| {
        ctx.op(op)
            .operands
            .get(index)
            .and_then(|v| values.get(v))
            .copied()
            .ok_or_else(|| {
                PassError::unsupported(ctx, op, format!("operand #{index} has no per-element value"))
            })
    };

    for &op in &ctx.blocks[block].ops {
        let operation = ctx.op(op);
        match operation.kind {
            OpKind::LoadInput => {
                let [source] = operation.operands[..] else {
                    return Err(PassError::structural(ctx, op, "load_input expects one buffer"));
                };
                let global = buffer(op, source)?;
                let result = ctx.result(op, 0);
                let index = match element_count(ctx, result) {
                    Some(n) if n == count => gid,
                    Some(1) => fb.u32(0),
                    _ => {
                        return Err(PassError::unsupported(
                            ctx,
                            op,
                            format!("load of a shape that neither matches nor broadcasts to {count} elements"),
                        ));
                    }
                };
                let base = fb.global(global);
                let pointer = fb.element(base, index);
                values.insert(result, fb.load(pointer));
            }
            OpKind::Elementwise(arith) => {
                let left = scalar_operand(&values, op, 0)?;
                let right = scalar_operand(&values, op, 1)?;
                let value = fb.arith(arith, left, right);
                values.insert(ctx.result(op, 0), value);
            }
            OpKind::Constant => {
                let result = ctx.result(op, 0);
                let literal = ctx
                    .value_type(result)
                    .element_scalar()
                    .zip(operation.attr(names::VALUE))
                    .and_then(|(scalar, value)| literal_for(scalar, value))
                    .ok_or_else(|| PassError::unsupported(ctx, op, "constant has no kernel literal"))?;
                values.insert(result, fb.literal(literal));
            }
            OpKind::StoreOutput | OpKind::StoreReduce => {
                let value = scalar_operand(&values, op, 0)?;
                let target = operation
                    .operands
                    .get(1)
                    .copied()
                    .ok_or_else(|| PassError::structural(ctx, op, "store expects a buffer"))?;
                let global = buffer(op, target)?;
                let limit = element_count(ctx, operation.operands[0]).unwrap_or(count);
                let guard = open_guard(&mut fb, gid, limit, count);
                let base = fb.global(global);
                let pointer = fb.element(base, gid);
                fb.store(pointer, value);
                close_guard(&mut fb, guard);
            }
            OpKind::Copy => {
                let [src_offset, dst_offset, length] = copy_span(ctx, op)?;
                let src = buffer(op, operation.operands[0])?;
                let dst = buffer(op, operation.operands[2])?;
                let guard = open_guard(&mut fb, gid, length, count);
                let src_offset = fb.u32(src_offset);
                let from_index = fb.binary(BinaryOp::Add, gid, src_offset);
                let src = fb.global(src);
                let from = fb.element(src, from_index);
                let value = fb.load(from);
                let dst_offset = fb.u32(dst_offset);
                let to_index = fb.binary(BinaryOp::Add, gid, dst_offset);
                let dst = fb.global(dst);
                let to = fb.element(dst, to_index);
                fb.store(to, value);
                close_guard(&mut fb, guard);
            }
            OpKind::IndexBuffer | OpKind::ConstantIndex | OpKind::Return => {}
            kind => {
                return Err(PassError::unsupported(
                    ctx,
                    op,
                    format!("'{}' has no direct lowering", kind.name()),
                ));
            }
        }
    }
    fb.end_if(in_range);

    Ok(EntryPoint {
        name,
        workgroup_size,
        function: fb.finish(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_ir::{
        Attribute, BinaryOp as Op, FunctionType, Location, OpBuilder, OperationState, Scalar,
        Type,
    };
    use halo_opt::LoadStoreDataFlowOpt;

    /// `out = max(x, bias)` where `bias` may be a single element.
    fn dispatch(ctx: &mut Context, bias_dims: &[u32]) -> Handle<Operation> {
        let buffer = ctx.intern(Type::memref(&[64], Scalar::F32));
        let bias_buffer = ctx.intern(Type::memref(bias_dims, Scalar::F32));
        let tensor = ctx.intern(Type::tensor(&[64], Scalar::F32));
        let bias_tensor = ctx.intern(Type::tensor(bias_dims, Scalar::F32));
        let func = ctx.create_function(
            "relu",
            FunctionType {
                inputs: vec![buffer, bias_buffer, buffer],
                results: vec![],
            },
            true,
            Location::Unknown,
        );
        ctx.op_mut(func).set_attr(names::EXPORT, Attribute::Unit);
        utils::set_workgroup_size(ctx, func, [32, 1, 1]);
        let block = ctx.body(func).unwrap();
        let args = ctx.arguments(func).unwrap();
        let mut b = OpBuilder::at_end(ctx, block);
        let x = b.value(OpKind::LoadInput, [args[0]], tensor);
        let bias = b.value(OpKind::LoadInput, [args[1]], bias_tensor);
        let y = b.value(OpKind::Elementwise(Op::Max), [x, bias], tensor);
        b.insert(OperationState::new(OpKind::StoreOutput, Location::Unknown).operands([y, args[2]]));
        b.terminator(OpKind::Return, []);
        func
    }

    fn program(ctx: &Context) -> &kernel::Module {
        let spv = ctx.collect_kind(ctx.module(), OpKind::SpirvModule);
        assert_eq!(spv.len(), 1);
        ctx.op(spv[0]).program.as_deref().unwrap()
    }

    #[test]
    fn elementwise_dispatch_becomes_guarded_entry() {
        let mut ctx = Context::new();
        dispatch(&mut ctx, &[64]);
        let module = ctx.module();
        assert!(DirectToSpirv.run(&mut ctx, module).unwrap());

        let program = program(&ctx);
        let entry = &program.entry_points[0];
        assert_eq!(entry.name, "relu");
        assert_eq!(entry.workgroup_size, [32, 1, 1]);
        assert!(matches!(
            entry.function.body.last(),
            Some(kernel::Statement::If { .. })
        ));
        let access: Vec<_> = program.globals.iter().map(|(_, g)| g.access).collect();
        assert_eq!(
            access,
            vec![StorageAccess::LOAD, StorageAccess::LOAD, StorageAccess::STORE]
        );
        assert!(crate::spirv::serialize(program).is_ok());
    }

    #[test]
    fn single_element_inputs_broadcast() {
        let mut ctx = Context::new();
        dispatch(&mut ctx, &[1]);
        let module = ctx.module();
        assert!(DirectToSpirv.run(&mut ctx, module).unwrap());
    }

    #[test]
    fn mismatched_inputs_are_unsupported() {
        let mut ctx = Context::new();
        dispatch(&mut ctx, &[8]);
        let module = ctx.module();
        let err = DirectToSpirv.run(&mut ctx, module).unwrap_err();
        assert!(matches!(err, PassError::Unsupported { .. }));
    }

    #[test]
    fn fused_copies_are_lowered() {
        let mut ctx = Context::new();
        let buffer = ctx.intern(Type::memref(&[16], Scalar::F32));
        let element = ctx.intern(Type::Scalar(Scalar::F32));
        let func = ctx.create_function(
            "copy",
            FunctionType {
                inputs: vec![buffer, buffer],
                results: vec![],
            },
            true,
            Location::Unknown,
        );
        ctx.op_mut(func).set_attr(names::EXPORT, Attribute::Unit);
        utils::set_workgroup_size(&mut ctx, func, [32, 1, 1]);
        let block = ctx.body(func).unwrap();
        let args = ctx.arguments(func).unwrap();
        let mut b = OpBuilder::at_end(&mut ctx, block);
        let src_index = b.constant_index(3);
        let dst_index = b.constant_index(5);
        let x = b.value(OpKind::Load, [args[0], src_index], element);
        b.insert(OperationState::new(OpKind::Store, Location::Unknown).operands([x, args[1], dst_index]));
        b.terminator(OpKind::Return, []);

        let module = ctx.module();
        LoadStoreDataFlowOpt.run(&mut ctx, module).unwrap();
        assert!(DirectToSpirv.run(&mut ctx, module).unwrap());
        let program = program(&ctx);
        assert_eq!(program.globals.len(), 2);
        assert!(crate::spirv::serialize(program).is_ok());
    }

    #[test]
    fn dot_has_no_direct_lowering() {
        let mut ctx = Context::new();
        let func = dispatch(&mut ctx, &[64]);
        let block = ctx.body(func).unwrap();
        let tensor = ctx.intern(Type::tensor(&[64], Scalar::F32));
        OpBuilder::new(&mut ctx, halo_ir::InsertionPoint { block, index: 0 })
            .value(OpKind::Dot, [], tensor);
        let module = ctx.module();
        let err = DirectToSpirv.run(&mut ctx, module).unwrap_err();
        assert!(err.to_string().contains("hlo.dot"));
    }
}
