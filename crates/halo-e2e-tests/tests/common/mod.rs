use halo_backend_core::executable::{self as hal, declare_executable};
use halo_backend_core::{ExecutableTargetOptions, Target, TargetError};
use halo_backend_vulkan::executable::unpack;
use halo_backend_vulkan::proto::SpirVExecutableDef;
use halo_backend_vulkan::{BINARY_FORMAT, VulkanSpirvTarget, VulkanSpirvTargetOptions};
#[allow(unused_imports)]
use halo_ir::{
    Attribute, BinaryOp, Block, Context, FunctionType, Handle, Location, OpBuilder, OpKind,
    Operation, OperationState, Scalar, Type, Value, names,
};

/// Body of a dispatch function in a test executable.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum Dispatch {
    /// `store_output(kind(load_input a, load_input b), out)` over buffers of
    /// the given shapes.
    Binary(OpKind, [&'static [u32]; 3]),
    /// A declared reduction of `src` along `dimension` using the named apply.
    Reduction {
        src: &'static [u32],
        dimension: i64,
        apply: &'static str,
    },
}

/// A dispatch function of a test executable.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub struct EntrySpec {
    pub name: &'static str,
    pub dispatch: Dispatch,
}

#[allow(dead_code)]
pub fn binary(name: &'static str, kind: OpKind, shapes: [&'static [u32]; 3]) -> EntrySpec {
    EntrySpec {
        name,
        dispatch: Dispatch::Binary(kind, shapes),
    }
}

#[allow(dead_code)]
pub fn reduction(name: &'static str, src: &'static [u32], dimension: i64, apply: &'static str) -> EntrySpec {
    EntrySpec {
        name,
        dispatch: Dispatch::Reduction {
            src,
            dimension,
            apply,
        },
    }
}

/// `hlo` apply function `(tensor<f32>, tensor<f32>) -> tensor<f32>`.
#[allow(dead_code)]
pub fn apply_function(ctx: &mut Context, block: Handle<Block>, name: &str, op: BinaryOp) {
    let t = ctx.intern(Type::tensor(&[], Scalar::F32));
    let func = ctx.create_op(
        OperationState::new(OpKind::Func, Location::Unknown)
            .attr(names::SYM_NAME, Attribute::Str(name.to_string()))
            .attr(
                names::FUNCTION_TYPE,
                Attribute::FunctionType(FunctionType {
                    inputs: vec![t, t],
                    results: vec![t],
                }),
            )
            .regions(1),
    );
    ctx.append_op(block, func);
    let region = ctx.op(func).regions[0];
    let body = ctx.add_block(region);
    let lhs = ctx.add_argument(body, t);
    let rhs = ctx.add_argument(body, t);
    let mut b = OpBuilder::at_end(ctx, body);
    let value = b.value(OpKind::Elementwise(op), [lhs, rhs], t);
    b.terminator(OpKind::HloReturn, [value]);
}

fn function(
    ctx: &mut Context,
    block: Handle<Block>,
    name: &str,
    inputs: Vec<Handle<Type>>,
    define: bool,
) -> (Handle<Operation>, Vec<Value>) {
    let func = ctx.create_op(
        OperationState::new(OpKind::Func, Location::Name(name.to_string()))
            .attr(names::SYM_NAME, Attribute::Str(name.to_string()))
            .attr(
                names::FUNCTION_TYPE,
                Attribute::FunctionType(FunctionType {
                    inputs: inputs.clone(),
                    results: vec![],
                }),
            )
            .attr(names::EXPORT, Attribute::Unit)
            .regions(1),
    );
    ctx.append_op(block, func);
    if !define {
        return (func, Vec::new());
    }
    let region = ctx.op(func).regions[0];
    let entry = ctx.add_block(region);
    let args = inputs.into_iter().map(|ty| ctx.add_argument(entry, ty)).collect();
    (func, args)
}

/// Builds `flow.executable @exe` holding `entries` and wraps it into a
/// `hal.executable`. Apply functions named by reductions must be added to
/// the inner module with [`apply_function`] through `applies`.
#[allow(dead_code)]
pub fn executable(
    ctx: &mut Context,
    entries: &[EntrySpec],
    applies: &[(&str, BinaryOp)],
) -> Handle<Operation> {
    let block = ctx.module_body();
    let flow = OpBuilder::at_end(ctx, block).insert(
        OperationState::new(OpKind::FlowExecutable, Location::Unknown)
            .attr(names::SYM_NAME, Attribute::Str("exe".into()))
            .regions(1),
    );
    let region = ctx.op(flow).regions[0];
    let body = ctx.add_block(region);
    let mut b = OpBuilder::at_end(ctx, body);
    for (ordinal, entry) in entries.iter().enumerate() {
        let kind = match entry.dispatch {
            Dispatch::Binary(..) => OpKind::DispatchEntry,
            Dispatch::Reduction { .. } => OpKind::ReductionEntry,
        };
        b.insert(
            OperationState::new(kind, Location::Unknown)
                .attr(names::FUNCTION_REF, Attribute::SymbolRef(entry.name.to_string()))
                .attr(names::ORDINAL, Attribute::Int(ordinal as i64)),
        );
    }
    let inner = b.insert(OperationState::new(OpKind::Module, Location::Unknown).regions(1));
    let inner_region = ctx.op(inner).regions[0];
    let inner_body = ctx.add_block(inner_region);

    for &(name, op) in applies {
        apply_function(ctx, inner_body, name, op);
    }
    for entry in entries {
        match entry.dispatch {
            Dispatch::Binary(kind, shapes) => {
                let buffers = shapes
                    .iter()
                    .map(|dims| ctx.intern(Type::memref(dims, Scalar::F32)))
                    .collect();
                let tensors: Vec<_> = shapes
                    .iter()
                    .map(|dims| ctx.intern(Type::tensor(dims, Scalar::F32)))
                    .collect();
                let (func, args) = function(ctx, inner_body, entry.name, buffers, true);
                let entry_block = ctx.body(func).unwrap();
                let mut b = OpBuilder::at_end(ctx, entry_block);
                let x = b.value(OpKind::LoadInput, [args[0]], tensors[0]);
                let y = b.value(OpKind::LoadInput, [args[1]], tensors[1]);
                let z = b.value(kind, [x, y], tensors[2]);
                b.insert(
                    OperationState::new(OpKind::StoreOutput, Location::Unknown)
                        .operands([z, args[2]]),
                );
                b.terminator(OpKind::Return, []);
            }
            Dispatch::Reduction {
                src,
                dimension,
                apply,
            } => {
                let mut dst = src.to_vec();
                if let Ok(d) = usize::try_from(dimension) {
                    if d < dst.len() {
                        dst.remove(d);
                    }
                }
                let inputs = vec![
                    ctx.intern(Type::memref(src, Scalar::F32)),
                    ctx.intern(Type::memref(&[], Scalar::F32)),
                    ctx.intern(Type::memref(&dst, Scalar::F32)),
                ];
                let (func, _) = function(ctx, inner_body, entry.name, inputs, false);
                let op = ctx.op_mut(func);
                op.set_attr(names::REDUCTION, Attribute::Unit);
                op.set_attr(names::REDUCTION_APPLY, Attribute::SymbolRef(apply.into()));
                op.set_attr(names::REDUCTION_DIMENSION, Attribute::Int(dimension));
            }
        }
    }
    declare_executable(ctx, flow).unwrap()
}

/// Translates `executable` with a Vulkan target built from `options`.
#[allow(dead_code)]
pub fn translate(
    ctx: &mut Context,
    executable: Handle<Operation>,
    options: VulkanSpirvTargetOptions,
) -> Result<(), TargetError> {
    VulkanSpirvTarget::new(options).translate(ctx, executable, &ExecutableTargetOptions::default())
}

/// Packed bytes of the only binary attached to `executable`.
#[allow(dead_code)]
pub fn binary_bytes(ctx: &Context, executable: Handle<Operation>) -> Vec<u8> {
    let binaries = hal::binaries(ctx, executable);
    assert_eq!(binaries.len(), 1, "expected exactly one binary");
    let op = ctx.op(binaries[0]);
    assert_eq!(op.str_attr(names::FORMAT), Some(BINARY_FORMAT));
    op.attr(names::DATA)
        .and_then(Attribute::as_bytes)
        .expect("binary has no data")
        .to_vec()
}

/// Decoded definition of the only binary attached to `executable`.
#[allow(dead_code)]
pub fn binary_def(ctx: &Context, executable: Handle<Operation>) -> SpirVExecutableDef {
    unpack(&binary_bytes(ctx, executable)).expect("binary failed to unpack")
}

