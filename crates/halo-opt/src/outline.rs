//! Kernel outlining: `gpu.launch` bodies into standalone `gpu.func`s.

use halo_ir::{
    Attribute, Context, FunctionType, Handle, InsertionPoint, OpBuilder, OpKind, Operation,
    OperationState, SymbolTable, ValueMap, names,
};

use crate::utils::{functions, is_dispatch_function};
use crate::{Pass, PassError};

/// Suffix appended to a dispatch function name to name its kernel module.
pub const KERNEL_MODULE_SUFFIX: &str = "_kernels";

/// Moves every launch of a dispatch function into a kernel module placed
/// right before the function.
///
/// Launches that capture anything other than exactly the function's
/// arguments, in order, are left in place.
#[derive(Debug)]
pub struct KernelOutlining;

impl Pass for KernelOutlining {
    fn name(&self) -> &str {
        "kernel-outlining"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut symbols = SymbolTable::build(ctx, module)?;
        let mut changed = false;
        for func in functions(ctx, module)? {
            if !is_dispatch_function(ctx, func) || ctx.is_declaration(func) {
                continue;
            }
            let mut worklist = ctx.collect_kind(func, OpKind::Launch);
            worklist.reverse();
            while let Some(launch) = worklist.pop() {
                if !ctx.is_live(launch) {
                    continue;
                }
                changed |= outline(ctx, &mut symbols, func, launch)?;
            }
        }
        Ok(changed)
    }
}

/// First name of the form `base`, `base_1`, `base_2`, ... not yet in `symbols`.
fn unique_name(symbols: &SymbolTable, base: &str) -> String {
    if !symbols.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|name| !symbols.contains(name))
        .unwrap_or_else(|| base.to_string())
}

fn outline(
    ctx: &mut Context,
    symbols: &mut SymbolTable,
    func: Handle<Operation>,
    launch: Handle<Operation>,
) -> Result<bool, PassError> {
    let args = ctx.arguments(func)?;
    if ctx.op(launch).operands != args {
        log::debug!(
            "unsupported: launch at {} captures values beyond its function's arguments",
            ctx.op(launch).location
        );
        return Ok(false);
    }
    let func_name = ctx.op(func).sym_name().unwrap_or_default().to_string();
    let location = ctx.op(func).location.clone();
    let inputs = args.iter().map(|&a| ctx.value_type_handle(a)).collect();
    let module_name = unique_name(symbols, &format!("{func_name}{KERNEL_MODULE_SUFFIX}"));
    let kernel_name = match module_kernels(ctx, symbols, &func_name) {
        0 => func_name.clone(),
        existing => format!("{func_name}_{existing}"),
    };

    let Some((block, index)) = ctx.position(func) else {
        return Err(PassError::structural(ctx, func, "function is detached"));
    };
    let kernel_module = OpBuilder::new(ctx, InsertionPoint { block, index }).insert(
        OperationState::new(OpKind::KernelModule, location.clone())
            .attr(names::SYM_NAME, Attribute::Str(module_name.clone()))
            .regions(1),
    );
    let module_region = ctx.op(kernel_module).regions[0];
    let module_body = ctx.add_block(module_region);

    let kernel = OpBuilder::at_end(ctx, module_body).insert(
        OperationState::new(OpKind::KernelFunc, location.clone())
            .attr(names::SYM_NAME, Attribute::Str(kernel_name.clone()))
            .attr(names::KERNEL, Attribute::Unit)
            .attr(
                names::FUNCTION_TYPE,
                Attribute::FunctionType(FunctionType {
                    inputs,
                    results: vec![],
                }),
            )
            .regions(1),
    );
    let launch_region = ctx.op(launch).regions[0];
    let kernel_region = ctx.op(kernel).regions[0];
    ctx.clone_region_into(launch_region, kernel_region, &mut ValueMap::new());

    for term in ctx.collect_kind(kernel, OpKind::LaunchTerminator) {
        let term_location = ctx.op(term).location.clone();
        if let Some(mut b) = OpBuilder::before(ctx, term) {
            b.set_location(term_location);
            b.terminator(OpKind::KernelReturn, []);
        }
        ctx.erase_op(term);
    }
    ctx.erase_op(launch);
    symbols.insert(module_name.clone(), kernel_module);

    log::debug!("outlined kernel '{kernel_name}' into '{module_name}'");
    Ok(true)
}

/// Number of kernel modules already outlined from `func_name`.
fn module_kernels(ctx: &Context, symbols: &SymbolTable, func_name: &str) -> usize {
    let prefix = format!("{func_name}{KERNEL_MODULE_SUFFIX}");
    symbols
        .iter()
        .filter(|&(name, op)| {
            ctx.is_live(op)
                && ctx.op(op).kind == OpKind::KernelModule
                && (name == prefix || name.starts_with(&format!("{prefix}_")))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementwiseToGeneric, GenericToLaunch};
    use halo_ir::{BinaryOp, Location, Scalar, Type};

    fn launch_dispatch(ctx: &mut Context, name: &str) -> Handle<Operation> {
        let buffer = ctx.intern(Type::memref(&[16], Scalar::F32));
        let tensor = ctx.intern(Type::tensor(&[16], Scalar::F32));
        let func = ctx.create_function(
            name,
            FunctionType {
                inputs: vec![buffer; 2],
                results: vec![],
            },
            true,
            Location::Unknown,
        );
        ctx.op_mut(func).set_attr(names::EXPORT, Attribute::Unit);
        let block = ctx.body(func).unwrap();
        let args = ctx.arguments(func).unwrap();
        let mut b = OpBuilder::at_end(ctx, block);
        let x = b.value(OpKind::LoadInput, [args[0]], tensor);
        let y = b.value(OpKind::Elementwise(BinaryOp::Max), [x, x], tensor);
        b.insert(OperationState::new(OpKind::StoreOutput, Location::Unknown).operands([y, args[1]]));
        b.terminator(OpKind::Return, []);
        let module = ctx.module();
        ElementwiseToGeneric.run(ctx, module).unwrap();
        GenericToLaunch.run(ctx, module).unwrap();
        func
    }

    #[test]
    fn launch_becomes_kernel_module() {
        let mut ctx = Context::new();
        let func = launch_dispatch(&mut ctx, "relu");
        let module = ctx.module();
        assert!(KernelOutlining.run(&mut ctx, module).unwrap());

        assert!(ctx.collect_kind(func, OpKind::Launch).is_empty());
        let body = ctx.module_body();
        let ops = ctx.blocks[body].ops.clone();
        assert_eq!(ops.len(), 2);
        assert_eq!(ctx.op(ops[0]).kind, OpKind::KernelModule);
        assert_eq!(ctx.op(ops[0]).sym_name(), Some("relu_kernels"));
        assert_eq!(ops[1], func);

        let kernels = ctx.collect_kind(ops[0], OpKind::KernelFunc);
        assert_eq!(kernels.len(), 1);
        let kernel = ctx.op(kernels[0]);
        assert_eq!(kernel.sym_name(), Some("relu"));
        assert!(kernel.has_attr(names::KERNEL));
        assert_eq!(ctx.arguments(kernels[0]).unwrap().len(), 2);
        let term = ctx.terminator(ctx.body(kernels[0]).unwrap()).unwrap();
        assert_eq!(ctx.op(term).kind, OpKind::KernelReturn);
        halo_ir::verify(&ctx, module).unwrap();
    }

    #[test]
    fn extra_captures_are_skipped() {
        let mut ctx = Context::new();
        let func = launch_dispatch(&mut ctx, "relu");
        let launch = ctx.collect_kind(func, OpKind::Launch)[0];
        ctx.op_mut(launch).operands.pop();
        let module = ctx.module();
        assert!(!KernelOutlining.run(&mut ctx, module).unwrap());
        assert_eq!(ctx.collect_kind(func, OpKind::Launch), vec![launch]);
    }

    #[test]
    fn non_dispatch_functions_are_ignored() {
        let mut ctx = Context::new();
        let func = launch_dispatch(&mut ctx, "relu");
        ctx.op_mut(func).remove_attr(names::EXPORT);
        let module = ctx.module();
        assert!(!KernelOutlining.run(&mut ctx, module).unwrap());
    }

    #[test]
    fn every_dispatch_gets_its_own_module() {
        let mut ctx = Context::new();
        launch_dispatch(&mut ctx, "a");
        launch_dispatch(&mut ctx, "b");
        let module = ctx.module();
        KernelOutlining.run(&mut ctx, module).unwrap();
        let names: Vec<_> = ctx
            .collect_kind(module, OpKind::KernelModule)
            .into_iter()
            .map(|m| ctx.op(m).sym_name().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a_kernels", "b_kernels"]);
    }
}
