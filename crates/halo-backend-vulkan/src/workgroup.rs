//! Workgroup sizes of dispatch entries.
//!
//! The heuristic only knows two op shapes. Anything else gets a flat
//! default, which may mis-size launches of unrecognized kernels.

use halo_backend_core::TargetError;
use halo_ir::{Context, Handle, OpKind, Operation, SymbolTable, names};
use halo_opt::utils;

/// Workgroup size of functions containing a dot product.
pub const DOT_WORKGROUP_SIZE: [u32; 3] = [16, 16, 1];
/// Workgroup size of functions containing a convolution.
pub const CONV_WORKGROUP_SIZE: [u32; 3] = [1, 1, 1];
/// Workgroup size of everything else.
pub const DEFAULT_WORKGROUP_SIZE: [u32; 3] = [32, 1, 1];

/// Best-effort workgroup size for `func` from the ops in its body.
pub fn guess_workgroup_size(ctx: &Context, func: Handle<Operation>) -> [u32; 3] {
    let ops = ctx.walk(func);
    let contains = |kind: OpKind| ops.iter().any(|&op| ctx.op(op).kind == kind);
    if contains(OpKind::Dot) {
        DOT_WORKGROUP_SIZE
    } else if contains(OpKind::Conv) {
        CONV_WORKGROUP_SIZE
    } else {
        log::warn!(
            "no workgroup size heuristic matches '{}', using {DEFAULT_WORKGROUP_SIZE:?}",
            ctx.op(func).sym_name().unwrap_or_default()
        );
        DEFAULT_WORKGROUP_SIZE
    }
}

/// Resolves each entry name to its function in `inner`.
pub fn entry_functions(
    ctx: &Context,
    inner: Handle<Operation>,
    entries: &[String],
) -> Result<Vec<Handle<Operation>>, TargetError> {
    let symbols = SymbolTable::build(ctx, inner)?;
    entries
        .iter()
        .map(|name| {
            symbols
                .lookup(name)
                .filter(|&func| ctx.op(func).kind == OpKind::Func)
                .ok_or_else(|| TargetError::MissingSource {
                    location: ctx.op(inner).location.clone(),
                    message: format!("no function for entry point '{name}'"),
                })
        })
        .collect()
}

/// Gives every function without an explicit size the heuristic one.
pub fn assign_workgroup_sizes(ctx: &mut Context, functions: &[Handle<Operation>]) {
    for &func in functions {
        if ctx.op(func).has_attr(names::EXECUTABLE_WORKGROUP_SIZE) {
            continue;
        }
        let size = guess_workgroup_size(ctx, func);
        log::debug!(
            "workgroup size of '{}' guessed as {size:?}",
            ctx.op(func).sym_name().unwrap_or_default()
        );
        utils::set_workgroup_size(ctx, func, size);
    }
}

/// Current workgroup sizes of `functions`, in order.
pub fn workgroup_sizes(
    ctx: &Context,
    functions: &[Handle<Operation>],
) -> Result<Vec<[u32; 3]>, TargetError> {
    functions
        .iter()
        .map(|&func| utils::workgroup_size(ctx, func).map_err(TargetError::from))
        .collect()
}
