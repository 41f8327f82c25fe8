//! `hal.executable` structure.
//!
//! ```text
//! hal.executable @name {
//!   hal.executable.entry_point @fn {ordinal, workgroup_size}
//!   builtin.module {
//!     flow.executable @name {
//!       flow.dispatch.entry @fn {function_ref, workload, ordinal}
//!       builtin.module { func.func @fn ... }
//!     }
//!   }
//!   hal.executable.binary {format, data} { builtin.module { spv.module } }
//! }
//! ```

use std::ops::{Deref, DerefMut};

use halo_ir::{
    Attribute, Context, Handle, InsertionPoint, OpBuilder, OpKind, Operation, OperationState,
    ValueMap, names,
};

use crate::TargetError;

/// Ops of `kind` directly inside the first block of `op`.
pub fn children(ctx: &Context, op: Handle<Operation>, kind: OpKind) -> Vec<Handle<Operation>> {
    let Ok(block) = ctx.body(op) else {
        return Vec::new();
    };
    ctx.blocks[block]
        .ops
        .iter()
        .copied()
        .filter(|&child| ctx.op(child).kind == kind)
        .collect()
}

fn single_child(
    ctx: &Context,
    op: Handle<Operation>,
    kind: OpKind,
) -> Result<Handle<Operation>, TargetError> {
    match children(ctx, op, kind).as_slice() {
        [child] => Ok(*child),
        found => Err(TargetError::MissingSource {
            location: ctx.op(op).location.clone(),
            message: format!(
                "expected exactly one '{}' in '{}', found {}",
                kind.name(),
                ctx.op(op).kind.name(),
                found.len()
            ),
        }),
    }
}

/// Wraps `flow_executable` into a new `hal.executable` at its position.
///
/// Every flow entry gets a `hal.executable.entry_point` carrying its ordinal.
/// Entries without an explicit ordinal are numbered by position.
pub fn declare_executable(
    ctx: &mut Context,
    flow_executable: Handle<Operation>,
) -> Result<Handle<Operation>, TargetError> {
    let location = ctx.op(flow_executable).location.clone();
    let Some((block, index)) = ctx.position(flow_executable) else {
        return Err(TargetError::MissingSource {
            location,
            message: "flow executable is detached".into(),
        });
    };
    let name = ctx.op(flow_executable).sym_name().unwrap_or_default().to_string();
    let entries: Vec<(String, i64)> = flow_entries(ctx, flow_executable)
        .into_iter()
        .enumerate()
        .map(|(position, entry)| {
            let op = ctx.op(entry);
            (
                op.symbol_attr(names::FUNCTION_REF).unwrap_or_default().to_string(),
                op.int_attr(names::ORDINAL).unwrap_or(position as i64),
            )
        })
        .collect();

    ctx.detach_op(flow_executable);
    let executable = OpBuilder::new(ctx, InsertionPoint { block, index }).insert(
        OperationState::new(OpKind::HalExecutable, location.clone())
            .attr(names::SYM_NAME, Attribute::Str(name))
            .regions(1),
    );
    let region = ctx.op(executable).regions[0];
    let body = ctx.add_block(region);
    let mut b = OpBuilder::at_end(ctx, body).with_location(location.clone());
    for (entry, ordinal) in entries {
        b.insert(
            OperationState::new(OpKind::HalEntryPoint, location.clone())
                .attr(names::SYM_NAME, Attribute::Str(entry))
                .attr(names::ORDINAL, Attribute::Int(ordinal)),
        );
    }
    let source = b.insert(OperationState::new(OpKind::Module, location).regions(1));
    let source_region = ctx.op(source).regions[0];
    let source_body = ctx.add_block(source_region);
    ctx.append_op(source_body, flow_executable);
    Ok(executable)
}

/// The source `builtin.module` of a `hal.executable`.
pub fn source_module(
    ctx: &Context,
    executable: Handle<Operation>,
) -> Result<Handle<Operation>, TargetError> {
    single_child(ctx, executable, OpKind::Module)
}

/// The `flow.executable` inside a source module.
pub fn flow_executable(
    ctx: &Context,
    source: Handle<Operation>,
) -> Result<Handle<Operation>, TargetError> {
    single_child(ctx, source, OpKind::FlowExecutable)
}

/// The `builtin.module` holding the functions of a `flow.executable`.
pub fn inner_module(
    ctx: &Context,
    flow_executable: Handle<Operation>,
) -> Result<Handle<Operation>, TargetError> {
    single_child(ctx, flow_executable, OpKind::Module)
}

/// Dispatch and reduction entries of a `flow.executable`, in order.
pub fn flow_entries(ctx: &Context, flow_executable: Handle<Operation>) -> Vec<Handle<Operation>> {
    let Ok(block) = ctx.body(flow_executable) else {
        return Vec::new();
    };
    ctx.blocks[block]
        .ops
        .iter()
        .copied()
        .filter(|&op| matches!(ctx.op(op).kind, OpKind::DispatchEntry | OpKind::ReductionEntry))
        .collect()
}

/// Entry points of a `hal.executable`, in declaration order.
pub fn entry_points(ctx: &Context, executable: Handle<Operation>) -> Vec<Handle<Operation>> {
    children(ctx, executable, OpKind::HalEntryPoint)
}

/// Binaries already attached to a `hal.executable`.
pub fn binaries(ctx: &Context, executable: Handle<Operation>) -> Vec<Handle<Operation>> {
    children(ctx, executable, OpKind::HalBinary)
}

/// A private copy of an executable's source module, erased when dropped.
///
/// Targets lower the copy so the shared source stays intact for the next
/// target, whatever path the translation exits through.
pub struct SourceClone<'a> {
    ctx: &'a mut Context,
    module: Handle<Operation>,
}

impl<'a> SourceClone<'a> {
    /// Deep-copies the source module of `executable`.
    pub fn new(ctx: &'a mut Context, executable: Handle<Operation>) -> Result<Self, TargetError> {
        let source = source_module(ctx, executable)?;
        let module = ctx.clone_op(source, &mut ValueMap::new());
        Ok(Self { ctx, module })
    }

    /// The detached cloned `builtin.module`.
    pub fn module(&self) -> Handle<Operation> {
        self.module
    }
}

impl Deref for SourceClone<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.ctx
    }
}

impl DerefMut for SourceClone<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx
    }
}

impl Drop for SourceClone<'_> {
    fn drop(&mut self) {
        self.ctx.erase_op(self.module);
    }
}
