//! Vulkan/SPIR-V target for halo.
//!
//! Lowers the dispatch and reduction functions of a `hal.executable` to a
//! SPIR-V module, reflects its buffer bindings into a pipeline layout and
//! attaches the packed [`SpirVExecutableDef`](proto::SpirVExecutableDef) as a
//! `hal.executable.binary`.

mod builder;
mod direct;
mod embedded;
pub mod executable;
pub mod layout;
mod lower;
pub mod options;
mod pipeline;
#[doc(hidden)]
pub mod proto;
pub mod spirv;
pub mod workgroup;

use std::sync::Arc;

use halo_backend_core::executable::{self as hal, SourceClone};
use halo_backend_core::{ExecutableTargetOptions, TARGETS, Target, TargetError};
use halo_ir::{
    Attribute, Context, Handle, OpBuilder, OpKind, Operation, OperationState, kernel, names,
};
use halo_opt::utils;

pub use direct::DirectToSpirv;
pub use embedded::{CATALOG, EmbeddedKernel};
pub use lower::KernelToSpirv;
pub use options::{VulkanSpirvTargetOptions, parse_workgroup_size};
pub use pipeline::Pipeline;

/// Registry key of the target.
pub const TARGET_NAME: &str = "vulkan-spirv";
/// `format` of the attached binaries.
pub const BINARY_FORMAT: &str = "HSPV";

/// The Vulkan/SPIR-V target.
#[derive(Debug, Default)]
pub struct VulkanSpirvTarget {
    options: VulkanSpirvTargetOptions,
}

impl VulkanSpirvTarget {
    pub fn new(options: VulkanSpirvTargetOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &VulkanSpirvTargetOptions {
        &self.options
    }
}

/// Registers the target with default options in [`TARGETS`].
///
/// Returns `false` if the key was already taken.
pub fn register() -> bool {
    register_with(VulkanSpirvTargetOptions::default())
}

/// Registers the target with `options` in [`TARGETS`].
pub fn register_with(options: VulkanSpirvTargetOptions) -> bool {
    TARGETS.register(Arc::new(VulkanSpirvTarget::new(options)))
}

/// A `hal.executable.entry_point` and the name it dispatches.
struct Entry {
    op: Handle<Operation>,
    name: String,
}

/// Entry points ordered by ordinal. Ordinals must be exactly `0..n`.
fn ordered_entries(ctx: &Context, executable: Handle<Operation>) -> Result<Vec<Entry>, TargetError> {
    let mut entries: Vec<(i64, Entry)> = hal::entry_points(ctx, executable)
        .into_iter()
        .map(|op| {
            let entry = ctx.op(op);
            let ordinal = entry.int_attr(names::ORDINAL).ok_or_else(|| {
                TargetError::serialization(ctx, op, "entry point has no ordinal")
            })?;
            let name = entry.sym_name().unwrap_or_default().to_string();
            Ok((ordinal, Entry { op, name }))
        })
        .collect::<Result<_, TargetError>>()?;
    entries.sort_by_key(|(ordinal, _)| *ordinal);
    for (position, (ordinal, entry)) in entries.iter().enumerate() {
        if *ordinal != position as i64 {
            return Err(TargetError::serialization(
                ctx,
                entry.op,
                format!("entry point '{}' has ordinal {ordinal}, expected {position}", entry.name),
            ));
        }
    }
    if entries.is_empty() {
        return Err(TargetError::serialization(ctx, executable, "executable has no entry points"));
    }
    Ok(entries.into_iter().map(|(_, entry)| entry).collect())
}

/// Replaces the body of `func` with a bare return, keeping its signature
/// and attributes.
fn strip_body(ctx: &mut Context, func: Handle<Operation>) -> Result<(), TargetError> {
    let block = ctx.body(func)?;
    let ops: Vec<_> = ctx.blocks[block].ops.iter().rev().copied().collect();
    for op in ops {
        ctx.erase_op(op);
    }
    let location = ctx.op(func).location.clone();
    OpBuilder::at_end(ctx, block)
        .with_location(location)
        .terminator(OpKind::Return, []);
    Ok(())
}

/// Everything the binary is built from, extracted from the lowered clone.
struct Lowered {
    program: kernel::Module,
    code: Vec<u32>,
    workgroup_sizes: Vec<[u32; 3]>,
}

impl VulkanSpirvTarget {
    fn lower(
        &self,
        ctx: &mut Context,
        executable: Handle<Operation>,
        entries: &[String],
    ) -> Result<Lowered, TargetError> {
        let mut clone = SourceClone::new(ctx, executable)?;
        let source = clone.module();
        let flow = hal::flow_executable(&clone, source)?;
        let inner = hal::inner_module(&clone, flow)?;
        let functions = workgroup::entry_functions(&clone, inner, entries)?;
        workgroup::assign_workgroup_sizes(&mut clone, &functions);

        let embedded = embedded::match_embedded(&clone, inner)?;
        let cached = match &embedded {
            Some(hit) => {
                utils::set_workgroup_size(&mut clone, hit.function, hit.kernel.workgroup_size);
                strip_body(&mut clone, hit.function)?;
                lower::attach_program(&mut clone, inner, hit.module())?;
                let code = hit
                    .code()
                    .map_err(|err| TargetError::serialization(&clone, inner, err.to_string()))?;
                Some(code)
            }
            None => {
                let pipeline = Pipeline::select(&clone, flow, &self.options);
                log::debug!(
                    "lowering '{}' through the {} pipeline",
                    clone.op(flow).sym_name().unwrap_or_default(),
                    pipeline.name()
                );
                pipeline.pass_manager(&self.options).run(&mut clone, inner)?;
                None
            }
        };

        let spirv_modules = hal::children(&clone, inner, OpKind::SpirvModule);
        let [spirv_module] = spirv_modules[..] else {
            return Err(TargetError::serialization(
                &clone,
                inner,
                format!("expected exactly one spv.module, found {}", spirv_modules.len()),
            ));
        };
        let Some(program) = clone.op(spirv_module).program.as_deref().cloned() else {
            return Err(TargetError::serialization(&clone, spirv_module, "spv.module has no program"));
        };

        let code = match cached {
            Some(code) => code.as_ref().clone(),
            None => spirv::serialize(&program)
                .map_err(|err| TargetError::serialization(&clone, spirv_module, err.to_string()))?,
        };
        if code.is_empty() {
            return Err(TargetError::serialization(&clone, spirv_module, "serialized SPIR-V is empty"));
        }
        if let Some(missing) = entries.iter().find(|name| program.entry_point(name).is_none()) {
            return Err(TargetError::serialization(
                &clone,
                spirv_module,
                format!("no SPIR-V entry point for '{missing}'"),
            ));
        }
        let workgroup_sizes = workgroup::workgroup_sizes(&clone, &functions)?;
        Ok(Lowered {
            program,
            code,
            workgroup_sizes,
        })
    }
}

impl Target for VulkanSpirvTarget {
    fn name(&self) -> &str {
        TARGET_NAME
    }

    fn translate(
        &self,
        ctx: &mut Context,
        executable: Handle<Operation>,
        _options: &ExecutableTargetOptions,
    ) -> Result<(), TargetError> {
        let entries = ordered_entries(ctx, executable)?;
        let entry_names: Vec<String> = entries.iter().map(|entry| entry.name.clone()).collect();
        let Lowered {
            program,
            code,
            workgroup_sizes,
        } = self.lower(ctx, executable, &entry_names)?;

        let def = proto::SpirVExecutableDef {
            entry_points: entry_names,
            code,
            pipeline_layout: Some(layout::pipeline_layout(&program)),
            workgroup_sizes: workgroup_sizes.iter().copied().map(Into::into).collect(),
        };
        let data = executable::pack(&def).map_err(|err| TargetError::Executable(Box::new(err)))?;

        for (entry, size) in entries.iter().zip(&workgroup_sizes) {
            ctx.op_mut(entry.op).set_attr(
                names::WORKGROUP_SIZE,
                Attribute::IntList(size.iter().map(|&v| i64::from(v)).collect()),
            );
        }
        let body = ctx.body(executable)?;
        let location = ctx.op(executable).location.clone();
        let binary = OpBuilder::at_end(ctx, body).insert(
            OperationState::new(OpKind::HalBinary, location.clone())
                .attr(names::FORMAT, Attribute::Str(BINARY_FORMAT.into()))
                .attr(names::DATA, Attribute::Bytes(data))
                .regions(1),
        );
        let region = ctx.op(binary).regions[0];
        let block = ctx.add_block(region);
        let module = OpBuilder::at_end(ctx, block)
            .insert(OperationState::new(OpKind::Module, location.clone()).regions(1));
        let module_region = ctx.op(module).regions[0];
        let module_body = ctx.add_block(module_region);
        let spirv_module = OpBuilder::at_end(ctx, module_body)
            .insert(OperationState::new(OpKind::SpirvModule, location));
        ctx.op_mut(spirv_module).program = Some(Box::new(program));

        log::info!(
            "attached {BINARY_FORMAT} binary with {} entry points to '{}'",
            def.entry_points.len(),
            ctx.op(executable).sym_name().unwrap_or_default()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_backend_core::executable::declare_executable;
    use halo_ir::{BinaryOp, FunctionType, Location, Scalar, Type};

    /// `hal.executable` with one dispatch entry per `(name, kind, shapes)`.
    fn executable(ctx: &mut Context, funcs: &[(&str, OpKind, [&[u32]; 3])]) -> Handle<Operation> {
        let block = ctx.module_body();
        let flow = OpBuilder::at_end(ctx, block).insert(
            OperationState::new(OpKind::FlowExecutable, Location::Unknown)
                .attr(names::SYM_NAME, Attribute::Str("exe".into()))
                .regions(1),
        );
        let region = ctx.op(flow).regions[0];
        let body = ctx.add_block(region);
        let mut b = OpBuilder::at_end(ctx, body);
        for (ordinal, (name, ..)) in funcs.iter().enumerate() {
            b.insert(
                OperationState::new(OpKind::DispatchEntry, Location::Unknown)
                    .attr(names::FUNCTION_REF, Attribute::SymbolRef(name.to_string()))
                    .attr(names::ORDINAL, Attribute::Int(ordinal as i64)),
            );
        }
        let inner = b.insert(OperationState::new(OpKind::Module, Location::Unknown).regions(1));
        let inner_region = ctx.op(inner).regions[0];
        let inner_body = ctx.add_block(inner_region);

        for (name, kind, shapes) in funcs {
            let inputs: Vec<_> = shapes
                .iter()
                .map(|dims| ctx.intern(Type::memref(dims, Scalar::F32)))
                .collect();
            let tensors: Vec<_> = shapes
                .iter()
                .map(|dims| ctx.intern(Type::tensor(dims, Scalar::F32)))
                .collect();
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
            ctx.append_op(inner_body, func);
            let func_region = ctx.op(func).regions[0];
            let entry = ctx.add_block(func_region);
            let args: Vec<_> = inputs.iter().map(|&ty| ctx.add_argument(entry, ty)).collect();
            let mut b = OpBuilder::at_end(ctx, entry);
            let x = b.value(OpKind::LoadInput, [args[0]], tensors[0]);
            let y = b.value(OpKind::LoadInput, [args[1]], tensors[1]);
            let z = b.value(*kind, [x, y], tensors[2]);
            b.insert(
                OperationState::new(OpKind::StoreOutput, Location::Unknown).operands([z, args[2]]),
            );
            b.terminator(OpKind::Return, []);
        }
        declare_executable(ctx, flow).unwrap()
    }

    fn binary(ctx: &Context, exe: Handle<Operation>) -> proto::SpirVExecutableDef {
        let binaries = hal::binaries(ctx, exe);
        assert_eq!(binaries.len(), 1);
        let op = ctx.op(binaries[0]);
        assert_eq!(op.str_attr(names::FORMAT), Some(BINARY_FORMAT));
        match op.attr(names::DATA) {
            Some(Attribute::Bytes(bytes)) => executable::unpack(bytes).unwrap(),
            other => panic!("unexpected data attribute {other:?}"),
        }
    }

    const ADD: OpKind = OpKind::Elementwise(BinaryOp::Add);

    #[test]
    fn elementwise_dispatches_are_packaged() {
        let mut ctx = Context::new();
        let exe = executable(
            &mut ctx,
            &[
                ("add", ADD, [&[64], &[64], &[64]]),
                ("mul", OpKind::Elementwise(BinaryOp::Mul), [&[8], &[8], &[8]]),
            ],
        );
        let target = VulkanSpirvTarget::default();
        target.translate(&mut ctx, exe, &ExecutableTargetOptions::default()).unwrap();

        let def = binary(&ctx, exe);
        assert_eq!(def.entry_points, vec!["add", "mul"]);
        assert_eq!(def.code[0], 0x0723_0203);
        let layout = def.pipeline_layout.unwrap();
        let bindings: Vec<_> = layout.descriptor_set_layouts[0]
            .bindings
            .iter()
            .map(|b| b.binding)
            .collect();
        assert_eq!(bindings, vec![0, 1, 2]);
        assert_eq!(<[u32; 3]>::from(def.workgroup_sizes[0]), workgroup::DEFAULT_WORKGROUP_SIZE);

        let entries = hal::entry_points(&ctx, exe);
        assert_eq!(ctx.op(entries[0]).int_list_attr(names::WORKGROUP_SIZE), Some(&[32, 1, 1][..]));
    }

    #[test]
    fn matmul_uses_the_embedded_kernel() {
        let mut ctx = Context::new();
        let exe = executable(&mut ctx, &[("mm", OpKind::Dot, [&[4, 8], &[8, 2], &[4, 2]])]);
        VulkanSpirvTarget::default()
            .translate(&mut ctx, exe, &ExecutableTargetOptions::default())
            .unwrap();
        let def = binary(&ctx, exe);
        assert_eq!(def.entry_points, vec!["mm"]);
        assert_eq!(<[u32; 3]>::from(def.workgroup_sizes[0]), [16, 16, 1]);
    }

    #[test]
    fn failures_leave_the_executable_untouched() {
        let mut ctx = Context::new();
        let exe = executable(&mut ctx, &[("dot", OpKind::Dot, [&[8], &[8], &[8]])]);
        let live = ctx.ops.len();
        let err = VulkanSpirvTarget::default()
            .translate(&mut ctx, exe, &ExecutableTargetOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("no direct lowering"), "{err}");
        assert!(hal::binaries(&ctx, exe).is_empty());
        assert_eq!(ctx.ops.len(), live);
        let entries = hal::entry_points(&ctx, exe);
        assert!(!ctx.op(entries[0]).has_attr(names::WORKGROUP_SIZE));
    }

    #[test]
    fn ordinal_gaps_are_rejected() {
        let mut ctx = Context::new();
        let exe = executable(
            &mut ctx,
            &[("a", ADD, [&[4], &[4], &[4]]), ("b", ADD, [&[4], &[4], &[4]])],
        );
        let second = hal::entry_points(&ctx, exe)[1];
        ctx.op_mut(second).set_attr(names::ORDINAL, Attribute::Int(5));
        let err = VulkanSpirvTarget::default()
            .translate(&mut ctx, exe, &ExecutableTargetOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("has ordinal 5, expected 1"));
    }

    #[test]
    fn target_is_registered_once() {
        register();
        assert!(TARGETS.contains(TARGET_NAME));
        assert!(!register_with(VulkanSpirvTargetOptions {
            use_linalg_path: true,
            linalg_workgroup_size: None,
        }));
    }
}
