//! `gpu.module` kernels to a `spv.module` hardware program.
//!
//! Every kernel of every kernel module becomes one entry point of a single
//! program. Kernel arguments become storage buffers at descriptor set 0,
//! bound by argument position. Loop nests become counted loops and buffer
//! accesses linearize their indices row-major over the static extents.

use std::collections::HashMap;

use halo_ir::kernel::{self, BinaryOp, EntryPoint, Expression, GlobalVariable, ResourceBinding, StorageAccess};
use halo_ir::{
    Block, Context, Handle, OpBuilder, OpKind, Operation, OperationState, Scalar, SymbolTable,
    Type, Value, names,
};
use halo_opt::{Pass, PassError, utils};

use crate::builder::{FunctionBuilder, literal_for};

type Expr = Handle<Expression>;

/// Converts outlined kernels into a `spv.module`.
#[derive(Debug)]
pub struct KernelToSpirv;

impl Pass for KernelToSpirv {
    fn name(&self) -> &str {
        "kernel-to-spirv"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let body = ctx.body(module)?;
        let kernel_modules: Vec<_> = ctx.blocks[body]
            .ops
            .iter()
            .copied()
            .filter(|&op| ctx.op(op).kind == OpKind::KernelModule)
            .collect();
        if kernel_modules.is_empty() {
            return Ok(false);
        }

        let symbols = SymbolTable::build(ctx, module)?;
        let mut program = kernel::Module::default();
        for &kernel_module in &kernel_modules {
            for kernel in ctx.collect_kind(kernel_module, OpKind::KernelFunc) {
                let entry = lower_kernel(ctx, &symbols, &mut program, kernel)?;
                program.entry_points.push(entry);
            }
        }
        for kernel_module in kernel_modules {
            ctx.erase_op(kernel_module);
        }
        log::debug!(
            "converted {} kernels into a spv.module",
            program.entry_points.len()
        );
        attach_program(ctx, module, program)?;
        Ok(true)
    }
}

/// Appends a `spv.module` carrying `program` to the body of `module`.
pub(crate) fn attach_program(
    ctx: &mut Context,
    module: Handle<Operation>,
    program: kernel::Module,
) -> Result<Handle<Operation>, PassError> {
    let body = ctx.body(module)?;
    let location = ctx.op(module).location.clone();
    let op = OpBuilder::at_end(ctx, body).insert(OperationState::new(OpKind::SpirvModule, location));
    ctx.op_mut(op).program = Some(Box::new(program));
    Ok(op)
}

/// Element scalar and static extents of a buffer value.
pub(crate) fn static_buffer(ctx: &Context, value: Value) -> Option<(Scalar, Vec<u32>)> {
    match ctx.value_type(value) {
        Type::MemRef { shape, scalar } => {
            let dims = shape
                .static_dims()?
                .into_iter()
                .map(|d| u32::try_from(d).ok())
                .collect::<Option<Vec<_>>>()?;
            Some((*scalar, dims))
        }
        _ => None,
    }
}

/// A kernel argument bound to a storage buffer.
#[derive(Clone, Debug)]
struct Buffer {
    global: Handle<GlobalVariable>,
    dims: Vec<u32>,
}

fn lower_kernel(
    ctx: &Context,
    symbols: &SymbolTable,
    program: &mut kernel::Module,
    kernel: Handle<Operation>,
) -> Result<EntryPoint, PassError> {
    let name = ctx
        .op(kernel)
        .sym_name()
        .ok_or_else(|| PassError::structural(ctx, kernel, "kernel has no name"))?
        .to_string();
    let func = symbols
        .lookup(&name)
        .filter(|&op| ctx.op(op).kind == OpKind::Func)
        .ok_or_else(|| {
            PassError::structural(ctx, kernel, format!("no dispatch function for kernel '{name}'"))
        })?;
    let workgroup_size = utils::workgroup_size(ctx, func)?;

    let buffers = declare_arguments(ctx, program, kernel, &name)?;
    let mut lowering = KernelLowering {
        ctx,
        fb: FunctionBuilder::new(&name),
        buffers,
        values: HashMap::new(),
        depth: 0,
    };
    lowering.lower_block(ctx.body(kernel)?)?;
    Ok(EntryPoint {
        name,
        workgroup_size,
        function: lowering.fb.finish(),
    })
}

/// Declares one buffer per shaped kernel argument, with access derived from
/// the loads and stores that address it.
fn declare_arguments(
    ctx: &Context,
    program: &mut kernel::Module,
    kernel: Handle<Operation>,
    name: &str,
) -> Result<HashMap<Value, Buffer>, PassError> {
    let args = ctx.arguments(kernel)?;
    let mut access: HashMap<Value, StorageAccess> = HashMap::new();
    for op in ctx.walk(kernel) {
        let operation = ctx.op(op);
        let (slot, flag) = match operation.kind {
            OpKind::Load => (0, StorageAccess::LOAD),
            OpKind::Store => (1, StorageAccess::STORE),
            _ => continue,
        };
        if let Some(&buffer) = operation.operands.get(slot) {
            *access.entry(buffer).or_insert(StorageAccess::EMPTY) |= flag;
        }
    }

    let mut buffers = HashMap::new();
    for (index, &arg) in args.iter().enumerate() {
        let Some((scalar, dims)) = static_buffer(ctx, arg) else {
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
        buffers.insert(arg, Buffer { global, dims });
    }
    Ok(buffers)
}

struct KernelLowering<'a> {
    ctx: &'a Context,
    fb: FunctionBuilder,
    buffers: HashMap<Value, Buffer>,
    values: HashMap<Value, Expr>,
    depth: usize,
}

impl KernelLowering<'_> {
    fn lower_block(&mut self, block: Handle<Block>) -> Result<(), PassError> {
        let ctx = self.ctx;
        for &op in &ctx.blocks[block].ops {
            self.lower_op(op)?;
        }
        Ok(())
    }

    fn lower_op(&mut self, op: Handle<Operation>) -> Result<(), PassError> {
        let ctx = self.ctx;
        let operation = ctx.op(op);
        match operation.kind {
            OpKind::GlobalId => {
                let axis = operation
                    .int_attr(names::DIMENSION)
                    .and_then(|d| u32::try_from(d).ok())
                    .filter(|&d| d < 3)
                    .ok_or_else(|| PassError::structural(ctx, op, "global id has no valid dimension"))?;
                let id = self.fb.global_id(axis);
                self.bind(op, id);
            }
            OpKind::ConstantIndex => {
                let value = operation
                    .int_attr(names::VALUE)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| PassError::unsupported(ctx, op, "index constant out of range"))?;
                let literal = self.fb.u32(value);
                self.bind(op, literal);
            }
            OpKind::Constant => {
                let scalar = operation
                    .results
                    .first()
                    .and_then(|&r| ctx.value_type(r).element_scalar())
                    .ok_or_else(|| PassError::structural(ctx, op, "constant has no scalar result"))?;
                let literal = operation
                    .attr(names::VALUE)
                    .and_then(|v| literal_for(scalar, v))
                    .ok_or_else(|| {
                        PassError::unsupported(ctx, op, format!("constant of type {scalar:?}"))
                    })?;
                let literal = self.fb.literal(literal);
                self.bind(op, literal);
            }
            OpKind::Arith(arith) => {
                let [left, right] = self.operands(op)?;
                let value = self.fb.arith(arith, left, right);
                self.bind(op, value);
            }
            OpKind::CmpEq => {
                let [left, right] = self.operands(op)?;
                let value = self.fb.binary(BinaryOp::Equal, left, right);
                self.bind(op, value);
            }
            OpKind::Select => {
                let [condition, accept, reject] = self.operands(op)?;
                let value = self.fb.select(condition, accept, reject);
                self.bind(op, value);
            }
            OpKind::Load => {
                let pointer = self.element(op, 0, 1)?;
                let value = self.fb.load(pointer);
                self.bind(op, value);
            }
            OpKind::Store => {
                let value = self.operand(op, 0)?;
                let pointer = self.element(op, 1, 2)?;
                self.fb.store(pointer, value);
            }
            OpKind::For => {
                let [lb, ub, step] = self.operands(op)?;
                let body = ctx.body(op)?;
                let iv = ctx.blocks[body].arguments.first().copied().ok_or_else(|| {
                    PassError::structural(ctx, op, "loop body has no induction variable")
                })?;
                let counted = self.fb.begin_loop(&format!("iv{}", self.depth), lb, ub);
                self.values.insert(iv, counted.index);
                self.depth += 1;
                self.lower_block(body)?;
                self.depth -= 1;
                self.fb.end_loop(counted, step);
            }
            OpKind::LoopYield | OpKind::KernelReturn => {}
            kind => {
                return Err(PassError::unsupported(
                    ctx,
                    op,
                    format!("'{}' inside a kernel", kind.name()),
                ));
            }
        }
        Ok(())
    }

    fn bind(&mut self, op: Handle<Operation>, expr: Expr) {
        if let Some(&result) = self.ctx.op(op).results.first() {
            self.values.insert(result, expr);
        }
    }

    fn operand(&self, op: Handle<Operation>, index: usize) -> Result<Expr, PassError> {
        let value = *self
            .ctx
            .op(op)
            .operands
            .get(index)
            .ok_or_else(|| PassError::structural(self.ctx, op, format!("missing operand #{index}")))?;
        self.values.get(&value).copied().ok_or_else(|| {
            PassError::unsupported(self.ctx, op, format!("operand #{index} is not a kernel scalar"))
        })
    }

    fn operands<const N: usize>(&self, op: Handle<Operation>) -> Result<[Expr; N], PassError> {
        let count = self.ctx.op(op).operands.len();
        if count != N {
            return Err(PassError::structural(
                self.ctx,
                op,
                format!("expected {N} operands, found {count}"),
            ));
        }
        let exprs = (0..N)
            .map(|i| self.operand(op, i))
            .collect::<Result<Vec<_>, _>>()?;
        exprs
            .try_into()
            .map_err(|_| PassError::structural(self.ctx, op, "operand count changed"))
    }

    /// Pointer to the element addressed by a load or store.
    fn element(
        &mut self,
        op: Handle<Operation>,
        buffer_slot: usize,
        first_index: usize,
    ) -> Result<Expr, PassError> {
        let ctx = self.ctx;
        let operands = &ctx.op(op).operands;
        let buffer = operands
            .get(buffer_slot)
            .and_then(|v| self.buffers.get(v))
            .cloned()
            .ok_or_else(|| PassError::unsupported(ctx, op, "access to a value that is not a kernel buffer"))?;
        let indices = (first_index..operands.len())
            .map(|i| self.operand(op, i))
            .collect::<Result<Vec<_>, _>>()?;
        if !indices.is_empty() && indices.len() != buffer.dims.len() {
            return Err(PassError::structural(
                ctx,
                op,
                format!(
                    "{} indices into a rank-{} buffer",
                    indices.len(),
                    buffer.dims.len()
                ),
            ));
        }
        let base = self.fb.global(buffer.global);
        let offset = self.fb.linearize(&indices, &buffer.dims);
        Ok(self.fb.element(base, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_ir::{Attribute, BinaryOp as Op, FunctionType, Location};
    use halo_opt::{ElementwiseToGeneric, GenericToLaunch, KernelOutlining};

    fn outlined_add(ctx: &mut Context, workgroup: Option<[u32; 3]>) -> Handle<Operation> {
        let buffer = ctx.intern(Type::memref(&[4, 8], Scalar::F32));
        let tensor = ctx.intern(Type::tensor(&[4, 8], Scalar::F32));
        let func = ctx.create_function(
            "add",
            FunctionType {
                inputs: vec![buffer; 3],
                results: vec![],
            },
            true,
            Location::Unknown,
        );
        ctx.op_mut(func).set_attr(names::EXPORT, Attribute::Unit);
        if let Some(size) = workgroup {
            utils::set_workgroup_size(ctx, func, size);
        }
        let block = ctx.body(func).unwrap();
        let args = ctx.arguments(func).unwrap();
        let mut b = OpBuilder::at_end(ctx, block);
        let x = b.value(OpKind::LoadInput, [args[0]], tensor);
        let y = b.value(OpKind::LoadInput, [args[1]], tensor);
        let sum = b.value(OpKind::Elementwise(Op::Add), [x, y], tensor);
        b.insert(OperationState::new(OpKind::StoreOutput, Location::Unknown).operands([sum, args[2]]));
        b.terminator(OpKind::Return, []);
        let module = ctx.module();
        ElementwiseToGeneric.run(ctx, module).unwrap();
        GenericToLaunch.run(ctx, module).unwrap();
        KernelOutlining.run(ctx, module).unwrap();
        func
    }

    fn program(ctx: &Context) -> &kernel::Module {
        let module = ctx.module();
        let spv = ctx.collect_kind(module, OpKind::SpirvModule);
        assert_eq!(spv.len(), 1);
        ctx.op(spv[0]).program.as_deref().unwrap()
    }

    #[test]
    fn kernels_become_entry_points() {
        let mut ctx = Context::new();
        outlined_add(&mut ctx, Some([32, 1, 1]));
        let module = ctx.module();
        assert!(KernelToSpirv.run(&mut ctx, module).unwrap());
        assert!(ctx.collect_kind(module, OpKind::KernelModule).is_empty());

        let program = program(&ctx);
        assert_eq!(program.entry_points.len(), 1);
        let entry = &program.entry_points[0];
        assert_eq!(entry.name, "add");
        assert_eq!(entry.workgroup_size, [32, 1, 1]);

        let globals: Vec<_> = program
            .globals
            .iter()
            .map(|(_, g)| (g.name.clone().unwrap(), g.binding.binding, g.access))
            .collect();
        assert_eq!(
            globals,
            vec![
                ("add.arg0".to_string(), 0, StorageAccess::LOAD),
                ("add.arg1".to_string(), 1, StorageAccess::LOAD),
                ("add.arg2".to_string(), 2, StorageAccess::STORE),
            ]
        );
        assert!(crate::spirv::serialize(program).is_ok());
    }

    #[test]
    fn loop_nest_is_preserved() {
        let mut ctx = Context::new();
        outlined_add(&mut ctx, Some([32, 1, 1]));
        let module = ctx.module();
        KernelToSpirv.run(&mut ctx, module).unwrap();
        let function = &program(&ctx).entry_points[0].function;
        assert_eq!(function.local_variables.len(), 2);
        let loops = function
            .body
            .iter()
            .filter(|s| matches!(s, kernel::Statement::Loop { .. }))
            .count();
        assert_eq!(loops, 1);
    }

    #[test]
    fn missing_workgroup_size_fails() {
        let mut ctx = Context::new();
        outlined_add(&mut ctx, None);
        let module = ctx.module();
        let err = KernelToSpirv.run(&mut ctx, module).unwrap_err();
        assert!(err.to_string().contains("unable to find workgroup size"));
    }

    #[test]
    fn unknown_ops_are_unsupported() {
        let mut ctx = Context::new();
        outlined_add(&mut ctx, Some([32, 1, 1]));
        let module = ctx.module();
        let kernel = ctx.collect_kind(module, OpKind::KernelFunc)[0];
        let body = ctx.body(kernel).unwrap();
        let tensor = ctx.intern(Type::tensor(&[2, 2], Scalar::F32));
        OpBuilder::new(&mut ctx, halo_ir::InsertionPoint { block: body, index: 0 })
            .value(OpKind::Dot, [], tensor);
        let err = KernelToSpirv.run(&mut ctx, module).unwrap_err();
        assert!(matches!(err, PassError::Unsupported { .. }));
        assert!(err.to_string().contains("hlo.dot"));
    }

    #[test]
    fn modules_without_kernels_are_untouched() {
        let mut ctx = Context::new();
        let module = ctx.module();
        assert!(!KernelToSpirv.run(&mut ctx, module).unwrap());
        assert!(ctx.collect_kind(module, OpKind::SpirvModule).is_empty());
    }
}
