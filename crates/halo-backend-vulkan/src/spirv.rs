//! SPIR-V serialization of hardware programs.
//!
//! Every storage buffer becomes a `StorageBuffer` variable holding a block
//! struct around a runtime array. Entry points are `GLCompute` functions
//! reading `GlobalInvocationId` from a shared input variable.

use std::collections::HashMap;

use halo_ir::kernel::{
    BinaryOp, Expression, Function, GlobalVariable, Literal, LocalVariable, MathFunction, Module,
    ResolvedType, Statement,
};
use halo_ir::{Handle, IrError, Scalar, ScalarKind};
use rspirv::binary::Assemble;
use rspirv::dr::{self, Builder, Operand};
use rspirv::spirv::{self, Word};

/// SPIR-V version written into the module header.
pub const SPIRV_VERSION: (u8, u8) = (1, 3);

/// `GLSL.std.450` instruction numbers.
mod glsl {
    pub const F_MIN: u32 = 37;
    pub const U_MIN: u32 = 38;
    pub const S_MIN: u32 = 39;
    pub const F_MAX: u32 = 40;
    pub const U_MAX: u32 = 41;
    pub const S_MAX: u32 = 42;
}

/// Errors raised while serializing a hardware program.
#[derive(Debug, thiserror::Error)]
pub enum SpirvError {
    #[error("SPIR-V builder error: {0}")]
    Build(#[from] dr::Error),
    #[error(transparent)]
    Kernel(#[from] IrError),
    #[error("scalar type {0:?} is not supported")]
    UnsupportedScalar(Scalar),
    #[error("entry point '{entry}': {message}")]
    Malformed { entry: String, message: String },
}

/// Serializes `module` to SPIR-V words.
pub fn serialize(module: &Module) -> Result<Vec<u32>, SpirvError> {
    Writer::new(module).write()
}

/// Little-endian bytes of a word stream.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

struct Writer<'m> {
    module: &'m Module,
    b: Builder,
    glsl: Word,
    void: Word,
    scalars: HashMap<Scalar, Word>,
    constants: HashMap<(Scalar, u32), Word>,
    buffers: HashMap<Handle<GlobalVariable>, Word>,
    uvec3: Word,
    global_id: Word,
}

/// Per-function emission state.
struct FunctionState<'f> {
    function: &'f Function,
    name: &'f str,
    exprs: HashMap<Handle<Expression>, Word>,
    locals: HashMap<Handle<LocalVariable>, Word>,
    loop_merges: Vec<Word>,
}

impl FunctionState<'_> {
    fn malformed(&self, message: impl Into<String>) -> SpirvError {
        SpirvError::Malformed {
            entry: self.name.to_string(),
            message: message.into(),
        }
    }
}

impl<'m> Writer<'m> {
    fn new(module: &'m Module) -> Self {
        let mut b = Builder::new();
        b.set_version(SPIRV_VERSION.0, SPIRV_VERSION.1);
        b.capability(spirv::Capability::Shader);
        b.memory_model(spirv::AddressingModel::Logical, spirv::MemoryModel::GLSL450);
        let glsl = b.ext_inst_import("GLSL.std.450");
        let void = b.type_void();
        let u32_ty = b.type_int(32, 0);
        let uvec3 = b.type_vector(u32_ty, 3);
        let gid_ptr = b.type_pointer(None, spirv::StorageClass::Input, uvec3);
        let global_id = b.variable(gid_ptr, None, spirv::StorageClass::Input, None);
        b.decorate(
            global_id,
            spirv::Decoration::BuiltIn,
            [Operand::BuiltIn(spirv::BuiltIn::GlobalInvocationId)],
        );
        let mut scalars = HashMap::new();
        scalars.insert(Scalar::U32, u32_ty);
        Self {
            module,
            b,
            glsl,
            void,
            scalars,
            constants: HashMap::new(),
            buffers: HashMap::new(),
            uvec3,
            global_id,
        }
    }

    fn write(mut self) -> Result<Vec<u32>, SpirvError> {
        self.declare_buffers()?;
        for ep in &self.module.entry_points {
            if ep.workgroup_size.contains(&0) {
                return Err(SpirvError::Malformed {
                    entry: ep.name.clone(),
                    message: format!("invalid workgroup size {:?}", ep.workgroup_size),
                });
            }
            let id = self.write_function(&ep.name, &ep.function)?;
            self.b.entry_point(
                spirv::ExecutionModel::GLCompute,
                id,
                ep.name.clone(),
                vec![self.global_id],
            );
            let [x, y, z] = ep.workgroup_size;
            self.b
                .execution_mode(id, spirv::ExecutionMode::LocalSize, [x, y, z]);
        }
        Ok(self.b.module().assemble())
    }

    fn scalar_type(&mut self, scalar: Scalar) -> Result<Word, SpirvError> {
        if let Some(&id) = self.scalars.get(&scalar) {
            return Ok(id);
        }
        let id = match (scalar.kind, scalar.width) {
            (ScalarKind::Bool, _) => self.b.type_bool(),
            (ScalarKind::Sint, 4) => self.b.type_int(32, 1),
            (ScalarKind::Uint, 4) => self.b.type_int(32, 0),
            (ScalarKind::Float, 4) => self.b.type_float(32),
            _ => return Err(SpirvError::UnsupportedScalar(scalar)),
        };
        self.scalars.insert(scalar, id);
        Ok(id)
    }

    fn value_type(&mut self, ty: ResolvedType) -> Result<Word, SpirvError> {
        self.scalar_type(ty.scalar())
    }

    fn constant(&mut self, literal: Literal) -> Result<Word, SpirvError> {
        let scalar = literal.scalar();
        let key = (scalar, literal.bits());
        if let Some(&id) = self.constants.get(&key) {
            return Ok(id);
        }
        let ty = self.scalar_type(scalar)?;
        let id = match literal {
            Literal::Bool(true) => self.b.constant_true(ty),
            Literal::Bool(false) => self.b.constant_false(ty),
            other => self.b.constant_bit32(ty, other.bits()),
        };
        self.constants.insert(key, id);
        Ok(id)
    }

    fn declare_buffers(&mut self) -> Result<(), SpirvError> {
        let mut blocks: HashMap<Scalar, Word> = HashMap::new();
        for (handle, global) in self.module.globals.iter() {
            if global.scalar.kind == ScalarKind::Bool {
                return Err(SpirvError::UnsupportedScalar(global.scalar));
            }
            let block_ptr = match blocks.get(&global.scalar) {
                Some(&ptr) => ptr,
                None => {
                    let element = self.scalar_type(global.scalar)?;
                    let array = self.b.type_runtime_array(element);
                    self.b.decorate(
                        array,
                        spirv::Decoration::ArrayStride,
                        [Operand::LiteralBit32(u32::from(global.scalar.width))],
                    );
                    let block = self.b.type_struct([array]);
                    self.b.decorate(block, spirv::Decoration::Block, []);
                    self.b.member_decorate(
                        block,
                        0,
                        spirv::Decoration::Offset,
                        [Operand::LiteralBit32(0)],
                    );
                    let ptr = self
                        .b
                        .type_pointer(None, spirv::StorageClass::StorageBuffer, block);
                    blocks.insert(global.scalar, ptr);
                    ptr
                }
            };
            let var = self
                .b
                .variable(block_ptr, None, spirv::StorageClass::StorageBuffer, None);
            self.b.decorate(
                var,
                spirv::Decoration::DescriptorSet,
                [Operand::LiteralBit32(global.binding.set)],
            );
            self.b.decorate(
                var,
                spirv::Decoration::Binding,
                [Operand::LiteralBit32(global.binding.binding)],
            );
            if let Some(name) = &global.name {
                self.b.name(var, name.clone());
            }
            self.buffers.insert(handle, var);
        }
        Ok(())
    }

    fn write_function(&mut self, name: &str, function: &Function) -> Result<Word, SpirvError> {
        let fn_ty = self.b.type_function(self.void, vec![]);
        let id = self.b.begin_function(
            self.void,
            None,
            spirv::FunctionControl::NONE,
            fn_ty,
        )?;
        self.b.name(id, name.to_string());
        self.b.begin_block(None)?;

        let mut state = FunctionState {
            function,
            name,
            exprs: HashMap::new(),
            locals: HashMap::new(),
            loop_merges: Vec::new(),
        };
        for (handle, local) in function.local_variables.iter() {
            let ty = self.scalar_type(local.scalar)?;
            let ptr = self.b.type_pointer(None, spirv::StorageClass::Function, ty);
            let init = local.init.map(|lit| self.constant(lit)).transpose()?;
            let var = self
                .b
                .variable(ptr, None, spirv::StorageClass::Function, init);
            state.locals.insert(handle, var);
        }

        if !self.write_block(&mut state, &function.body)? {
            self.b.ret()?;
        }
        self.b.end_function()?;
        Ok(id)
    }

    /// Writes `block`. Returns `true` if it ended in a terminator.
    fn write_block(
        &mut self,
        state: &mut FunctionState<'_>,
        block: &[Statement],
    ) -> Result<bool, SpirvError> {
        for statement in block {
            match statement {
                Statement::Emit(list) => {
                    for &expr in list {
                        self.expr(state, expr)?;
                    }
                }
                Statement::Store { pointer, value } => {
                    let pointer = self.expr(state, *pointer)?;
                    let value = self.expr(state, *value)?;
                    self.b.store(pointer, value, None, [])?;
                }
                Statement::If {
                    condition,
                    accept,
                    reject,
                } => {
                    let condition = self.expr(state, *condition)?;
                    let merge = self.b.id();
                    let accept_id = self.b.id();
                    let reject_id = if reject.is_empty() { merge } else { self.b.id() };
                    self.b
                        .selection_merge(merge, spirv::SelectionControl::NONE)?;
                    self.b
                        .branch_conditional(condition, accept_id, reject_id, [])?;

                    self.b.begin_block(Some(accept_id))?;
                    let accept_done = self.write_block(state, accept)?;
                    if !accept_done {
                        self.b.branch(merge)?;
                    }
                    let reject_done = if reject.is_empty() {
                        false
                    } else {
                        self.b.begin_block(Some(reject_id))?;
                        let done = self.write_block(state, reject)?;
                        if !done {
                            self.b.branch(merge)?;
                        }
                        done
                    };

                    self.b.begin_block(Some(merge))?;
                    if accept_done && reject_done {
                        self.b.unreachable()?;
                        return Ok(true);
                    }
                }
                Statement::Loop {
                    body,
                    continuing,
                    break_if,
                } => {
                    let header = self.b.id();
                    let body_id = self.b.id();
                    let continue_id = self.b.id();
                    let merge = self.b.id();
                    self.b.branch(header)?;

                    self.b.begin_block(Some(header))?;
                    self.b
                        .loop_merge(merge, continue_id, spirv::LoopControl::NONE, [])?;
                    self.b.branch(body_id)?;

                    self.b.begin_block(Some(body_id))?;
                    state.loop_merges.push(merge);
                    if !self.write_block(state, body)? {
                        self.b.branch(continue_id)?;
                    }

                    self.b.begin_block(Some(continue_id))?;
                    let continuing_done = self.write_block(state, continuing)?;
                    state.loop_merges.pop();
                    if !continuing_done {
                        match break_if {
                            Some(condition) => {
                                let condition = self.expr(state, *condition)?;
                                self.b.branch_conditional(condition, merge, header, [])?;
                            }
                            None => self.b.branch(header)?,
                        }
                    }
                    self.b.begin_block(Some(merge))?;
                }
                Statement::Break => {
                    let Some(&merge) = state.loop_merges.last() else {
                        return Err(state.malformed("break outside of a loop"));
                    };
                    self.b.branch(merge)?;
                    return Ok(true);
                }
                Statement::Return => {
                    self.b.ret()?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn expr(
        &mut self,
        state: &mut FunctionState<'_>,
        handle: Handle<Expression>,
    ) -> Result<Word, SpirvError> {
        if let Some(&id) = state.exprs.get(&handle) {
            return Ok(id);
        }
        let function = state.function;
        let Some(expression) = function.expressions.try_get(handle) else {
            return Err(state.malformed(format!("dangling expression {handle:?}")));
        };
        let id = match *expression {
            Expression::Literal(literal) => self.constant(literal)?,
            Expression::GlobalInvocationId(axis) => {
                if axis > 2 {
                    return Err(state.malformed(format!("invocation id axis {axis}")));
                }
                let u32_ty = self.scalar_type(Scalar::U32)?;
                let id = self.b.load(self.uvec3, None, self.global_id, None, [])?;
                self.b.composite_extract(u32_ty, None, id, [axis])?
            }
            Expression::GlobalVariable(var) => match self.buffers.get(&var) {
                Some(&id) => id,
                None => return Err(state.malformed(format!("dangling global {var:?}"))),
            },
            Expression::LocalVariable(var) => match state.locals.get(&var) {
                Some(&id) => id,
                None => return Err(state.malformed(format!("dangling local {var:?}"))),
            },
            Expression::Load { pointer } => {
                let ty = self.module.resolve_type(function, handle)?;
                let ty = self.value_type(ty)?;
                let pointer = self.expr(state, pointer)?;
                self.b.load(ty, None, pointer, None, [])?
            }
            Expression::Access { base, index } => {
                let scalar = self.module.resolve_type(function, handle)?.scalar();
                let element = self.scalar_type(scalar)?;
                let ptr = self
                    .b
                    .type_pointer(None, spirv::StorageClass::StorageBuffer, element);
                let zero = self.constant(Literal::U32(0))?;
                let base = self.expr(state, base)?;
                let index = self.expr(state, index)?;
                self.b.access_chain(ptr, None, base, [zero, index])?
            }
            Expression::Binary { op, left, right } => {
                let scalar = self.module.resolve_type(function, left)?.scalar();
                let left = self.expr(state, left)?;
                let right = self.expr(state, right)?;
                self.binary(op, scalar, left, right)?
            }
            Expression::Select {
                condition,
                accept,
                reject,
            } => {
                let ty = self.module.resolve_type(function, handle)?;
                let ty = self.value_type(ty)?;
                let condition = self.expr(state, condition)?;
                let accept = self.expr(state, accept)?;
                let reject = self.expr(state, reject)?;
                self.b.select(ty, None, condition, accept, reject)?
            }
            Expression::Math { fun, arg, arg1 } => {
                let scalar = self.module.resolve_type(function, arg)?.scalar();
                let ty = self.scalar_type(scalar)?;
                let instruction = match (fun, scalar.kind) {
                    (MathFunction::Min, ScalarKind::Float) => glsl::F_MIN,
                    (MathFunction::Min, ScalarKind::Uint) => glsl::U_MIN,
                    (MathFunction::Min, ScalarKind::Sint) => glsl::S_MIN,
                    (MathFunction::Max, ScalarKind::Float) => glsl::F_MAX,
                    (MathFunction::Max, ScalarKind::Uint) => glsl::U_MAX,
                    (MathFunction::Max, ScalarKind::Sint) => glsl::S_MAX,
                    (_, ScalarKind::Bool) => {
                        return Err(state.malformed(format!("{fun:?} on booleans")));
                    }
                };
                let arg = self.expr(state, arg)?;
                let arg1 = self.expr(state, arg1)?;
                self.b.ext_inst(
                    ty,
                    None,
                    self.glsl,
                    instruction,
                    [Operand::IdRef(arg), Operand::IdRef(arg1)],
                )?
            }
        };
        state.exprs.insert(handle, id);
        Ok(id)
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        scalar: Scalar,
        left: Word,
        right: Word,
    ) -> Result<Word, SpirvError> {
        use ScalarKind::{Bool, Float, Sint};

        let ty = self.scalar_type(scalar)?;
        let bool_ty = self.scalar_type(Scalar::BOOL)?;
        let b = &mut self.b;
        let id = match (op, scalar.kind) {
            (BinaryOp::Add, Float) => b.f_add(ty, None, left, right)?,
            (BinaryOp::Add, _) => b.i_add(ty, None, left, right)?,
            (BinaryOp::Subtract, Float) => b.f_sub(ty, None, left, right)?,
            (BinaryOp::Subtract, _) => b.i_sub(ty, None, left, right)?,
            (BinaryOp::Multiply, Float) => b.f_mul(ty, None, left, right)?,
            (BinaryOp::Multiply, _) => b.i_mul(ty, None, left, right)?,
            (BinaryOp::Divide, Float) => b.f_div(ty, None, left, right)?,
            (BinaryOp::Divide, Sint) => b.s_div(ty, None, left, right)?,
            (BinaryOp::Divide, _) => b.u_div(ty, None, left, right)?,
            (BinaryOp::Modulo, Float) => b.f_rem(ty, None, left, right)?,
            (BinaryOp::Modulo, Sint) => b.s_rem(ty, None, left, right)?,
            (BinaryOp::Modulo, _) => b.u_mod(ty, None, left, right)?,
            (BinaryOp::Equal, Float) => b.f_ord_equal(bool_ty, None, left, right)?,
            (BinaryOp::Equal, Bool) => b.logical_equal(bool_ty, None, left, right)?,
            (BinaryOp::Equal, _) => b.i_equal(bool_ty, None, left, right)?,
            (BinaryOp::Less, Float) => b.f_ord_less_than(bool_ty, None, left, right)?,
            (BinaryOp::Less, Sint) => b.s_less_than(bool_ty, None, left, right)?,
            (BinaryOp::Less, _) => b.u_less_than(bool_ty, None, left, right)?,
            (BinaryOp::LessEqual, Float) => b.f_ord_less_than_equal(bool_ty, None, left, right)?,
            (BinaryOp::LessEqual, Sint) => b.s_less_than_equal(bool_ty, None, left, right)?,
            (BinaryOp::LessEqual, _) => b.u_less_than_equal(bool_ty, None, left, right)?,
            (BinaryOp::Greater, Float) => b.f_ord_greater_than(bool_ty, None, left, right)?,
            (BinaryOp::Greater, Sint) => b.s_greater_than(bool_ty, None, left, right)?,
            (BinaryOp::Greater, _) => b.u_greater_than(bool_ty, None, left, right)?,
            (BinaryOp::GreaterEqual, Float) => {
                b.f_ord_greater_than_equal(bool_ty, None, left, right)?
            }
            (BinaryOp::GreaterEqual, Sint) => b.s_greater_than_equal(bool_ty, None, left, right)?,
            (BinaryOp::GreaterEqual, _) => b.u_greater_than_equal(bool_ty, None, left, right)?,
            (BinaryOp::LogicalAnd, _) => b.logical_and(bool_ty, None, left, right)?,
        };
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_ir::kernel::{EntryPoint, ResourceBinding, StorageAccess};

    use crate::builder::FunctionBuilder;

    fn copy_module() -> Module {
        let mut module = Module::default();
        let src = module.add_buffer(
            "src",
            ResourceBinding { set: 0, binding: 0 },
            Scalar::F32,
            StorageAccess::LOAD,
        );
        let dst = module.add_buffer(
            "dst",
            ResourceBinding { set: 0, binding: 1 },
            Scalar::F32,
            StorageAccess::STORE,
        );
        let mut fb = FunctionBuilder::new("copy");
        let gid = fb.global_id(0);
        let bound = fb.u32(64);
        let in_range = fb.binary(BinaryOp::Less, gid, bound);
        fb.begin_if();
        let src = fb.global(src);
        let dst = fb.global(dst);
        let from = fb.element(src, gid);
        let value = fb.load(from);
        let to = fb.element(dst, gid);
        fb.store(to, value);
        fb.end_if(in_range);
        module.entry_points.push(EntryPoint {
            name: "copy".into(),
            workgroup_size: [32, 1, 1],
            function: fb.finish(),
        });
        module
    }

    #[test]
    fn header_carries_magic_and_version() {
        let words = serialize(&copy_module()).unwrap();
        assert_eq!(words[0], spirv::MAGIC_NUMBER);
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words[1], 0x0001_0300);
    }

    #[test]
    fn serialization_is_deterministic() {
        let module = copy_module();
        assert_eq!(serialize(&module).unwrap(), serialize(&module).unwrap());
    }

    #[test]
    fn loops_and_math_serialize() {
        let mut module = Module::default();
        let buf = module.add_buffer(
            "acc",
            ResourceBinding { set: 0, binding: 0 },
            Scalar::I32,
            StorageAccess::LOAD | StorageAccess::STORE,
        );
        let mut fb = FunctionBuilder::new("sum");
        let zero = fb.u32(0);
        let end = fb.u32(8);
        let one = fb.u32(1);
        let buf = fb.global(buf);
        let lp = fb.begin_loop("i", zero, end);
        let slot = fb.element(buf, lp.index);
        let value = fb.load(slot);
        let clamped = fb.math(MathFunction::Max, value, value);
        fb.store(slot, clamped);
        fb.end_loop(lp, one);
        module.entry_points.push(EntryPoint {
            name: "sum".into(),
            workgroup_size: [1, 1, 1],
            function: fb.finish(),
        });
        let words = serialize(&module).unwrap();
        assert!(words.len() > 5);
    }

    #[test]
    fn zero_workgroup_size_is_rejected() {
        let mut module = copy_module();
        module.entry_points[0].workgroup_size = [0, 1, 1];
        assert!(matches!(
            serialize(&module),
            Err(SpirvError::Malformed { .. })
        ));
    }

    #[test]
    fn half_precision_buffers_are_rejected() {
        let mut module = Module::default();
        module.add_buffer(
            "h",
            ResourceBinding { set: 0, binding: 0 },
            Scalar::F16,
            StorageAccess::LOAD,
        );
        assert!(matches!(
            serialize(&module),
            Err(SpirvError::UnsupportedScalar(s)) if s == Scalar::F16
        ));
    }

    #[test]
    fn bytes_are_little_endian_words() {
        assert_eq!(words_to_bytes(&[0x0723_0203]), vec![0x03, 0x02, 0x23, 0x07]);
    }
}
