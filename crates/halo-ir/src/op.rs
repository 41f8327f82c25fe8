//! Operations, blocks, regions and SSA values.

use std::collections::BTreeMap;
use std::fmt;

use crate::arena::Handle;
use crate::attr::{Attribute, names};
use crate::kernel;
use crate::types::Type;

/// An SSA value: an operation result or a block argument.
pub type Value = Handle<ValueData>;

/// Where a value comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueDef {
    Result { op: Handle<Operation>, index: u32 },
    Argument { block: Handle<Block>, index: u32 },
}

/// Storage for one SSA value.
#[derive(Clone, Debug)]
pub struct ValueData {
    pub ty: Handle<Type>,
    pub def: ValueDef,
}

/// Source location attached to operations for diagnostics.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Location {
    #[default]
    Unknown,
    FileLineCol {
        file: String,
        line: u32,
        column: u32,
    },
    Name(String),
}

impl Location {
    pub fn file(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self::FileLineCol {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("<unknown>"),
            Self::FileLineCol { file, line, column } => write!(f, "{file}:{line}:{column}"),
            Self::Name(name) => write!(f, "\"{name}\""),
        }
    }
}

/// Scalar or element-wise binary arithmetic.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// The operation set understood by the pipeline.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum OpKind {
    /// `builtin.module`: one region, one block of top-level ops.
    Module,
    /// `func.func`: `sym_name`, `function_type`, one (possibly empty) region.
    Func,
    /// `func.return`.
    Return,

    /// `hlo.reduce`: operands are N inputs followed by N initial values.
    Reduce,
    /// `hlo.<op>` on tensors.
    Elementwise(BinaryOp),
    /// `hlo.dot`.
    Dot,
    /// `hlo.conv`.
    Conv,
    /// `hlo.return`, terminator of `hlo.reduce` bodies.
    HloReturn,

    /// `flow.reduction_region`: regions are `[dispatch, invocation]`.
    ReductionRegion,
    /// `flow.return`.
    FlowReturn,
    /// `flow.executable`: entry ops followed by an inner `builtin.module`.
    FlowExecutable,
    /// `flow.dispatch.entry`.
    DispatchEntry,
    /// `flow.reduction.entry`.
    ReductionEntry,

    /// `mem.load %buffer[%indices...]`.
    Load,
    /// `mem.store %value, %buffer[%indices...]`.
    Store,
    /// `mem.copy %src, %src_indices, %dst, %dst_indices, %lengths`.
    Copy,
    /// `mem.shape_of %value`: a rank-length index buffer of extents.
    ShapeOf,
    /// `mem.index_buffer`: a constant index buffer (`value` is an int list).
    IndexBuffer,
    /// `mem.load_input %buffer`: reads a whole buffer as a tensor.
    LoadInput,
    /// `mem.store_output %tensor, %buffer`.
    StoreOutput,
    /// `mem.store_reduce %tensor, %buffer`.
    StoreReduce,

    /// `arith.constant` with a scalar `value`.
    Constant,
    /// `arith.index` with an integer `value`.
    ConstantIndex,
    /// `arith.<op>` on scalars.
    Arith(BinaryOp),
    /// `arith.cmp_eq`.
    CmpEq,
    /// `arith.select %cond, %true, %false`.
    Select,

    /// `linalg.indexed_generic`.
    IndexedGeneric,
    /// `linalg.yield`.
    Yield,

    /// `loop.for %lb, %ub, %step`: one region whose block takes the induction variable.
    For,
    /// `loop.yield`.
    LoopYield,

    /// `gpu.launch`: operands are captured values, mirrored by the body's arguments.
    Launch,
    /// `gpu.terminator`.
    LaunchTerminator,
    /// `gpu.global_id` along `dimension`.
    GlobalId,
    /// `gpu.module`: holds outlined kernel functions.
    KernelModule,
    /// `gpu.func`.
    KernelFunc,
    /// `gpu.return`.
    KernelReturn,

    /// `spv.module`: carries a hardware program in [`Operation::program`].
    SpirvModule,

    /// `hal.executable`.
    HalExecutable,
    /// `hal.executable.entry_point`.
    HalEntryPoint,
    /// `hal.executable.binary`.
    HalBinary,
}

impl OpKind {
    /// Dialect-qualified operation name.
    pub fn name(self) -> String {
        let fixed = match self {
            Self::Module => "builtin.module",
            Self::Func => "func.func",
            Self::Return => "func.return",
            Self::Reduce => "hlo.reduce",
            Self::Elementwise(op) => return format!("hlo.{}", op.mnemonic()),
            Self::Dot => "hlo.dot",
            Self::Conv => "hlo.conv",
            Self::HloReturn => "hlo.return",
            Self::ReductionRegion => "flow.reduction_region",
            Self::FlowReturn => "flow.return",
            Self::FlowExecutable => "flow.executable",
            Self::DispatchEntry => "flow.dispatch.entry",
            Self::ReductionEntry => "flow.reduction.entry",
            Self::Load => "mem.load",
            Self::Store => "mem.store",
            Self::Copy => "mem.copy",
            Self::ShapeOf => "mem.shape_of",
            Self::IndexBuffer => "mem.index_buffer",
            Self::LoadInput => "mem.load_input",
            Self::StoreOutput => "mem.store_output",
            Self::StoreReduce => "mem.store_reduce",
            Self::Constant => "arith.constant",
            Self::ConstantIndex => "arith.index",
            Self::Arith(op) => return format!("arith.{}", op.mnemonic()),
            Self::CmpEq => "arith.cmp_eq",
            Self::Select => "arith.select",
            Self::IndexedGeneric => "linalg.indexed_generic",
            Self::Yield => "linalg.yield",
            Self::For => "loop.for",
            Self::LoopYield => "loop.yield",
            Self::Launch => "gpu.launch",
            Self::LaunchTerminator => "gpu.terminator",
            Self::GlobalId => "gpu.global_id",
            Self::KernelModule => "gpu.module",
            Self::KernelFunc => "gpu.func",
            Self::KernelReturn => "gpu.return",
            Self::SpirvModule => "spv.module",
            Self::HalExecutable => "hal.executable",
            Self::HalEntryPoint => "hal.executable.entry_point",
            Self::HalBinary => "hal.executable.binary",
        };
        fixed.to_string()
    }

    /// Returns `true` for ops that end a block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Return
                | Self::HloReturn
                | Self::FlowReturn
                | Self::Yield
                | Self::LoopYield
                | Self::LaunchTerminator
                | Self::KernelReturn
        )
    }

    /// Returns `true` for return-like terminators that leave a function-like body.
    pub fn is_return_like(self) -> bool {
        matches!(
            self,
            Self::Return | Self::HloReturn | Self::FlowReturn | Self::KernelReturn
        )
    }
}

/// A node of the operation graph.
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OpKind,
    pub location: Location,
    pub operands: Vec<Value>,
    pub results: Vec<Value>,
    pub attributes: BTreeMap<String, Attribute>,
    pub regions: Vec<Handle<Region>>,
    pub parent: Option<Handle<Block>>,
    /// Hardware program owned by `spv.module`.
    pub program: Option<Box<kernel::Module>>,
}

impl Operation {
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: Attribute) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.remove(name)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Attribute::as_int)
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Attribute::as_str)
    }

    pub fn symbol_attr(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Attribute::as_symbol)
    }

    pub fn int_list_attr(&self, name: &str) -> Option<&[i64]> {
        self.attr(name).and_then(Attribute::as_int_list)
    }

    /// The `sym_name` of a symbol-defining op.
    pub fn sym_name(&self) -> Option<&str> {
        self.str_attr(names::SYM_NAME)
    }
}

/// An ordered list of operations with typed arguments.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub arguments: Vec<Value>,
    pub ops: Vec<Handle<Operation>>,
    pub parent: Option<Handle<Region>>,
}

/// A list of blocks nested under an operation.
#[derive(Clone, Debug, Default)]
pub struct Region {
    pub blocks: Vec<Handle<Block>>,
    pub parent: Option<Handle<Operation>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_dialect_qualified() {
        assert_eq!(OpKind::Reduce.name(), "hlo.reduce");
        assert_eq!(OpKind::Elementwise(BinaryOp::Max).name(), "hlo.max");
        assert_eq!(OpKind::Arith(BinaryOp::Add).name(), "arith.add");
        assert_eq!(OpKind::ReductionRegion.name(), "flow.reduction_region");
    }

    #[test]
    fn terminator_classification() {
        assert!(OpKind::Yield.is_terminator());
        assert!(OpKind::HloReturn.is_return_like());
        assert!(!OpKind::Yield.is_return_like());
        assert!(!OpKind::Launch.is_terminator());
    }

    #[test]
    fn location_display() {
        assert_eq!(Location::file("model.mlir", 3, 7).to_string(), "model.mlir:3:7");
        assert_eq!(Location::Unknown.to_string(), "<unknown>");
        assert_eq!(Location::Name("reduce".into()).to_string(), "\"reduce\"");
    }
}
