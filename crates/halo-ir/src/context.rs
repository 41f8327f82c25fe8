//! Ownership of the operation graph and its mutation primitives.

use std::collections::HashMap;

use crate::arena::{Arena, Handle, UniqueArena};
use crate::attr::{Attribute, FunctionType, names};
use crate::error::IrError;
use crate::op::{Block, Location, OpKind, Operation, Region, Value, ValueData, ValueDef};
use crate::types::Type;

/// Description of an operation to be created.
#[derive(Clone, Debug)]
pub struct OperationState {
    pub kind: OpKind,
    pub location: Location,
    pub operands: Vec<Value>,
    pub result_types: Vec<Handle<Type>>,
    pub attributes: Vec<(String, Attribute)>,
    pub num_regions: usize,
}

impl OperationState {
    pub fn new(kind: OpKind, location: Location) -> Self {
        Self {
            kind,
            location,
            operands: Vec::new(),
            result_types: Vec::new(),
            attributes: Vec::new(),
            num_regions: 0,
        }
    }

    pub fn operands(mut self, operands: impl IntoIterator<Item = Value>) -> Self {
        self.operands.extend(operands);
        self
    }

    pub fn results(mut self, types: impl IntoIterator<Item = Handle<Type>>) -> Self {
        self.result_types.extend(types);
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.attributes.push((name.into(), value));
        self
    }

    pub fn regions(mut self, count: usize) -> Self {
        self.num_regions = count;
        self
    }
}

/// Old-to-new value mapping used while cloning.
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    map: HashMap<Value, Value>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: Value, to: Value) {
        self.map.insert(from, to);
    }

    pub fn get(&self, value: Value) -> Option<Value> {
        self.map.get(&value).copied()
    }

    /// The mapped value, or `value` itself when unmapped.
    pub fn lookup_or_default(&self, value: Value) -> Value {
        self.get(value).unwrap_or(value)
    }
}

/// An operation graph rooted at a `builtin.module`.
///
/// Cloning a context yields a fully independent copy with identical handles.
#[derive(Clone, Debug)]
pub struct Context {
    pub types: UniqueArena<Type>,
    pub ops: Arena<Operation>,
    pub blocks: Arena<Block>,
    pub regions: Arena<Region>,
    pub values: Arena<ValueData>,
    module: Handle<Operation>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context holding an empty top-level module.
    pub fn new() -> Self {
        let mut ctx = Self {
            types: UniqueArena::new(),
            ops: Arena::new(),
            blocks: Arena::new(),
            regions: Arena::new(),
            values: Arena::new(),
            module: Handle::new(0),
        };
        ctx.module = ctx.create_op(OperationState::new(OpKind::Module, Location::Unknown).regions(1));
        let region = ctx.ops[ctx.module].regions[0];
        ctx.add_block(region);
        ctx
    }

    /// The top-level `builtin.module`.
    pub fn module(&self) -> Handle<Operation> {
        self.module
    }

    /// The single block of the top-level module.
    pub fn module_body(&self) -> Handle<Block> {
        let region = self.ops[self.module].regions[0];
        self.regions[region].blocks[0]
    }

    pub fn intern(&mut self, ty: Type) -> Handle<Type> {
        self.types.insert(ty)
    }

    pub fn op(&self, op: Handle<Operation>) -> &Operation {
        &self.ops[op]
    }

    pub fn op_mut(&mut self, op: Handle<Operation>) -> &mut Operation {
        &mut self.ops[op]
    }

    pub fn is_live(&self, op: Handle<Operation>) -> bool {
        self.ops.contains(op)
    }

    pub fn value_type(&self, value: Value) -> &Type {
        &self.types[self.values[value].ty]
    }

    pub fn value_type_handle(&self, value: Value) -> Handle<Type> {
        self.values[value].ty
    }

    /// The operation producing `value`, if it is an op result.
    pub fn defining_op(&self, value: Value) -> Option<Handle<Operation>> {
        match self.values.try_get(value)?.def {
            ValueDef::Result { op, .. } => Some(op),
            ValueDef::Argument { .. } => None,
        }
    }

    /// The `index`-th result of `op`.
    pub fn result(&self, op: Handle<Operation>, index: usize) -> Value {
        self.ops[op].results[index]
    }

    /// The entry block of region `index` of `op`.
    pub fn region_block(&self, op: Handle<Operation>, index: usize) -> Result<Handle<Block>, IrError> {
        let operation = self.ops.try_get(op).ok_or(IrError::DeadHandle {
            kind: "operation",
            index: op.index(),
        })?;
        let region = *operation.regions.get(index).ok_or_else(|| IrError::MissingRegion {
            op: operation.kind.name(),
            index,
        })?;
        self.regions[region]
            .blocks
            .first()
            .copied()
            .ok_or_else(|| IrError::MissingBlock {
                op: operation.kind.name(),
            })
    }

    /// The entry block of the first region of `op`.
    pub fn body(&self, op: Handle<Operation>) -> Result<Handle<Block>, IrError> {
        self.region_block(op, 0)
    }

    /// Creates a detached operation with fresh results and empty regions.
    pub fn create_op(&mut self, state: OperationState) -> Handle<Operation> {
        let handle = self.ops.next_handle();
        let results = state
            .result_types
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                self.values.append(ValueData {
                    ty,
                    def: ValueDef::Result {
                        op: handle,
                        index: index as u32,
                    },
                })
            })
            .collect();
        let op = self.ops.append(Operation {
            kind: state.kind,
            location: state.location,
            operands: state.operands,
            results,
            attributes: state.attributes.into_iter().collect(),
            regions: Vec::new(),
            parent: None,
            program: None,
        });
        debug_assert_eq!(op, handle);
        for _ in 0..state.num_regions {
            self.add_region(op);
        }
        op
    }

    /// Appends an empty region to `op`.
    pub fn add_region(&mut self, op: Handle<Operation>) -> Handle<Region> {
        let region = self.regions.append(Region {
            blocks: Vec::new(),
            parent: Some(op),
        });
        self.ops[op].regions.push(region);
        region
    }

    /// Appends an empty block to `region`.
    pub fn add_block(&mut self, region: Handle<Region>) -> Handle<Block> {
        let block = self.blocks.append(Block {
            arguments: Vec::new(),
            ops: Vec::new(),
            parent: Some(region),
        });
        self.regions[region].blocks.push(block);
        block
    }

    /// Appends a typed argument to `block`.
    pub fn add_argument(&mut self, block: Handle<Block>, ty: Handle<Type>) -> Value {
        let index = self.blocks[block].arguments.len() as u32;
        let value = self.values.append(ValueData {
            ty,
            def: ValueDef::Argument { block, index },
        });
        self.blocks[block].arguments.push(value);
        value
    }

    /// Inserts a detached `op` into `block` at `index`.
    pub fn insert_op(&mut self, block: Handle<Block>, index: usize, op: Handle<Operation>) {
        self.blocks[block].ops.insert(index, op);
        self.ops[op].parent = Some(block);
    }

    /// Appends a detached `op` at the end of `block`.
    pub fn append_op(&mut self, block: Handle<Block>, op: Handle<Operation>) {
        let index = self.blocks[block].ops.len();
        self.insert_op(block, index, op);
    }

    /// The block holding `op` and its position in it.
    pub fn position(&self, op: Handle<Operation>) -> Option<(Handle<Block>, usize)> {
        let block = self.ops.try_get(op)?.parent?;
        let index = self.blocks[block].ops.iter().position(|&o| o == op)?;
        Some((block, index))
    }

    /// Removes `op` from its block without destroying it.
    pub fn detach_op(&mut self, op: Handle<Operation>) {
        if let Some((block, index)) = self.position(op) {
            self.blocks[block].ops.remove(index);
        }
        self.ops[op].parent = None;
    }

    /// The operation owning the block that holds `op`.
    pub fn parent_op(&self, op: Handle<Operation>) -> Option<Handle<Operation>> {
        let block = self.ops.try_get(op)?.parent?;
        self.block_owner(block)
    }

    /// The operation owning `block`.
    pub fn block_owner(&self, block: Handle<Block>) -> Option<Handle<Operation>> {
        let region = self.blocks.try_get(block)?.parent?;
        self.regions.try_get(region)?.parent
    }

    /// The closest enclosing operation of the given kind.
    pub fn ancestor_of_kind(&self, op: Handle<Operation>, kind: OpKind) -> Option<Handle<Operation>> {
        let mut current = self.parent_op(op);
        while let Some(parent) = current {
            if self.ops[parent].kind == kind {
                return Some(parent);
            }
            current = self.parent_op(parent);
        }
        None
    }

    /// Detaches `op` and tombstones it with everything nested under it.
    pub fn erase_op(&mut self, op: Handle<Operation>) {
        if !self.ops.contains(op) {
            return;
        }
        self.detach_op(op);
        self.erase_recursive(op);
    }

    fn erase_recursive(&mut self, op: Handle<Operation>) {
        let Some(operation) = self.ops.remove(op) else {
            return;
        };
        for value in operation.results {
            self.values.remove(value);
        }
        for region in operation.regions {
            self.erase_region_contents(region);
            self.regions.remove(region);
        }
    }

    /// Tombstones every block of `region`, leaving the region empty.
    pub fn erase_region_contents(&mut self, region: Handle<Region>) {
        let blocks = std::mem::take(&mut self.regions[region].blocks);
        for block in blocks {
            if let Some(data) = self.blocks.remove(block) {
                for nested in data.ops {
                    self.erase_recursive(nested);
                }
                for arg in data.arguments {
                    self.values.remove(arg);
                }
            }
        }
    }

    /// Rewrites every operand use of `from` to `to`, returning the number of rewrites.
    pub fn replace_all_uses_with(&mut self, from: Value, to: Value) -> usize {
        let mut count = 0;
        for (_, op) in self.ops.iter_mut() {
            for operand in op.operands.iter_mut().filter(|o| **o == from) {
                *operand = to;
                count += 1;
            }
        }
        count
    }

    pub fn has_uses(&self, value: Value) -> bool {
        self.ops.iter().any(|(_, op)| op.operands.contains(&value))
    }

    /// Pre-order snapshot of `root` and every operation nested under it.
    pub fn walk(&self, root: Handle<Operation>) -> Vec<Handle<Operation>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(op) = stack.pop() {
            let Some(operation) = self.ops.try_get(op) else {
                continue;
            };
            out.push(op);
            let mut nested = Vec::new();
            for &region in &operation.regions {
                for &block in &self.regions[region].blocks {
                    nested.extend(self.blocks[block].ops.iter().copied());
                }
            }
            stack.extend(nested.into_iter().rev());
        }
        out
    }

    /// Snapshot of the operations nested under `root` with the given kind.
    pub fn collect_kind(&self, root: Handle<Operation>, kind: OpKind) -> Vec<Handle<Operation>> {
        self.walk(root)
            .into_iter()
            .filter(|&op| self.ops[op].kind == kind)
            .collect()
    }

    /// Deep-copies `op` as a detached operation, remapping operands through `map`.
    pub fn clone_op(&mut self, op: Handle<Operation>, map: &mut ValueMap) -> Handle<Operation> {
        let source = self.ops[op].clone();
        let state = OperationState {
            kind: source.kind,
            location: source.location.clone(),
            operands: source
                .operands
                .iter()
                .map(|&v| map.lookup_or_default(v))
                .collect(),
            result_types: source.results.iter().map(|&v| self.values[v].ty).collect(),
            attributes: source.attributes.clone().into_iter().collect(),
            num_regions: 0,
        };
        let cloned = self.create_op(state);
        self.ops[cloned].program = source.program.clone();
        for (i, &old) in source.results.iter().enumerate() {
            let new = self.ops[cloned].results[i];
            map.insert(old, new);
        }
        for &region in &source.regions {
            let new_region = self.add_region(cloned);
            self.clone_region_into(region, new_region, map);
        }
        cloned
    }

    /// Appends deep copies of the blocks of `source` to `dest`.
    pub fn clone_region_into(
        &mut self,
        source: Handle<Region>,
        dest: Handle<Region>,
        map: &mut ValueMap,
    ) {
        let blocks = self.regions[source].blocks.clone();
        let mut pairs = Vec::with_capacity(blocks.len());
        for block in blocks {
            let new_block = self.add_block(dest);
            for arg in self.blocks[block].arguments.clone() {
                let ty = self.values[arg].ty;
                let new_arg = self.add_argument(new_block, ty);
                map.insert(arg, new_arg);
            }
            pairs.push((block, new_block));
        }
        for (block, new_block) in pairs {
            for op in self.blocks[block].ops.clone() {
                let cloned = self.clone_op(op, map);
                self.append_op(new_block, cloned);
            }
        }
    }

    /// The signature of a function-like op.
    pub fn function_type(&self, func: Handle<Operation>) -> Result<&FunctionType, IrError> {
        let op = &self.ops[func];
        op.attr(names::FUNCTION_TYPE)
            .and_then(Attribute::as_function_type)
            .ok_or_else(|| IrError::MissingAttribute {
                op: op.kind.name(),
                name: names::FUNCTION_TYPE.into(),
            })
    }

    /// Returns `true` if the function-like op has no body.
    pub fn is_declaration(&self, func: Handle<Operation>) -> bool {
        self.ops[func]
            .regions
            .first()
            .is_none_or(|&r| self.regions[r].blocks.is_empty())
    }

    /// Entry block arguments of a function-like op.
    pub fn arguments(&self, func: Handle<Operation>) -> Result<Vec<Value>, IrError> {
        Ok(self.blocks[self.body(func)?].arguments.clone())
    }

    /// Creates a `func.func` at the end of the module body.
    ///
    /// With `define`, the body gets an entry block whose arguments follow the
    /// signature's inputs.
    pub fn create_function(
        &mut self,
        name: &str,
        signature: FunctionType,
        define: bool,
        location: Location,
    ) -> Handle<Operation> {
        let inputs = signature.inputs.clone();
        let func = self.create_op(
            OperationState::new(OpKind::Func, location)
                .attr(names::SYM_NAME, Attribute::Str(name.to_string()))
                .attr(names::FUNCTION_TYPE, Attribute::FunctionType(signature))
                .regions(1),
        );
        if define {
            let region = self.ops[func].regions[0];
            let block = self.add_block(region);
            for ty in inputs {
                self.add_argument(block, ty);
            }
        }
        let body = self.module_body();
        self.append_op(body, func);
        func
    }

    /// The last operation of `block`, if it is a terminator.
    pub fn terminator(&self, block: Handle<Block>) -> Option<Handle<Operation>> {
        let last = *self.blocks[block].ops.last()?;
        self.ops[last].kind.is_terminator().then_some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::OpBuilder;
    use crate::op::BinaryOp;
    use crate::types::Scalar;

    fn add_function(ctx: &mut Context) -> (Handle<Operation>, Handle<Operation>) {
        let t = ctx.intern(Type::tensor(&[4], Scalar::F32));
        let func = ctx.create_function(
            "add",
            FunctionType {
                inputs: vec![t, t],
                results: vec![t],
            },
            true,
            Location::Unknown,
        );
        let block = ctx.body(func).unwrap();
        let args = ctx.blocks[block].arguments.clone();
        let mut b = OpBuilder::at_end(ctx, block);
        let sum = b.insert(
            OperationState::new(OpKind::Elementwise(BinaryOp::Add), Location::Unknown)
                .operands(args)
                .results([t]),
        );
        let value = b.ctx.result(sum, 0);
        b.insert(OperationState::new(OpKind::Return, Location::Unknown).operands([value]));
        (func, sum)
    }

    #[test]
    fn new_context_has_module_body() {
        let ctx = Context::new();
        assert_eq!(ctx.op(ctx.module()).kind, OpKind::Module);
        assert!(ctx.blocks[ctx.module_body()].ops.is_empty());
    }

    #[test]
    fn results_know_their_definition() {
        let mut ctx = Context::new();
        let (func, sum) = add_function(&mut ctx);
        let value = ctx.result(sum, 0);
        assert_eq!(ctx.defining_op(value), Some(sum));
        assert_eq!(ctx.parent_op(sum), Some(func));
        assert_eq!(ctx.ancestor_of_kind(sum, OpKind::Module), Some(ctx.module()));
        assert_eq!(ctx.arguments(func).unwrap().len(), 2);
    }

    #[test]
    fn replace_all_uses_rewrites_operands() {
        let mut ctx = Context::new();
        let (func, sum) = add_function(&mut ctx);
        let args = ctx.arguments(func).unwrap();
        let value = ctx.result(sum, 0);
        assert_eq!(ctx.replace_all_uses_with(value, args[0]), 1);
        assert!(!ctx.has_uses(value));
        assert!(ctx.has_uses(args[0]));
    }

    #[test]
    fn erase_tombstones_nested_ops() {
        let mut ctx = Context::new();
        let (func, sum) = add_function(&mut ctx);
        let value = ctx.result(sum, 0);
        let before = ctx.ops.len();
        ctx.erase_op(func);
        assert!(!ctx.is_live(func));
        assert!(!ctx.is_live(sum));
        assert!(!ctx.values.contains(value));
        assert_eq!(ctx.ops.len(), before - 3);
        assert!(ctx.blocks[ctx.module_body()].ops.is_empty());
    }

    #[test]
    fn clone_op_remaps_nested_values() {
        let mut ctx = Context::new();
        let (func, _) = add_function(&mut ctx);
        let mut map = ValueMap::new();
        let copy = ctx.clone_op(func, &mut map);
        assert_ne!(copy, func);
        assert_eq!(ctx.op(copy).parent, None);

        let old_args = ctx.arguments(func).unwrap();
        let new_args = ctx.arguments(copy).unwrap();
        assert_eq!(map.get(old_args[0]), Some(new_args[0]));

        let copy_block = ctx.body(copy).unwrap();
        let copied_add = ctx.blocks[copy_block].ops[0];
        assert_eq!(ctx.op(copied_add).operands, new_args);
    }

    #[test]
    fn walk_is_preorder() {
        let mut ctx = Context::new();
        let (func, sum) = add_function(&mut ctx);
        let order = ctx.walk(ctx.module());
        assert_eq!(order[0], ctx.module());
        assert_eq!(order[1], func);
        assert_eq!(order[2], sum);
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn cloned_context_is_independent() {
        let mut ctx = Context::new();
        let (func, _) = add_function(&mut ctx);
        let mut copy = ctx.clone();
        copy.erase_op(func);
        assert!(ctx.is_live(func));
        assert!(!copy.is_live(func));
    }
}
