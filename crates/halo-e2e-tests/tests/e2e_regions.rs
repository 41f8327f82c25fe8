use halo_ir::{
    Attribute, BinaryOp, Block, Context, FunctionType, Handle, Location, OpBuilder, OpKind,
    Operation, OperationState, Scalar, Type, Value, names,
};
use halo_opt::{IdentifyReductionRegions, LoadStoreDataFlowOpt, Pass, PassError, PassManager};

/// `hlo.reduce` of `input` along dimension 1 with a `max` combiner.
fn reduce(ctx: &mut Context, block: Handle<Block>, input: Value, init: Value, name: &str) -> Value {
    let scalar = ctx.intern(Type::tensor(&[], Scalar::F32));
    let output = ctx.intern(Type::tensor(&[4], Scalar::F32));
    let reduce = OpBuilder::at_end(ctx, block).insert(
        OperationState::new(OpKind::Reduce, Location::Name(name.into()))
            .operands([input, init])
            .results([output])
            .attr(names::DIMENSIONS, Attribute::IntList(vec![1]))
            .regions(1),
    );
    let region = ctx.op(reduce).regions[0];
    let body = ctx.add_block(region);
    let lhs = ctx.add_argument(body, scalar);
    let rhs = ctx.add_argument(body, scalar);
    let mut b = OpBuilder::at_end(ctx, body);
    let max = b.value(OpKind::Elementwise(BinaryOp::Max), [lhs, rhs], scalar);
    b.terminator(OpKind::HloReturn, [max]);
    ctx.result(reduce, 0)
}

/// A function returning `count` independent reductions named `r0`, `r1`, ...
fn reductions(ctx: &mut Context, count: usize) -> Handle<Operation> {
    let input = ctx.intern(Type::tensor(&[4, 8], Scalar::F32));
    let scalar = ctx.intern(Type::tensor(&[], Scalar::F32));
    let output = ctx.intern(Type::tensor(&[4], Scalar::F32));
    let func = ctx.create_function(
        "main",
        FunctionType {
            inputs: vec![input, scalar],
            results: vec![output; count],
        },
        true,
        Location::Unknown,
    );
    let block = ctx.body(func).unwrap();
    let args = ctx.arguments(func).unwrap();
    let results: Vec<_> = (0..count)
        .map(|i| reduce(ctx, block, args[0], args[1], &format!("r{i}")))
        .collect();
    OpBuilder::at_end(ctx, block).terminator(OpKind::Return, results);
    func
}

#[test]
fn identification_reaches_a_fixed_point() {
    let mut ctx = Context::new();
    reductions(&mut ctx, 3);
    let module = ctx.module();
    let mut pm = PassManager::new();
    pm.enable_verifier(true);
    pm.add_pass(Box::new(IdentifyReductionRegions));

    assert!(pm.run(&mut ctx, module).unwrap());
    let dump = halo_ir::dump(&ctx, module);
    assert!(!pm.run(&mut ctx, module).unwrap());
    assert_eq!(halo_ir::dump(&ctx, module), dump);
}

#[test]
fn regions_capture_operands_and_mirror_results() {
    let mut ctx = Context::new();
    let func = reductions(&mut ctx, 2);
    let module = ctx.module();
    IdentifyReductionRegions.run(&mut ctx, module).unwrap();

    let regions = ctx.collect_kind(func, OpKind::ReductionRegion);
    assert_eq!(regions.len(), 2);
    for region in regions {
        let op = ctx.op(region);
        let dispatch = ctx.region_block(region, 0).unwrap();
        let captured = &ctx.blocks[dispatch].arguments;
        assert_eq!(op.operands.len(), captured.len());

        let root = ctx.blocks[dispatch].ops[0];
        assert_eq!(ctx.op(root).kind, OpKind::Reduce);
        assert_eq!(op.results.len(), ctx.op(root).results.len());
        assert_eq!(op.int_attr(names::NUM_OPERANDS), Some(1));
        assert_eq!(op.int_list_attr(names::DIMENSIONS), Some(&[1][..]));
    }
    assert_eq!(ctx.collect_kind(func, OpKind::Reduce).len(), 2);
}

#[test]
fn later_reductions_are_regionized_first() {
    let mut ctx = Context::new();
    reductions(&mut ctx, 2);
    let module = ctx.module();
    IdentifyReductionRegions.run(&mut ctx, module).unwrap();

    let mut regions = ctx.collect_kind(module, OpKind::ReductionRegion);
    regions.sort_by_key(|r| r.index());
    let created: Vec<_> = regions.iter().map(|&r| ctx.op(r).location.clone()).collect();
    assert_eq!(
        created,
        vec![Location::Name("r1".into()), Location::Name("r0".into())]
    );
}

/// `%x = mem.load %a[..]; mem.store %x, %b[..]` with `indices` load indices.
fn load_store(ctx: &mut Context, indices: usize) -> Handle<Operation> {
    let buffer = ctx.intern(Type::memref(&[4, 4], Scalar::F32));
    let index = ctx.intern(Type::Index);
    let element = ctx.intern(Type::Scalar(Scalar::F32));
    let func = ctx.create_function(
        "copy",
        FunctionType {
            inputs: vec![buffer, buffer, index, index],
            results: vec![],
        },
        true,
        Location::Unknown,
    );
    let block = ctx.body(func).unwrap();
    let args = ctx.arguments(func).unwrap();
    let mut b = OpBuilder::at_end(ctx, block);
    let x = b.value(
        OpKind::Load,
        [args[0], args[2], args[3]].into_iter().take(1 + indices),
        element,
    );
    b.insert(OperationState::new(OpKind::Store, Location::Unknown).operands([x, args[1], args[3]]));
    b.terminator(OpKind::Return, []);
    func
}

#[test]
fn single_index_load_store_becomes_one_copy() {
    let mut ctx = Context::new();
    let func = load_store(&mut ctx, 1);
    let module = ctx.module();
    assert!(LoadStoreDataFlowOpt.run(&mut ctx, module).unwrap());

    let copies = ctx.collect_kind(func, OpKind::Copy);
    assert_eq!(copies.len(), 1);
    assert!(ctx.collect_kind(func, OpKind::Load).is_empty());
    assert!(ctx.collect_kind(func, OpKind::Store).is_empty());

    let args = ctx.arguments(func).unwrap();
    let copy = ctx.op(copies[0]);
    assert_eq!(copy.operands[0], args[0]);
    assert_eq!(copy.operands[1], args[2]);
    assert_eq!(copy.operands[2], args[1]);
    assert_eq!(copy.operands[3], args[3]);
    let length = ctx.defining_op(copy.operands[4]).unwrap();
    assert_eq!(ctx.op(length).int_list_attr(names::VALUE), Some(&[1][..]));
}

#[test]
fn two_index_load_is_left_alone() {
    let mut ctx = Context::new();
    let func = load_store(&mut ctx, 2);
    let module = ctx.module();
    let before = halo_ir::dump(&ctx, func);
    let err = LoadStoreDataFlowOpt.run(&mut ctx, module).unwrap_err();
    assert!(matches!(err, PassError::Unsupported { .. }));
    assert_eq!(halo_ir::dump(&ctx, func), before);
}
