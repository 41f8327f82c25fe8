mod common;

use std::sync::Arc;

use common::{binary, executable, reduction, translate};
use halo_backend_core::executable as hal;
use halo_backend_core::{
    ExecutableTargetOptions, TargetError, TargetRegistry, translate_executables,
};
use halo_backend_vulkan::executable::{ExecutableError, pack, unpack};
use halo_backend_vulkan::proto::SpirVExecutableDef;
use halo_backend_vulkan::{TARGET_NAME, VulkanSpirvTarget, VulkanSpirvTargetOptions};
use halo_ir::{BinaryOp, Context, Location, OpKind, names};
use halo_opt::PassError;

const ADD: OpKind = OpKind::Elementwise(BinaryOp::Add);

#[test]
fn rank_one_reduction_fails_without_artifacts() {
    let mut ctx = Context::new();
    let exe = executable(
        &mut ctx,
        &[reduction("total", &[16], 0, "sum")],
        &[("sum", BinaryOp::Add)],
    );
    let err = translate(&mut ctx, exe, VulkanSpirvTargetOptions::default()).unwrap_err();
    match &err {
        TargetError::Pass(pass) => {
            assert_eq!(pass.location(), Some(&Location::Name("total".into())));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(hal::binaries(&ctx, exe).is_empty());
}

#[test]
fn dispatches_without_a_lowering_are_unsupported() {
    let mut ctx = Context::new();
    let exe = executable(&mut ctx, &[binary("dot", OpKind::Dot, [&[8], &[8], &[8]])], &[]);
    let err = translate(&mut ctx, exe, VulkanSpirvTargetOptions::default()).unwrap_err();
    assert!(matches!(err, TargetError::Pass(PassError::Unsupported { .. })), "{err}");
    let entry = hal::entry_points(&ctx, exe)[0];
    assert!(!ctx.op(entry).has_attr(names::WORKGROUP_SIZE));
}

#[test]
fn entries_without_functions_are_reported() {
    let mut ctx = Context::new();
    let exe = executable(&mut ctx, &[binary("add", ADD, [&[4], &[4], &[4]])], &[]);
    let entry = hal::entry_points(&ctx, exe)[0];
    ctx.op_mut(entry)
        .set_attr(names::SYM_NAME, halo_ir::Attribute::Str("missing".into()));
    let err = translate(&mut ctx, exe, VulkanSpirvTargetOptions::default()).unwrap_err();
    assert!(matches!(err, TargetError::MissingSource { .. }));
    assert!(err.to_string().contains("'missing'"));
}

#[test]
fn unknown_targets_fail_but_others_still_run() {
    let mut ctx = Context::new();
    let exe = executable(&mut ctx, &[binary("add", ADD, [&[4], &[4], &[4]])], &[]);
    let registry = TargetRegistry::new();
    registry.register(Arc::new(VulkanSpirvTarget::default()));

    let options = ExecutableTargetOptions::new(["nope", TARGET_NAME]);
    let err = translate_executables(&mut ctx, &registry, &options).unwrap_err();
    assert!(matches!(err, TargetError::UnknownTarget(ref name) if name == "nope"));
    assert_eq!(hal::binaries(&ctx, exe).len(), 1);
}

#[test]
fn failing_target_does_not_block_the_next_executable() {
    let mut ctx = Context::new();
    let bad = executable(&mut ctx, &[binary("dot", OpKind::Dot, [&[8], &[8], &[8]])], &[]);
    let good = executable(&mut ctx, &[binary("add", ADD, [&[4], &[4], &[4]])], &[]);
    let registry = TargetRegistry::new();
    registry.register(Arc::new(VulkanSpirvTarget::default()));

    let err = translate_executables(&mut ctx, &registry, &ExecutableTargetOptions::new([TARGET_NAME]))
        .unwrap_err();
    assert!(matches!(err, TargetError::Failed { ref target, .. } if target == TARGET_NAME));
    assert!(hal::binaries(&ctx, bad).is_empty());
    assert_eq!(hal::binaries(&ctx, good).len(), 1);
}

#[test]
fn corrupted_records_are_rejected() {
    let def = SpirVExecutableDef {
        entry_points: vec!["main".into()],
        code: vec![0x0723_0203],
        ..Default::default()
    };
    let bytes = pack(&def).unwrap();
    assert_eq!(unpack(&bytes).unwrap(), def);

    assert!(matches!(unpack(b"HSPV"), Err(ExecutableError::Truncated(4))));
    let mut wrong_magic = bytes.clone();
    wrong_magic[..4].copy_from_slice(b"SPV!");
    assert!(matches!(unpack(&wrong_magic), Err(ExecutableError::BadMagic(_))));
    let mut extended = bytes;
    extended.push(0);
    assert!(matches!(
        unpack(&extended),
        Err(ExecutableError::LengthMismatch { .. })
    ));
}
